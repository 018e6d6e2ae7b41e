pub mod location;
pub mod order;
pub mod view;
