pub mod geocoder;
pub mod orders;
