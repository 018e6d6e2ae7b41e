pub mod render;
pub mod session;

pub use session::{SessionDeps, SessionSettings, TrackingSession};
