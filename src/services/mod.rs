pub mod display_session;
pub mod grab_manager;

pub use display_session::create_display_session;
pub use grab_manager::{GrabManager, GrabPolicy};
