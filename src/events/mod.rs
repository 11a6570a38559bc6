pub mod device;
pub mod window;

pub use device::{CursorChoice, DeviceClass, DeviceId, DeviceList, GrabEvents, GrabRequest, GrabStatus};
pub use window::{ScreenId, WeakWindow, Window, WindowId};
