use super::window::WindowId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Класс устройства ввода
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Keyboard,
    Pointer,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Keyboard => write!(f, "keyboard"),
            DeviceClass::Pointer => write!(f, "pointer"),
        }
    }
}

/// Идентификатор устройства (XInput2 deviceid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Список устройств одного класса; обычно это одно master-устройство
pub type DeviceList = SmallVec<[DeviceId; 2]>;

/// Ответ сервера на запрос захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrabStatus {
    Success,
    AlreadyGrabbed,
    InvalidTime,
    NotViewable,
    Frozen,
}

impl GrabStatus {
    pub fn is_success(self) -> bool {
        self == GrabStatus::Success
    }
}

impl fmt::Display for GrabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GrabStatus::Success => "success",
            GrabStatus::AlreadyGrabbed => "already grabbed",
            GrabStatus::InvalidTime => "invalid time",
            GrabStatus::NotViewable => "not viewable",
            GrabStatus::Frozen => "frozen",
        };
        f.write_str(text)
    }
}

/// Какие события доставлять окну во время захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrabEvents {
    /// Нажатие и отпускание клавиш
    Keys,
    /// Набор событий по умолчанию для указателя
    Default,
}

/// Курсор на время захвата указателя
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorChoice {
    Default,
    Invisible,
}

/// Параметры запроса захвата одного устройства
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabRequest {
    pub window: WindowId,
    /// Режим confine: события для своих окон доставляются как обычно
    pub owner_events: bool,
    pub events: GrabEvents,
    pub cursor: CursorChoice,
}

impl GrabRequest {
    /// Клавиатура: без confine, только клавиши
    pub fn keyboard(window: WindowId) -> Self {
        Self {
            window,
            owner_events: false,
            events: GrabEvents::Keys,
            cursor: CursorChoice::Default,
        }
    }

    /// Указатель: confine, курсор скрывается по запросу
    pub fn pointer(window: WindowId, hide_cursor: bool) -> Self {
        Self {
            window,
            owner_events: true,
            events: GrabEvents::Default,
            cursor: if hide_cursor {
                CursorChoice::Invisible
            } else {
                CursorChoice::Default
            },
        }
    }

    pub fn for_class(class: DeviceClass, window: WindowId, hide_cursor: bool) -> Self {
        match class {
            DeviceClass::Keyboard => Self::keyboard(window),
            DeviceClass::Pointer => Self::pointer(window, hide_cursor),
        }
    }
}
