use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Идентификатор окна на стороне сервера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub u32);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Номер экрана, к которому относится окно
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenId(pub u32);

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "screen {}", self.0)
    }
}

#[derive(Debug)]
struct WindowState {
    id: WindowId,
    screen: ScreenId,
    destroyed: AtomicBool,
}

/// Сильная ссылка на окно-цель захвата.
///
/// Окно живо, пока существует хотя бы один `Window` и оно не помечено
/// уничтоженным. Менеджер захвата хранит только `WeakWindow`.
#[derive(Debug, Clone)]
pub struct Window {
    state: Arc<WindowState>,
}

impl Window {
    pub fn new(id: WindowId, screen: ScreenId) -> Self {
        Self {
            state: Arc::new(WindowState {
                id,
                screen,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> WindowId {
        self.state.id
    }

    pub fn screen(&self) -> ScreenId {
        self.state.screen
    }

    pub fn downgrade(&self) -> WeakWindow {
        WeakWindow {
            id: self.state.id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Пометить окно уничтоженным: все слабые ссылки перестают резолвиться
    pub fn mark_destroyed(&self) {
        self.state.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::Acquire)
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Window {}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.screen())
    }
}

/// Слабая ссылка на окно: не продлевает ему жизнь
#[derive(Debug, Clone)]
pub struct WeakWindow {
    id: WindowId,
    state: Weak<WindowState>,
}

impl WeakWindow {
    /// Идентификатор сохраняется и после смерти окна (для логов)
    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Window> {
        let state = self.state.upgrade()?;
        if state.destroyed.load(Ordering::Acquire) {
            return None;
        }
        Some(Window { state })
    }

    pub fn is_alive(&self) -> bool {
        self.upgrade().is_some()
    }

    /// Указывает ли ссылка на то же живое окно
    pub fn points_to(&self, window: &Window) -> bool {
        self.upgrade().is_some_and(|current| current == *window)
    }
}
