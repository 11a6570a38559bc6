use crate::config::{GrabConfig, StatusPolicy};
use crate::error::{GrabError, Result};
use crate::events::{DeviceClass, DeviceList, GrabRequest, GrabStatus, ScreenId, WeakWindow, Window};
use crate::services::display_session::DisplaySession;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Политика повторов и оценки статусов захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabPolicy {
    pub attempts: u32,
    pub retry_interval: Duration,
    pub status_policy: StatusPolicy,
    pub clear_focus: bool,
}

impl Default for GrabPolicy {
    fn default() -> Self {
        Self::from(&GrabConfig::default())
    }
}

impl From<&GrabConfig> for GrabPolicy {
    fn from(config: &GrabConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            retry_interval: config.retry_interval(),
            status_policy: config.status_policy,
            clear_focus: config.clear_focus,
        }
    }
}

/// Цель захвата одного класса устройств
#[derive(Debug, Default)]
pub(super) struct GrabSlot {
    target: Option<WeakWindow>,
    screen: Option<ScreenId>,
}

impl GrabSlot {
    /// Живое окно-цель; уничтоженное окно не возвращается
    pub(super) fn window(&self) -> Option<Window> {
        self.target.as_ref().and_then(WeakWindow::upgrade)
    }

    pub(super) fn screen(&self) -> Option<ScreenId> {
        self.window().and(self.screen)
    }

    pub(super) fn holds(&self, window: &Window) -> bool {
        self.target
            .as_ref()
            .is_some_and(|target| target.points_to(window))
    }

    fn set(&mut self, window: &Window, screen: ScreenId) {
        self.target = Some(window.downgrade());
        self.screen = Some(screen);
    }

    fn clear(&mut self) {
        self.target = None;
        self.screen = None;
    }

    /// Забыть цель, если окно уже уничтожено (захват снят сервером)
    fn prune(&mut self, class: DeviceClass) {
        if let Some(target) = &self.target {
            if !target.is_alive() {
                warn!("Окно {} с захватом {} уничтожено, забываем его", target.id(), class);
                self.clear();
            }
        }
    }
}

/// Состояние менеджера; доступно только под блокировкой
pub(super) struct GrabCore {
    pub(super) session: Box<dyn DisplaySession>,
    pub(super) policy: GrabPolicy,
    pub(super) keyboard: GrabSlot,
    pub(super) pointer: GrabSlot,
    pub(super) pointer_cursor_hidden: bool,
}

impl GrabCore {
    pub(super) fn slot(&self, class: DeviceClass) -> &GrabSlot {
        match class {
            DeviceClass::Keyboard => &self.keyboard,
            DeviceClass::Pointer => &self.pointer,
        }
    }

    fn slot_mut(&mut self, class: DeviceClass) -> &mut GrabSlot {
        match class {
            DeviceClass::Keyboard => &mut self.keyboard,
            DeviceClass::Pointer => &mut self.pointer,
        }
    }

    /// Применить сообщения сервера об уничтоженных окнах к целям захвата
    pub(super) fn observe_destroyed(&mut self) {
        let destroyed = match self.session.take_destroyed() {
            Ok(destroyed) => destroyed,
            Err(e) => {
                debug!("Не удалось получить список уничтоженных окон: {}", e);
                Vec::new()
            }
        };

        for id in destroyed {
            for class in [DeviceClass::Keyboard, DeviceClass::Pointer] {
                if let Some(window) = self.slot(class).window().filter(|w| w.id() == id) {
                    window.mark_destroyed();
                }
            }
        }

        self.keyboard.prune(DeviceClass::Keyboard);
        self.pointer.prune(DeviceClass::Pointer);
    }

    pub(super) fn acquire(
        &mut self,
        class: DeviceClass,
        window: &Window,
        screen: ScreenId,
        hide_cursor: bool,
    ) -> Result<()> {
        let devices = self.session.devices(class)?;
        if devices.is_empty() {
            warn!("Устройства класса {} не найдены, захват считается успешным", class);
        }

        let request = GrabRequest::for_class(class, window.id(), hide_cursor);
        let mut last_status = GrabStatus::Success;
        let mut first_failure = None;
        let mut switched = DeviceList::new();

        for device in devices {
            let status = self.session.grab_device(device, &request)?;
            if status.is_success() {
                switched.push(device);
            } else {
                debug!("{} отказал в захвате для окна {}: {}", device, window, status);
                first_failure.get_or_insert(status);
            }
            last_status = status;
        }

        let verdict = match self.policy.status_policy {
            StatusPolicy::LastWins => Some(last_status).filter(|status| !status.is_success()),
            StatusPolicy::RequireAll => first_failure,
        };

        if let Some(status) = verdict {
            if self.policy.status_policy == StatusPolicy::RequireAll && !switched.is_empty() {
                self.undo_partial(class, &switched);
            }
            return GrabError::denied(class, status);
        }

        let slot = self.slot_mut(class);
        if let Some(previous) = slot.target.as_ref().filter(|t| !t.points_to(window)) {
            debug!("Захват {} переходит от окна {} к {}", class, previous.id(), window);
        }
        slot.set(window, screen);

        if class == DeviceClass::Pointer {
            self.pointer_cursor_hidden = hide_cursor;
        }

        debug!("{} захвачен окном {}", class, window);
        Ok(())
    }

    /// RequireAll: вернуть устройства, успевшие перейти к новому окну
    fn undo_partial(&mut self, class: DeviceClass, switched: &DeviceList) {
        for device in switched {
            if let Err(e) = self.session.ungrab_device(*device) {
                warn!("Не удалось освободить {}: {}", device, e);
            }
        }

        // Часть устройств прежней цели больше ей не принадлежит
        if let Some(previous) = self.slot(class).target.as_ref() {
            warn!(
                "Частичный захват {} отменён, состояние окна {} устарело и сброшено",
                class,
                previous.id()
            );
            self.slot_mut(class).clear();
        }
    }

    pub(super) fn release(&mut self, class: DeviceClass) {
        debug!("Освобождение захвата {}", class);

        match self.session.devices(class) {
            Ok(devices) => {
                for device in devices {
                    if let Err(e) = self.session.ungrab_device(device) {
                        warn!("Не удалось освободить {}: {}", device, e);
                    }
                }
            }
            Err(e) => warn!("Не удалось перечислить устройства {}: {}", class, e),
        }

        self.slot_mut(class).clear();
    }

    pub(super) fn release_all(&mut self) {
        info!("Освобождение всех захватов");

        self.release(DeviceClass::Pointer);
        self.release(DeviceClass::Keyboard);

        if let Err(e) = self.session.sync() {
            warn!("Не удалось синхронизироваться с сервером: {}", e);
        }
        if let Err(e) = self.session.flush() {
            warn!("Не удалось сбросить очередь запросов: {}", e);
        }
    }

    /// Привязать цель к другому дескриптору того же окна без запросов к серверу
    pub(super) fn retarget(&mut self, class: DeviceClass, window: &Window, screen: ScreenId) {
        self.slot_mut(class).set(window, screen);
    }

    pub(super) fn reset_pointer_tracking(&mut self) {
        self.pointer.clear();
    }

    /// Пауза между попытками (блокирует поток)
    pub(super) fn pause(&self) {
        if !self.policy.retry_interval.is_zero() {
            thread::sleep(self.policy.retry_interval);
        }
    }
}

impl Drop for GrabCore {
    fn drop(&mut self) {
        info!("GrabManager завершает работу");
        self.release_all();
    }
}

/// Единственный на процесс менеджер захвата клавиатуры и указателя.
///
/// Клонирование увеличивает счётчик ссылок и возвращает тот же экземпляр.
/// Когда удаляется последний дескриптор, все захваты освобождаются.
#[derive(Clone)]
pub struct GrabManager {
    core: Arc<Mutex<GrabCore>>,
}

impl GrabManager {
    pub fn new(session: Box<dyn DisplaySession>, policy: GrabPolicy) -> Self {
        info!(
            "Инициализация GrabManager (попыток: {}, интервал: {:?}, политика: {:?})",
            policy.attempts, policy.retry_interval, policy.status_policy
        );

        Self {
            core: Arc::new(Mutex::new(GrabCore {
                session,
                policy,
                keyboard: GrabSlot::default(),
                pointer: GrabSlot::default(),
                pointer_cursor_hidden: false,
            })),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, GrabCore> {
        self.core.lock()
    }

    /// Количество живых дескрипторов менеджера
    #[allow(dead_code)]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    #[allow(dead_code)]
    pub fn acquire_keyboard(&self, window: &Window, screen: ScreenId) -> Result<()> {
        let mut core = self.lock();
        core.observe_destroyed();
        core.acquire(DeviceClass::Keyboard, window, screen, false)
    }

    #[allow(dead_code)]
    pub fn acquire_pointer(&self, window: &Window, screen: ScreenId, hide_cursor: bool) -> Result<()> {
        let mut core = self.lock();
        core.observe_destroyed();
        core.acquire(DeviceClass::Pointer, window, screen, hide_cursor)
    }

    #[allow(dead_code)]
    pub fn release_keyboard(&self) {
        self.lock().release(DeviceClass::Keyboard);
    }

    #[allow(dead_code)]
    pub fn release_pointer(&self) {
        self.lock().release(DeviceClass::Pointer);
    }

    /// Освободить оба класса и дождаться, пока сервер это применит
    pub fn release_all(&self) {
        self.lock().release_all();
    }

    /// Забыть цель указателя без запросов к серверу
    #[allow(dead_code)]
    pub fn reset_pointer_tracking(&self) {
        self.lock().reset_pointer_tracking();
    }

    pub fn keyboard_target(&self) -> Option<Window> {
        self.lock().keyboard.window()
    }

    pub fn pointer_target(&self) -> Option<Window> {
        self.lock().pointer.window()
    }

    #[allow(dead_code)]
    pub fn keyboard_screen(&self) -> Option<ScreenId> {
        self.lock().keyboard.screen()
    }

    #[allow(dead_code)]
    pub fn pointer_screen(&self) -> Option<ScreenId> {
        self.lock().pointer.screen()
    }

    #[allow(dead_code)]
    pub fn pointer_cursor_hidden(&self) -> bool {
        self.lock().pointer_cursor_hidden
    }
}
