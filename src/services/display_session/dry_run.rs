use crate::error::Result;
use crate::events::{DeviceClass, DeviceId, DeviceList, GrabRequest, GrabStatus, ScreenId, WindowId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::r#trait::DisplaySession;

/// Запрос, полученный эмулированным сервером (журнал для тестов)
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Devices(DeviceClass),
    Grab { device: DeviceId, window: WindowId, status: GrabStatus },
    Ungrab(DeviceId),
    IsGrabbed(DeviceClass),
    GetFocus,
    SetFocus(Option<WindowId>),
    GrabServer,
    UngrabServer,
    Sync,
    Flush,
    TakeDestroyed,
    PointerRoot,
}

impl SessionCall {
    /// Запрос, меняющий состояние захвата устройства
    #[allow(dead_code)]
    pub fn is_device_grab_call(&self) -> bool {
        matches!(self, SessionCall::Grab { .. } | SessionCall::Ungrab(_))
    }
}

/// Правило отказа: следующие `remaining` подходящих запросов получат `status`
#[derive(Debug, Clone)]
struct DenyRule {
    class: Option<DeviceClass>,
    device: Option<DeviceId>,
    window: Option<WindowId>,
    remaining: usize,
    status: GrabStatus,
}

impl DenyRule {
    fn matches(&self, class: DeviceClass, device: DeviceId, window: WindowId) -> bool {
        self.remaining > 0
            && self.class.map_or(true, |c| c == class)
            && self.device.map_or(true, |d| d == device)
            && self.window.map_or(true, |w| w == window)
    }
}

#[derive(Debug)]
struct SimState {
    devices: Vec<(DeviceId, DeviceClass)>,
    grabs: HashMap<DeviceId, WindowId>,
    deny_rules: Vec<DenyRule>,
    focus: Option<WindowId>,
    focus_blocks_keyboard: bool,
    server_grabbed: bool,
    destroyed: Vec<WindowId>,
    root: (WindowId, ScreenId),
    // Столько следующих захватов завершатся ошибкой соединения
    broken_grabs: usize,
    calls: Vec<SessionCall>,
}

impl SimState {
    fn class_of(&self, device: DeviceId) -> Option<DeviceClass> {
        self.devices
            .iter()
            .find(|(id, _)| *id == device)
            .map(|(_, class)| *class)
    }

    fn decide(&mut self, class: DeviceClass, device: DeviceId, window: WindowId) -> GrabStatus {
        if let Some(rule) = self
            .deny_rules
            .iter_mut()
            .find(|rule| rule.matches(class, device, window))
        {
            rule.remaining -= 1;
            return rule.status;
        }

        // Застрявший владелец фокуса не отдаёт клавиатуру
        if class == DeviceClass::Keyboard && self.focus_blocks_keyboard {
            if let Some(owner) = self.focus {
                if owner != window {
                    return GrabStatus::AlreadyGrabbed;
                }
            }
        }

        GrabStatus::Success
    }
}

/// Эмуляция сервера устройств в памяти.
///
/// Используется в режиме `--dry-run` и в тестах. Клон разделяет состояние с
/// оригиналом, поэтому тест может наблюдать за сессией, которой владеет
/// GrabManager.
#[derive(Debug, Clone)]
pub struct DryRunSession {
    state: Arc<Mutex<SimState>>,
}

impl Default for DryRunSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunSession {
    /// Как у X-сервера по умолчанию: master pointer = 2, master keyboard = 3
    pub fn new() -> Self {
        Self::with_devices(vec![
            (DeviceId(2), DeviceClass::Pointer),
            (DeviceId(3), DeviceClass::Keyboard),
        ])
    }

    pub fn with_devices(devices: Vec<(DeviceId, DeviceClass)>) -> Self {
        info!("Инициализация DryRunSession ({} устройств)", devices.len());
        Self {
            state: Arc::new(Mutex::new(SimState {
                devices,
                grabs: HashMap::new(),
                deny_rules: Vec::new(),
                focus: None,
                focus_blocks_keyboard: false,
                server_grabbed: false,
                destroyed: Vec::new(),
                root: (WindowId(0x1e3), ScreenId(0)),
                broken_grabs: 0,
                calls: Vec::new(),
            })),
        }
    }

    fn record(state: &mut SimState, call: SessionCall) {
        state.calls.push(call);
    }
}

#[cfg(test)]
impl DryRunSession {
    /// Отказывать следующим `times` захватам класса
    pub fn deny(&self, class: DeviceClass, times: usize, status: GrabStatus) {
        self.state.lock().deny_rules.push(DenyRule {
            class: Some(class),
            device: None,
            window: None,
            remaining: times,
            status,
        });
    }

    /// Отказывать следующим `times` захватам класса для конкретного окна
    pub fn deny_window(&self, class: DeviceClass, window: WindowId, times: usize) {
        self.state.lock().deny_rules.push(DenyRule {
            class: Some(class),
            device: None,
            window: Some(window),
            remaining: times,
            status: GrabStatus::AlreadyGrabbed,
        });
    }

    pub fn deny_device(&self, device: DeviceId, times: usize) {
        self.state.lock().deny_rules.push(DenyRule {
            class: None,
            device: Some(device),
            window: None,
            remaining: times,
            status: GrabStatus::AlreadyGrabbed,
        });
    }

    /// Следующие `times` захватов не дойдут до сервера
    pub fn break_grabs(&self, times: usize) {
        self.state.lock().broken_grabs = times;
    }

    pub fn set_focus(&self, focus: Option<WindowId>, blocks_keyboard: bool) {
        let mut state = self.state.lock();
        state.focus = focus;
        state.focus_blocks_keyboard = blocks_keyboard;
    }

    pub fn focus(&self) -> Option<WindowId> {
        self.state.lock().focus
    }

    /// Окно уничтожено: сервер сам снимает его захваты
    pub fn destroy_window(&self, window: WindowId) {
        let mut state = self.state.lock();
        state.grabs.retain(|_, holder| *holder != window);
        state.destroyed.push(window);
    }

    /// Другой клиент отобрал захват
    pub fn steal_grab(&self, class: DeviceClass) {
        let mut state = self.state.lock();
        let devices: Vec<DeviceId> = state
            .devices
            .iter()
            .filter(|(_, c)| *c == class)
            .map(|(id, _)| *id)
            .collect();
        state.grabs.retain(|device, _| !devices.contains(device));
    }

    /// Окно, которому принадлежит захват первого устройства класса
    pub fn holder(&self, class: DeviceClass) -> Option<WindowId> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .filter(|(_, c)| *c == class)
            .find_map(|(id, _)| state.grabs.get(id).copied())
    }

    pub fn device_holder(&self, device: DeviceId) -> Option<WindowId> {
        self.state.lock().grabs.get(&device).copied()
    }

    pub fn server_grabbed(&self) -> bool {
        self.state.lock().server_grabbed
    }

    pub fn set_root(&self, root: WindowId, screen: ScreenId) {
        self.state.lock().root = (root, screen);
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn device_grab_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.is_device_grab_call())
            .count()
    }
}

impl DisplaySession for DryRunSession {
    fn devices(&mut self, class: DeviceClass) -> Result<DeviceList> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::Devices(class));
        Ok(state
            .devices
            .iter()
            .filter(|(_, c)| *c == class)
            .map(|(id, _)| *id)
            .collect())
    }

    fn grab_device(&mut self, device: DeviceId, request: &GrabRequest) -> Result<GrabStatus> {
        let mut state = self.state.lock();
        if state.broken_grabs > 0 {
            state.broken_grabs -= 1;
            return Err(crate::grab_error!(
                service_unavailable,
                "[DRY RUN] Соединение потеряно при захвате {}",
                device
            ));
        }

        let class = state.class_of(device).ok_or_else(|| {
            crate::grab_error!(internal, "Неизвестное устройство {}", device)
        })?;

        let status = state.decide(class, device, request.window);
        if status.is_success() {
            state.grabs.insert(device, request.window);
        }
        Self::record(
            &mut state,
            SessionCall::Grab {
                device,
                window: request.window,
                status,
            },
        );

        info!(
            "[DRY RUN] Захват {} ({}) для окна {}: {}",
            device, class, request.window, status
        );
        Ok(status)
    }

    fn ungrab_device(&mut self, device: DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.grabs.remove(&device);
        Self::record(&mut state, SessionCall::Ungrab(device));
        info!("[DRY RUN] Освобождение {}", device);
        Ok(())
    }

    fn is_grabbed(&mut self, class: DeviceClass) -> Result<bool> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::IsGrabbed(class));
        let grabbed = state
            .devices
            .iter()
            .any(|(id, c)| *c == class && state.grabs.contains_key(id));
        Ok(grabbed)
    }

    fn input_focus(&mut self) -> Result<Option<WindowId>> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::GetFocus);
        Ok(state.focus)
    }

    fn set_input_focus(&mut self, focus: Option<WindowId>) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::SetFocus(focus));
        state.focus = focus;
        info!("[DRY RUN] Фокус ввода: {:?}", focus);
        Ok(())
    }

    fn grab_server(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::GrabServer);
        state.server_grabbed = true;
        debug!("[DRY RUN] Серверный барьер установлен");
        Ok(())
    }

    fn ungrab_server(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::UngrabServer);
        state.server_grabbed = false;
        debug!("[DRY RUN] Серверный барьер снят");
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Self::record(&mut self.state.lock(), SessionCall::Sync);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Self::record(&mut self.state.lock(), SessionCall::Flush);
        Ok(())
    }

    fn take_destroyed(&mut self) -> Result<Vec<WindowId>> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::TakeDestroyed);
        Ok(std::mem::take(&mut state.destroyed))
    }

    fn pointer_root(&mut self) -> Result<(WindowId, ScreenId)> {
        let mut state = self.state.lock();
        Self::record(&mut state, SessionCall::PointerRoot);
        Ok(state.root)
    }
}
