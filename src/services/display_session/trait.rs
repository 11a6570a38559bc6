use crate::config::Config;
use crate::error::Result;
use crate::events::{DeviceClass, DeviceId, DeviceList, GrabRequest, GrabStatus, ScreenId, WindowId};

/// Примитивы сервера устройств, которыми пользуется GrabManager.
///
/// Все вызовы синхронные и выполняются в потоке вызывающего.
pub trait DisplaySession: Send {
    /// Перечислить master-устройства указанного класса
    fn devices(&mut self, class: DeviceClass) -> Result<DeviceList>;

    /// Захватить устройство для окна; отказ сервера возвращается как статус, а не ошибка
    fn grab_device(&mut self, device: DeviceId, request: &GrabRequest) -> Result<GrabStatus>;

    fn ungrab_device(&mut self, device: DeviceId) -> Result<()>;

    /// Сообщает ли сервер активный захват клиентского устройства этого класса
    fn is_grabbed(&mut self, class: DeviceClass) -> Result<bool>;

    fn input_focus(&mut self) -> Result<Option<WindowId>>;

    /// `None` снимает фокус ввода полностью
    fn set_input_focus(&mut self, focus: Option<WindowId>) -> Result<()>;

    /// Серверный барьер: другие клиенты не обслуживаются до `ungrab_server`
    fn grab_server(&mut self) -> Result<()>;

    fn ungrab_server(&mut self) -> Result<()>;

    /// Полный round-trip до сервера
    fn sync(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Окна, уничтожение которых сервер сообщил с прошлого вызова
    fn take_destroyed(&mut self) -> Result<Vec<WindowId>>;

    /// Корневое окно экрана, на котором сейчас находится указатель
    fn pointer_root(&mut self) -> Result<(WindowId, ScreenId)>;
}

/// Factory function to create an appropriate display session based on the dry_run flag
pub fn create_display_session(
    config: &Config,
    dry_run: bool,
) -> Result<Box<dyn DisplaySession>> {
    if dry_run {
        Ok(Box::new(super::dry_run::DryRunSession::new()))
    } else {
        Ok(Box::new(super::x11::X11Session::connect(
            config.display.name.as_deref(),
        )?))
    }
}
