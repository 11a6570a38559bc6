use crate::error::Result;
use crate::events::{
    CursorChoice, DeviceClass, DeviceId, DeviceList, GrabEvents, GrabRequest, GrabStatus, ScreenId,
    WindowId,
};
use crate::grab_error;
use once_cell::unsync::OnceCell;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xinput::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    self, ChangeWindowAttributesAux, ConnectionExt as _, CreateGCAux, EventMask, InputFocus,
    NotifyMode, Rectangle,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use super::r#trait::DisplaySession;

/// XIAllMasterDevices
const ALL_MASTER_DEVICES: u16 = 1;

/// Клиентский учёт захватов: X11 не сообщает, захвачено ли устройство
#[derive(Debug, Default)]
struct GrabTracker {
    // Класс устройств запоминается при перечислении
    classes: HashMap<DeviceId, DeviceClass>,
    grabbed: HashMap<DeviceId, WindowId>,
    // Собственные освобождения, чьи UNGRAB-события ещё не прочитаны
    own_ungrabs: HashMap<(DeviceClass, WindowId), usize>,
}

impl GrabTracker {
    fn classify(&mut self, device: DeviceId, class: DeviceClass) {
        self.classes.insert(device, class);
    }

    fn record_grab(&mut self, device: DeviceId, window: WindowId) {
        self.grabbed.insert(device, window);
    }

    fn record_ungrab(&mut self, device: DeviceId) {
        let Some(window) = self.grabbed.remove(&device) else {
            return;
        };
        if let Some(class) = self.classes.get(&device) {
            *self.own_ungrabs.entry((*class, window)).or_default() += 1;
        }
    }

    /// UNGRAB-событие: своё освобождение пропускается, чужое снимает учёт
    fn ungrab_event(&mut self, class: DeviceClass, window: WindowId) {
        if let Some(pending) = self.own_ungrabs.get_mut(&(class, window)) {
            *pending -= 1;
            if *pending == 0 {
                self.own_ungrabs.remove(&(class, window));
            }
            return;
        }

        let classes = &self.classes;
        self.grabbed.retain(|device, holder| {
            let lost = *holder == window && classes.get(device) == Some(&class);
            if lost {
                warn!("Захват {} ({}) окна {} снят извне", device, class, window);
            }
            !lost
        });
    }

    fn window_destroyed(&mut self, window: WindowId) {
        self.grabbed.retain(|_, holder| *holder != window);
        self.own_ungrabs.retain(|(_, holder), _| *holder != window);
    }

    /// После round-trip все события прежних запросов уже прочитаны
    fn settled(&mut self) {
        self.own_ungrabs.clear();
    }

    fn is_grabbed(&self, class: DeviceClass) -> bool {
        self.grabbed
            .keys()
            .any(|device| self.classes.get(device) == Some(&class))
    }
}

pub struct X11Session {
    conn: RustConnection,
    screen_num: usize,
    blank_cursor: OnceCell<xproto::Cursor>,
    tracker: GrabTracker,
    watched: HashSet<WindowId>,
    destroyed: Vec<WindowId>,
}

impl X11Session {
    pub fn connect(display_name: Option<&str>) -> Result<Self> {
        info!(
            "Подключение к X-серверу {}",
            display_name.unwrap_or("(из $DISPLAY)")
        );

        let (conn, screen_num) = x11rb::connect(display_name)?;

        let version = conn.xinput_xi_query_version(2, 0)?.reply()?;
        if version.major_version < 2 {
            return Err(grab_error!(
                service_unavailable,
                "XInput2 недоступен, сервер поддерживает {}.{}",
                version.major_version,
                version.minor_version
            ));
        }
        info!(
            "X-сервер подключен (экран {}, XInput {}.{})",
            screen_num, version.major_version, version.minor_version
        );

        Ok(Self {
            conn,
            screen_num,
            blank_cursor: OnceCell::new(),
            tracker: GrabTracker::default(),
            watched: HashSet::new(),
            destroyed: Vec::new(),
        })
    }

    fn default_root(&self) -> Result<xproto::Window> {
        self.conn
            .setup()
            .roots
            .get(self.screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| grab_error!(internal, "Экран {} не найден", self.screen_num))
    }

    /// Прозрачный курсор 1x1, создаётся один раз на соединение
    fn blank_cursor(&self) -> Result<xproto::Cursor> {
        let root = self.default_root()?;
        self.blank_cursor
            .get_or_try_init(|| -> Result<xproto::Cursor> {
                let pixmap = self.conn.generate_id()?;
                self.conn.create_pixmap(1, pixmap, root, 1, 1)?;

                let gc = self.conn.generate_id()?;
                self.conn
                    .create_gc(gc, pixmap, &CreateGCAux::new().foreground(0))?;
                self.conn.poly_fill_rectangle(
                    pixmap,
                    gc,
                    &[Rectangle {
                        x: 0,
                        y: 0,
                        width: 1,
                        height: 1,
                    }],
                )?;
                self.conn.free_gc(gc)?;

                let cursor = self.conn.generate_id()?;
                self.conn
                    .create_cursor(cursor, pixmap, pixmap, 0, 0, 0, 0, 0, 0, 0, 0)?;
                self.conn.free_pixmap(pixmap)?;

                debug!("Создан невидимый курсор 0x{:x}", cursor);
                Ok(cursor)
            })
            .copied()
    }

    /// Подписка на уничтожение окна и на снятие захвата извне
    fn watch(&mut self, window: WindowId) -> Result<()> {
        if !self.watched.insert(window) {
            return Ok(());
        }

        self.conn.change_window_attributes(
            window.0,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::STRUCTURE_NOTIFY | EventMask::LEAVE_WINDOW | EventMask::FOCUS_CHANGE,
            ),
        )?;
        debug!("Отслеживаем окно {}", window);
        Ok(())
    }

    fn drain_events(&mut self) -> Result<()> {
        while let Some(event) = self.conn.poll_for_event()? {
            match event {
                Event::DestroyNotify(e) => {
                    let window = WindowId(e.window);
                    debug!("Окно {} уничтожено", window);
                    self.watched.remove(&window);
                    self.tracker.window_destroyed(window);
                    self.destroyed.push(window);
                }
                Event::LeaveNotify(e) if e.mode == NotifyMode::UNGRAB => {
                    self.tracker.ungrab_event(DeviceClass::Pointer, WindowId(e.event));
                }
                Event::FocusOut(e) if e.mode == NotifyMode::UNGRAB => {
                    self.tracker.ungrab_event(DeviceClass::Keyboard, WindowId(e.event));
                }
                Event::Error(e) => {
                    // Ошибки асинхронных запросов (например, SetInputFocus) игнорируются
                    debug!("Асинхронная ошибка X11: {:?}", e);
                }
                other => {
                    crate::trace_if_enabled!("Пропущено событие X11: {:?}", other);
                }
            }
        }
        Ok(())
    }

    fn convert_status(status: xproto::GrabStatus) -> GrabStatus {
        match status {
            xproto::GrabStatus::SUCCESS => GrabStatus::Success,
            xproto::GrabStatus::ALREADY_GRABBED => GrabStatus::AlreadyGrabbed,
            xproto::GrabStatus::INVALID_TIME => GrabStatus::InvalidTime,
            xproto::GrabStatus::NOT_VIEWABLE => GrabStatus::NotViewable,
            _ => GrabStatus::Frozen,
        }
    }
}

impl DisplaySession for X11Session {
    fn devices(&mut self, class: DeviceClass) -> Result<DeviceList> {
        let wanted = match class {
            DeviceClass::Keyboard => xinput::DeviceType::MASTER_KEYBOARD,
            DeviceClass::Pointer => xinput::DeviceType::MASTER_POINTER,
        };

        let reply = self
            .conn
            .xinput_xi_query_device(ALL_MASTER_DEVICES)?
            .reply()?;

        let mut devices = DeviceList::new();
        for info in reply.infos.iter().filter(|info| info.type_ == wanted) {
            let device = DeviceId(info.deviceid);
            self.tracker.classify(device, class);
            devices.push(device);
        }

        debug!("Найдено {} устройств класса {}", devices.len(), class);
        Ok(devices)
    }

    fn grab_device(&mut self, device: DeviceId, request: &GrabRequest) -> Result<GrabStatus> {
        let cursor = match request.cursor {
            CursorChoice::Invisible => self.blank_cursor()?,
            CursorChoice::Default => x11rb::NONE,
        };
        let mask = match request.events {
            GrabEvents::Keys => xinput::XIEventMask::KEY_PRESS | xinput::XIEventMask::KEY_RELEASE,
            GrabEvents::Default => {
                xinput::XIEventMask::BUTTON_PRESS
                    | xinput::XIEventMask::BUTTON_RELEASE
                    | xinput::XIEventMask::MOTION
            }
        };
        let owner_events = if request.owner_events {
            xinput::GrabOwner::OWNER
        } else {
            xinput::GrabOwner::NO_OWNER
        };

        let reply = self
            .conn
            .xinput_xi_grab_device(
                request.window.0,
                x11rb::CURRENT_TIME,
                cursor,
                device.0,
                xproto::GrabMode::ASYNC,
                xproto::GrabMode::ASYNC,
                owner_events,
                &[u32::from(mask)],
            )?
            .reply()?;

        let status = Self::convert_status(reply.status);
        debug!("Захват {} для окна {}: {}", device, request.window, status);

        if status.is_success() {
            self.tracker.record_grab(device, request.window);
            self.watch(request.window)?;
        }
        Ok(status)
    }

    fn ungrab_device(&mut self, device: DeviceId) -> Result<()> {
        self.conn
            .xinput_xi_ungrab_device(x11rb::CURRENT_TIME, device.0)?;
        self.tracker.record_ungrab(device);
        Ok(())
    }

    fn is_grabbed(&mut self, class: DeviceClass) -> Result<bool> {
        self.conn.sync()?;
        self.drain_events()?;
        self.tracker.settled();
        Ok(self.tracker.is_grabbed(class))
    }

    fn input_focus(&mut self) -> Result<Option<WindowId>> {
        let reply = self.conn.get_input_focus()?.reply()?;
        Ok((reply.focus != x11rb::NONE).then_some(WindowId(reply.focus)))
    }

    fn set_input_focus(&mut self, focus: Option<WindowId>) -> Result<()> {
        let (revert_to, window) = match focus {
            Some(window) => (InputFocus::PARENT, window.0),
            None => (InputFocus::NONE, x11rb::NONE),
        };
        self.conn
            .set_input_focus(revert_to, window, x11rb::CURRENT_TIME)?;
        Ok(())
    }

    fn grab_server(&mut self) -> Result<()> {
        self.conn.grab_server()?;
        Ok(())
    }

    fn ungrab_server(&mut self) -> Result<()> {
        self.conn.ungrab_server()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.conn.sync()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    fn take_destroyed(&mut self) -> Result<Vec<WindowId>> {
        self.drain_events()?;
        Ok(std::mem::take(&mut self.destroyed))
    }

    fn pointer_root(&mut self) -> Result<(WindowId, ScreenId)> {
        let reply = self.conn.query_pointer(self.default_root()?)?.reply()?;
        let screen = self
            .conn
            .setup()
            .roots
            .iter()
            .position(|screen| screen.root == reply.root)
            .unwrap_or(self.screen_num);

        Ok((WindowId(reply.root), ScreenId(screen as u32)))
    }
}

impl Drop for X11Session {
    fn drop(&mut self) {
        info!("Закрытие соединения с X-сервером");
        if let Some(cursor) = self.blank_cursor.get() {
            if let Err(e) = self.conn.free_cursor(*cursor) {
                debug!("Не удалось освободить курсор: {}", e);
            }
        }
        if let Err(e) = self.conn.flush() {
            warn!("Не удалось сбросить очередь запросов: {}", e);
        }
    }
}
