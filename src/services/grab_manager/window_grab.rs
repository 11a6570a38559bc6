use crate::error::{GrabError, Result};
use crate::events::{DeviceClass, ScreenId, Window};
use tracing::{debug, error, info, warn};

use super::manager::{GrabCore, GrabManager};

impl GrabCore {
    /// Ограниченное число попыток с паузой между ними
    fn acquire_with_retries(
        &mut self,
        class: DeviceClass,
        window: &Window,
        screen: ScreenId,
        hide_cursor: bool,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.acquire(class, window, screen, hide_cursor) {
                Ok(()) => return Ok(()),
                // Сбой соединения повторять бессмысленно
                Err(e) if !e.is_denial() || attempt >= self.policy.attempts => return Err(e),
                Err(e) => {
                    crate::debug_if_enabled!(
                        "Попытка {}/{} захвата {} не удалась: {}",
                        attempt, self.policy.attempts, class, e
                    );
                    attempt += 1;
                    self.pause();
                }
            }
        }
    }

    /// Снять фокус ввода со застрявшего владельца
    fn clear_focus(&mut self) {
        info!("Сбрасываем фокус ввода");

        // Ошибки здесь не важны: это лишь попытка разблокировать захват
        match self.session.input_focus() {
            Ok(focus) => debug!("Фокус ввода был у {:?}", focus),
            Err(e) => debug!("Не удалось запросить фокус ввода: {}", e),
        }
        if let Err(e) = self.session.set_input_focus(None) {
            debug!("Не удалось сбросить фокус ввода: {}", e);
        }
    }

    fn grab_window(&mut self, window: &Window, screen: ScreenId, hide_cursor: bool) -> Result<()> {
        let mut keyboard =
            self.acquire_with_retries(DeviceClass::Keyboard, window, screen, hide_cursor);

        // Отказы на все попытки означают застрявшего владельца фокуса
        if matches!(&keyboard, Err(e) if e.is_denial()) {
            warn!("{}", GrabError::FocusBlocked);
            if self.policy.clear_focus {
                self.clear_focus();
                keyboard =
                    self.acquire_with_retries(DeviceClass::Keyboard, window, screen, hide_cursor);
            }
        }
        let keyboard = keyboard.map_err(|e| if e.is_denial() { GrabError::FocusBlocked } else { e });

        let pointer = self.acquire_with_retries(DeviceClass::Pointer, window, screen, hide_cursor);
        if let Err(e) = &pointer {
            warn!("Не удалось захватить указатель: {}", e);
        }

        if keyboard.is_ok() && pointer.is_ok() {
            return Ok(());
        }

        // При last_wins отказавший класс мог частично перейти к окну,
        // поэтому освобождаются оба класса целиком
        self.release(DeviceClass::Keyboard);
        self.release(DeviceClass::Pointer);

        // Без клавиатуры не ввести пароль, без указателя не работают элементы экрана
        match (keyboard, pointer) {
            (Err(e), Err(_)) => Err(e),
            (keyboard, pointer) => Err(GrabError::PartialGrab {
                keyboard: keyboard.is_ok(),
                pointer: pointer.is_ok(),
            }),
        }
    }

    /// Указатель мог быть освобождён извне: тогда наша запись устарела
    fn heal_pointer_tracking(&mut self) {
        if self.pointer.window().is_none() {
            return;
        }

        match self.session.is_grabbed(DeviceClass::Pointer) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Сервер не сообщает захват указателя, сбрасываем устаревшую цель");
                self.reset_pointer_tracking();
            }
            Err(e) => debug!("Не удалось проверить захват указателя: {}", e),
        }
    }

    /// Один шаг переноса под серверным барьером; true, если захвачено именно `window`
    pub(super) fn migrate_once(
        &mut self,
        class: DeviceClass,
        window: &Window,
        screen: ScreenId,
        hide_cursor: bool,
    ) -> bool {
        if let Err(e) = self.session.grab_server() {
            warn!("Не удалось установить серверный барьер: {}", e);
        }

        let previous = self.slot(class).window().map(|old| {
            let old_screen = self.slot(class).screen().unwrap_or(old.screen());
            (old, old_screen, self.pointer_cursor_hidden)
        });

        if previous.is_some() {
            self.release(class);
        }

        let mut result = self.acquire(class, window, screen, hide_cursor);
        if result.is_err() {
            self.pause();
            result = self.acquire(class, window, screen, hide_cursor);
        }

        if let (Err(e), Some((old, old_screen, old_hidden))) = (&result, &previous) {
            warn!(
                "Не удалось захватить {} для нового окна {}: {}. Возвращаем прежний захват окну {}",
                class, window, e, old
            );
            if let Err(e) = self.acquire(class, old, *old_screen, *old_hidden) {
                error!("Не удалось вернуть захват {} окну {}: {}", class, old, e);
            }
        }

        if let Err(e) = self.session.ungrab_server() {
            warn!("Не удалось снять серверный барьер: {}", e);
        }
        if let Err(e) = self.session.flush() {
            warn!("Не удалось сбросить очередь запросов: {}", e);
        }

        result.is_ok()
    }

    fn migrate(&mut self, class: DeviceClass, window: &Window, screen: ScreenId, hide_cursor: bool) {
        let mut round: u64 = 0;
        loop {
            if class == DeviceClass::Pointer {
                self.heal_pointer_tracking();
            }

            if self.slot(class).holds(window) {
                // Тот же id может прийти в новом дескрипторе: цель должна следить за ним
                self.retarget(class, window, screen);
                debug!("{} уже захвачен окном {}", class, window);
                return;
            }

            // Уничтоженное окно захватить невозможно, цикл бы не завершился
            if window.is_destroyed() {
                error!("Окно {} уничтожено, перенос захвата {} отменён", window, class);
                return;
            }

            round += 1;
            if self.migrate_once(class, window, screen, hide_cursor) {
                info!("{} перенесён на окно {} (шаг {})", class, window, round);
                return;
            }
            warn!("Перенос {} на окно {} не удался (шаг {}), повторяем", class, window, round);
        }
    }
}

impl GrabManager {
    /// Захватить клавиатуру и указатель для окна экрана блокировки.
    ///
    /// Возвращает `true` только если захвачены оба класса устройств; иначе
    /// ничего не остаётся захваченным. Блокирует поток на время повторов.
    pub fn grab_window(&self, window: &Window, screen: ScreenId, hide_cursor: bool) -> bool {
        match self.try_grab_window(window, screen, hide_cursor) {
            Ok(()) => {
                info!("Ввод захвачен окном {}", window);
                true
            }
            Err(e) => {
                error!("Не удалось захватить ввод для окна {}: {}", window, e);
                false
            }
        }
    }

    /// То же, что `grab_window`, но с причиной отказа
    pub fn try_grab_window(&self, window: &Window, screen: ScreenId, hide_cursor: bool) -> Result<()> {
        let mut core = self.lock();
        core.observe_destroyed();
        core.grab_window(window, screen, hide_cursor)
    }

    /// Перенести захват на другое окно без права на неудачу.
    ///
    /// Повторяет попытки до успеха: при постоянных отказах сервера вызов не
    /// вернётся. Нельзя вызывать там, где блокировка недопустима.
    pub fn move_grab_to_window(&self, window: &Window, screen: ScreenId, hide_cursor: bool) {
        let mut core = self.lock();
        core.observe_destroyed();
        core.migrate(DeviceClass::Keyboard, window, screen, hide_cursor);
        core.migrate(DeviceClass::Pointer, window, screen, hide_cursor);
    }

    /// Корневое окно экрана, на котором находится указатель
    pub fn root_under_pointer(&self) -> Result<Window> {
        let (root, screen) = self.lock().session.pointer_root()?;
        Ok(Window::new(root, screen))
    }

    /// Захватить ввод на корневое окно; возвращённое окно нужно держать живым
    pub fn grab_root(&self, hide_cursor: bool) -> Option<Window> {
        info!("Захват корневого окна");

        let root = match self.root_under_pointer() {
            Ok(root) => root,
            Err(e) => {
                error!("Не удалось определить корневое окно: {}", e);
                return None;
            }
        };

        self.grab_window(&root, root.screen(), hide_cursor)
            .then_some(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceId, GrabStatus, WindowId};
    use crate::services::display_session::{DryRunSession, SessionCall};
    use crate::services::grab_manager::instant_policy;
    use crate::services::grab_manager::GrabPolicy;

    fn setup() -> (GrabManager, DryRunSession) {
        let session = DryRunSession::new();
        let manager = GrabManager::new(Box::new(session.clone()), instant_policy());
        (manager, session)
    }

    fn window(id: u32) -> Window {
        Window::new(WindowId(id), ScreenId(0))
    }

    fn focus_resets(session: &DryRunSession) -> usize {
        session
            .calls()
            .iter()
            .filter(|call| **call == SessionCall::SetFocus(None))
            .count()
    }

    fn grabs_for(session: &DryRunSession, target: WindowId) -> usize {
        session
            .calls()
            .iter()
            .filter(|call| matches!(call, SessionCall::Grab { window, .. } if *window == target))
            .count()
    }

    #[test]
    fn test_grab_window_takes_both_devices() {
        let (manager, session) = setup();
        let a = window(10);

        assert!(manager.grab_window(&a, ScreenId(0), true));

        assert_eq!(manager.keyboard_target(), Some(a.clone()));
        assert_eq!(manager.pointer_target(), Some(a));
        assert!(manager.pointer_cursor_hidden());
        assert_eq!(focus_resets(&session), 0);
    }

    #[test]
    fn test_keyboard_order_before_pointer() {
        let (manager, session) = setup();
        let a = window(10);

        assert!(manager.grab_window(&a, ScreenId(0), false));

        let calls = session.calls();
        let keyboard = calls
            .iter()
            .position(|c| matches!(c, SessionCall::Grab { device, .. } if device.0 == 3))
            .unwrap();
        let pointer = calls
            .iter()
            .position(|c| matches!(c, SessionCall::Grab { device, .. } if device.0 == 2))
            .unwrap();
        assert!(keyboard < pointer);
    }

    #[test]
    fn test_transient_denials_are_retried() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 3, GrabStatus::AlreadyGrabbed);
        session.deny(DeviceClass::Pointer, 3, GrabStatus::Frozen);

        assert!(manager.grab_window(&a, ScreenId(0), false));
        assert_eq!(focus_resets(&session), 0);
        assert_eq!(grabs_for(&session, WindowId(10)), 8);
    }

    #[test]
    fn test_focus_is_cleared_once_after_exhausted_keyboard_attempts() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 4, GrabStatus::AlreadyGrabbed);

        assert!(manager.grab_window(&a, ScreenId(0), false));
        assert_eq!(focus_resets(&session), 1);
        assert!(session.calls().contains(&SessionCall::GetFocus));
    }

    #[test]
    fn test_stuck_focus_owner_is_cleared() {
        let (manager, session) = setup();
        let a = window(10);
        session.set_focus(Some(WindowId(99)), true);

        assert!(manager.grab_window(&a, ScreenId(0), true));
        assert_eq!(session.focus(), None);
        assert_eq!(manager.keyboard_target(), Some(a));
    }

    #[test]
    fn test_focus_is_cleared_at_most_once() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 100, GrabStatus::AlreadyGrabbed);

        assert!(!manager.grab_window(&a, ScreenId(0), false));
        assert_eq!(focus_resets(&session), 1);
        // 4 попытки до сброса фокуса и 4 после
        assert_eq!(
            session
                .calls()
                .iter()
                .filter(|c| matches!(c, SessionCall::Grab { device, .. } if device.0 == 3))
                .count(),
            8
        );
    }

    #[test]
    fn test_focus_clearing_can_be_disabled() {
        let session = DryRunSession::new();
        let policy = GrabPolicy {
            clear_focus: false,
            ..instant_policy()
        };
        let manager = GrabManager::new(Box::new(session.clone()), policy);
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 4, GrabStatus::AlreadyGrabbed);

        assert!(!manager.grab_window(&a, ScreenId(0), false));
        assert_eq!(focus_resets(&session), 0);
    }

    #[test]
    fn test_keyboard_failure_releases_pointer() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 100, GrabStatus::AlreadyGrabbed);

        let err = manager.try_grab_window(&a, ScreenId(0), false).unwrap_err();

        assert!(matches!(
            err,
            GrabError::PartialGrab {
                keyboard: false,
                pointer: true
            }
        ));
        assert_eq!(manager.keyboard_target(), None);
        assert_eq!(manager.pointer_target(), None);
        assert_eq!(session.holder(DeviceClass::Pointer), None);
    }

    #[test]
    fn test_pointer_failure_releases_keyboard() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Pointer, 100, GrabStatus::NotViewable);

        let err = manager.try_grab_window(&a, ScreenId(0), true).unwrap_err();

        assert!(matches!(
            err,
            GrabError::PartialGrab {
                keyboard: true,
                pointer: false
            }
        ));
        assert_eq!(manager.keyboard_target(), None);
        assert_eq!(session.holder(DeviceClass::Keyboard), None);
    }

    #[test]
    fn test_total_failure_reports_blocked_focus() {
        let (manager, session) = setup();
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 100, GrabStatus::Frozen);
        session.deny(DeviceClass::Pointer, 100, GrabStatus::Frozen);

        let err = manager.try_grab_window(&a, ScreenId(0), false).unwrap_err();

        assert!(matches!(err, GrabError::FocusBlocked));
        assert!(err.is_denial());
        assert_eq!(session.holder(DeviceClass::Keyboard), None);
        assert_eq!(session.holder(DeviceClass::Pointer), None);
    }

    #[test]
    fn test_blocked_focus_is_reported_without_clearing() {
        let session = DryRunSession::new();
        let policy = GrabPolicy {
            clear_focus: false,
            ..instant_policy()
        };
        let manager = GrabManager::new(Box::new(session.clone()), policy);
        let a = window(10);
        session.deny(DeviceClass::Keyboard, 100, GrabStatus::AlreadyGrabbed);
        session.deny(DeviceClass::Pointer, 100, GrabStatus::AlreadyGrabbed);

        let err = manager.try_grab_window(&a, ScreenId(0), false).unwrap_err();

        assert!(matches!(err, GrabError::FocusBlocked));
        assert_eq!(focus_resets(&session), 0);
    }

    #[test]
    fn test_failed_grab_releases_partially_switched_keyboards() {
        let session = DryRunSession::with_devices(vec![
            (DeviceId(2), DeviceClass::Pointer),
            (DeviceId(3), DeviceClass::Keyboard),
            (DeviceId(8), DeviceClass::Keyboard),
        ]);
        let manager = GrabManager::new(Box::new(session.clone()), instant_policy());
        let a = window(10);
        // Последняя клавиатура решает исход, первая уже перешла к окну
        session.deny_device(DeviceId(8), 100);

        assert!(!manager.grab_window(&a, ScreenId(0), false));

        assert_eq!(manager.keyboard_target(), None);
        assert_eq!(session.device_holder(DeviceId(3)), None);
        assert_eq!(session.device_holder(DeviceId(8)), None);
        assert_eq!(session.device_holder(DeviceId(2)), None);
    }

    #[test]
    fn test_transport_error_skips_focus_clearing() {
        let (manager, session) = setup();
        let a = window(10);
        session.break_grabs(1);

        let err = manager.try_grab_window(&a, ScreenId(0), false).unwrap_err();

        assert!(matches!(
            err,
            GrabError::PartialGrab {
                keyboard: false,
                pointer: true
            }
        ));
        assert_eq!(focus_resets(&session), 0);
        assert!(!session.calls().contains(&SessionCall::GetFocus));
        // Клавиатура не повторялась после сбоя соединения
        assert!(!session
            .calls()
            .iter()
            .any(|c| matches!(c, SessionCall::Grab { device, .. } if device.0 == 3)));
        assert_eq!(session.holder(DeviceClass::Pointer), None);
    }

    #[test]
    fn test_move_to_current_target_is_a_no_op() {
        let (manager, session) = setup();
        let a = window(10);
        assert!(manager.grab_window(&a, ScreenId(0), true));
        session.clear_calls();

        manager.move_grab_to_window(&a, ScreenId(0), true);

        assert_eq!(session.device_grab_calls(), 0);
        assert!(!session.calls().contains(&SessionCall::GrabServer));
    }

    #[test]
    fn test_move_to_same_window_adopts_new_handle() {
        let (manager, session) = setup();
        let old = manager.grab_root(true).unwrap();
        session.clear_calls();

        // Новый дескриптор того же корневого окна
        let fresh = manager.root_under_pointer().unwrap();
        manager.move_grab_to_window(&fresh, fresh.screen(), true);
        drop(old);

        assert_eq!(manager.keyboard_target(), Some(fresh.clone()));
        assert_eq!(manager.pointer_target(), Some(fresh));
        assert_eq!(manager.keyboard_screen(), Some(ScreenId(0)));
        assert_eq!(session.device_grab_calls(), 0);
        assert_eq!(session.holder(DeviceClass::Keyboard), Some(WindowId(0x1e3)));
    }

    #[test]
    fn test_move_transfers_both_devices_under_fence() {
        let (manager, session) = setup();
        let a = window(10);
        let b = Window::new(WindowId(11), ScreenId(1));
        assert!(manager.grab_window(&a, ScreenId(0), true));
        session.clear_calls();

        manager.move_grab_to_window(&b, ScreenId(1), false);

        assert_eq!(manager.keyboard_target(), Some(b.clone()));
        assert_eq!(manager.pointer_target(), Some(b));
        assert_eq!(manager.keyboard_screen(), Some(ScreenId(1)));
        assert!(!manager.pointer_cursor_hidden());
        assert_eq!(session.holder(DeviceClass::Keyboard), Some(WindowId(11)));
        assert!(!session.server_grabbed());

        let calls = session.calls();
        let fences = calls.iter().filter(|c| **c == SessionCall::GrabServer).count();
        let unfences = calls.iter().filter(|c| **c == SessionCall::UngrabServer).count();
        assert_eq!(fences, 2);
        assert_eq!(unfences, 2);
    }

    #[test]
    fn test_failed_migration_step_restores_previous_keyboard_grab() {
        let (manager, session) = setup();
        let a = window(10);
        let b = window(11);
        assert!(manager.grab_window(&a, ScreenId(0), false));
        session.deny_window(DeviceClass::Keyboard, WindowId(11), 2);

        let moved = manager
            .lock()
            .migrate_once(DeviceClass::Keyboard, &b, ScreenId(0), false);

        assert!(!moved);
        assert_eq!(manager.keyboard_target(), Some(a));
        assert_eq!(session.holder(DeviceClass::Keyboard), Some(WindowId(10)));
        assert!(!session.server_grabbed());
    }

    #[test]
    fn test_move_retries_until_new_target_holds_grab() {
        let (manager, session) = setup();
        let a = window(10);
        let b = window(11);
        assert!(manager.grab_window(&a, ScreenId(0), false));
        session.clear_calls();
        session.deny_window(DeviceClass::Keyboard, WindowId(11), 3);

        manager.move_grab_to_window(&b, ScreenId(0), false);

        assert_eq!(manager.keyboard_target(), Some(b));
        assert_eq!(session.holder(DeviceClass::Keyboard), Some(WindowId(11)));
        // Первый шаг завершился откатом на A
        let rollback = session
            .calls()
            .iter()
            .any(|c| matches!(c, SessionCall::Grab { device, window, .. } if device.0 == 3 && window.0 == 10));
        assert!(rollback);
    }

    #[test]
    fn test_pointer_rollback_restores_hidden_cursor() {
        let (manager, session) = setup();
        let a = window(10);
        let b = window(11);
        assert!(manager.grab_window(&a, ScreenId(0), true));
        session.deny_window(DeviceClass::Pointer, WindowId(11), 2);

        let moved = manager
            .lock()
            .migrate_once(DeviceClass::Pointer, &b, ScreenId(0), false);

        assert!(!moved);
        assert_eq!(manager.pointer_target(), Some(a));
        assert!(manager.pointer_cursor_hidden());
    }

    #[test]
    fn test_keyboard_failure_does_not_roll_back_pointer() {
        let (manager, session) = setup();
        let a = window(10);
        let b = window(11);
        assert!(manager.grab_window(&a, ScreenId(0), false));
        session.deny_window(DeviceClass::Keyboard, WindowId(11), 2);

        manager.move_grab_to_window(&b, ScreenId(0), false);

        assert_eq!(manager.keyboard_target(), Some(b.clone()));
        assert_eq!(manager.pointer_target(), Some(b));
        assert_eq!(grabs_for(&session, WindowId(10)), 3);
    }

    #[test]
    fn test_stolen_pointer_grab_is_reacquired() {
        let (manager, session) = setup();
        let a = window(10);
        assert!(manager.grab_window(&a, ScreenId(0), true));
        session.steal_grab(DeviceClass::Pointer);
        session.clear_calls();

        manager.move_grab_to_window(&a, ScreenId(0), true);

        assert_eq!(manager.pointer_target(), Some(a));
        assert_eq!(session.holder(DeviceClass::Pointer), Some(WindowId(10)));
        // Клавиатура не трогалась
        assert!(!session
            .calls()
            .iter()
            .any(|c| matches!(c, SessionCall::Grab { device, .. } if device.0 == 3)));
    }

    #[test]
    fn test_move_after_target_dropped() {
        let (manager, session) = setup();
        let a = window(10);
        let w = window(12);
        assert!(manager.grab_window(&a, ScreenId(0), false));

        drop(a);
        manager.move_grab_to_window(&w, ScreenId(0), false);

        assert_eq!(manager.keyboard_target(), Some(w.clone()));
        assert_eq!(manager.pointer_target(), Some(w));
        assert_eq!(session.holder(DeviceClass::Keyboard), Some(WindowId(12)));
    }

    #[test]
    fn test_move_after_target_destroyed_on_server() {
        let (manager, session) = setup();
        let a = window(10);
        let w = window(12);
        assert!(manager.grab_window(&a, ScreenId(0), false));
        session.destroy_window(WindowId(10));
        session.clear_calls();

        manager.move_grab_to_window(&w, ScreenId(0), false);

        assert!(a.is_destroyed());
        assert_eq!(manager.keyboard_target(), Some(w));
        // Исчезнувшее окно не освобождается повторно
        assert!(!session
            .calls()
            .iter()
            .any(|c| matches!(c, SessionCall::Ungrab(_))));
    }

    #[test]
    fn test_move_to_destroyed_window_gives_up() {
        let (manager, session) = setup();
        let a = window(10);
        let gone = window(13);
        assert!(manager.grab_window(&a, ScreenId(0), false));
        gone.mark_destroyed();
        session.clear_calls();

        manager.move_grab_to_window(&gone, ScreenId(0), false);

        assert_eq!(manager.keyboard_target(), Some(a));
        assert_eq!(session.device_grab_calls(), 0);
    }

    #[test]
    fn test_grab_root_uses_screen_under_pointer() {
        let (manager, session) = setup();
        session.set_root(WindowId(0x2a), ScreenId(1));

        let root = manager.grab_root(true).unwrap();

        assert_eq!(root.id(), WindowId(0x2a));
        assert_eq!(manager.keyboard_target(), Some(root.clone()));
        assert_eq!(manager.keyboard_screen(), Some(ScreenId(1)));
        assert_eq!(manager.pointer_screen(), Some(ScreenId(1)));
    }

    #[test]
    fn test_grab_root_failure_returns_none() {
        let (manager, session) = setup();
        session.deny(DeviceClass::Pointer, 100, GrabStatus::NotViewable);

        assert!(manager.grab_root(false).is_none());
        assert_eq!(session.holder(DeviceClass::Keyboard), None);
    }
}
