use crate::error::{GrabError, Result};
use tracing::{info, warn};

/// Проверить, что процессу доступен X-дисплей
pub fn check_display_session(display_name: Option<&str>) -> Result<()> {
    info!("Проверка графической сессии...");

    let name = display_name
        .map(str::to_string)
        .or_else(|| std::env::var("DISPLAY").ok());
    let session_type = std::env::var("XDG_SESSION_TYPE").ok();

    check_display(name.as_deref())?;
    check_session_type(session_type.as_deref());
    check_not_root();

    info!("Проверка графической сессии завершена успешно");
    Ok(())
}

fn check_display(name: Option<&str>) -> Result<()> {
    match name {
        Some(name) if !name.trim().is_empty() => {
            info!("Используется дисплей {}", name);
            Ok(())
        }
        _ => Err(GrabError::ServiceUnavailable(
            "Переменная DISPLAY не задана, укажите [display] name в конфигурации".to_string(),
        )),
    }
}

/// Под Wayland захват через XWayland не перехватывает ввод других клиентов
fn check_session_type(session_type: Option<&str>) -> bool {
    match session_type {
        Some("wayland") => {
            warn!("⚠️  Сессия Wayland: захват действует только для клиентов XWayland");
            false
        }
        Some(kind) => {
            info!("Тип сессии: {}", kind);
            true
        }
        None => true,
    }
}

fn check_not_root() {
    if let Ok(user) = std::env::var("USER") {
        if user == "root" {
            warn!("⚠️  Приложение запущено от имени root, X-сервер может отказать в подключении");
        }
    }
}
