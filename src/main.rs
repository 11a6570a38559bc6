use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info, warn};
mod config;
mod error;
mod events;
mod services;
mod utils;

use config::Config;
use events::{ScreenId, Window, WindowId};
use services::{create_display_session, GrabManager, GrabPolicy};

#[derive(Parser, Debug)]
#[command(name = "lockgrab")]
#[command(about = "Эксклюзивный захват клавиатуры и указателя для экрана блокировки")]
struct Args {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = "lockgrab.toml")]
    config: String,

    /// Режим сухого запуска (эмуляция сервера, без реальных захватов)
    #[arg(long)]
    dry_run: bool,

    /// Уровень логирования (переопределяет конфигурацию)
    #[arg(long)]
    log_level: Option<String>,

    /// Окно экрана блокировки (десятичный или 0x-шестнадцатеричный id); по умолчанию корневое окно
    #[arg(short, long, value_parser = parse_window_id)]
    window: Option<WindowId>,

    /// Экран окна, заданного через --window
    #[arg(long, default_value_t = 0)]
    screen: u32,

    /// Не скрывать курсор на время захвата
    #[arg(long)]
    show_cursor: bool,
}

fn parse_window_id(value: &str) -> std::result::Result<WindowId, String> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };

    parsed
        .map(WindowId)
        .map_err(|e| format!("Неверный идентификатор окна '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Загрузка конфигурации
    let mut config = Config::load(&args.config)?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.show_cursor {
        config.grab.hide_cursor = false;
    }

    // Инициализация системы логирования
    init_tracing(&config.logging.level, &config.logging.format)?;

    info!("Запуск lockgrab v{}", env!("CARGO_PKG_VERSION"));
    info!("Конфигурация загружена из: {}", args.config);

    if args.dry_run {
        warn!("Режим сухого запуска - реальные захваты отключены");
    } else {
        utils::check_display_session(config.display.name.as_deref())?;
    }

    let session = create_display_session(&config, args.dry_run)?;
    let manager = GrabManager::new(session, GrabPolicy::from(&config.grab));
    let hide_cursor = config.grab.hide_cursor;

    // Окно должно жить, пока держится захват
    let mut lock_window = {
        let manager = manager.clone();
        let requested = args.window.map(|id| Window::new(id, ScreenId(args.screen)));
        tokio::task::spawn_blocking(move || match requested {
            Some(window) => manager
                .grab_window(&window, window.screen(), hide_cursor)
                .then_some(window),
            None => manager.grab_root(hide_cursor),
        })
        .await
        .context("Задача захвата завершилась аварийно")?
    };

    let Some(window) = &lock_window else {
        error!("Не удалось захватить ввод, завершение");
        anyhow::bail!("Захват ввода не удался");
    };
    info!(
        "Клавиатура: {:?}, указатель: {:?} (окно {})",
        manager.keyboard_target().map(|w| w.id()),
        manager.pointer_target().map(|w| w.id()),
        window
    );

    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut user1 = unix_signal(SignalKind::user_defined1())?;

    info!("Захват удерживается; SIGUSR1 переносит его на экран под указателем");

    // Ожидание сигналов
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Получен сигнал завершения (Ctrl+C)"),
                    Err(err) => error!("Ошибка при ожидании сигнала завершения: {}", err),
                }
                break;
            }
            _ = terminate.recv() => {
                info!("Получен сигнал завершения (SIGTERM)");
                break;
            }
            _ = user1.recv() => {
                info!("Получен SIGUSR1, переносим захват");
                let manager = manager.clone();
                let moved = tokio::task::spawn_blocking(move || -> Option<Window> {
                    let root = match manager.root_under_pointer() {
                        Ok(root) => root,
                        Err(e) => {
                            error!("Не удалось определить экран под указателем: {}", e);
                            return None;
                        }
                    };
                    manager.move_grab_to_window(&root, root.screen(), hide_cursor);
                    Some(root)
                })
                .await;

                match moved {
                    Ok(Some(root)) => lock_window = Some(root),
                    Ok(None) => {}
                    Err(e) => error!("Задача переноса захвата завершилась аварийно: {}", e),
                }
            }
        }
    }

    info!("Завершение работы...");

    let releaser = manager.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || releaser.release_all()).await {
        warn!("Не удалось освободить захваты: {}", e);
    }
    drop(lock_window);

    info!("lockgrab завершил работу");
    Ok(())
}

fn init_tracing(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))?;

    let compact = (format == "compact").then(|| tracing_subscriber::fmt::layer().compact());
    let full = (format != "compact").then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(compact)
        .with(full)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_id() {
        assert_eq!(parse_window_id("4194307"), Ok(WindowId(4194307)));
        assert_eq!(parse_window_id("0x400003"), Ok(WindowId(0x400003)));
        assert_eq!(parse_window_id("0X1e3"), Ok(WindowId(0x1e3)));
        assert!(parse_window_id("0xzz").is_err());
        assert!(parse_window_id("окно").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["lockgrab", "--dry-run", "--window", "0x2a", "--screen", "1"]);
        assert!(args.dry_run);
        assert_eq!(args.window, Some(WindowId(0x2a)));
        assert_eq!(args.screen, 1);
        assert!(!args.show_cursor);
        assert_eq!(args.config, "lockgrab.toml");
    }
}
