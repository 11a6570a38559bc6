use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub grab: GrabConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrabConfig {
    /// Число попыток захвата в grab_window
    pub attempts: u32,
    pub retry_interval_ms: u64,
    pub hide_cursor: bool,
    pub status_policy: StatusPolicy,
    /// Сбрасывать фокус ввода, если клавиатура не захватывается
    pub clear_focus: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DisplayConfig {
    /// Имя дисплея; по умолчанию берётся из $DISPLAY
    #[serde(default)]
    pub name: Option<String>,
}

/// Как оценивать успех захвата, если устройств класса несколько
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// Решает статус последнего перечисленного устройства
    #[default]
    LastWins,
    /// Все устройства класса должны быть захвачены
    RequireAll,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for GrabConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            retry_interval_ms: 1000,
            hide_cursor: true,
            status_policy: StatusPolicy::LastWins,
            clear_focus: true,
        }
    }
}

impl GrabConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("LOCKGRAB_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Не удалось загрузить конфигурацию из {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Валидация настроек логирования
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Неверный уровень логирования: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "compact" | "full" => {}
            _ => anyhow::bail!("Неверный формат логирования: {}", self.logging.format),
        }

        // Валидация настроек захвата
        if self.grab.attempts == 0 {
            anyhow::bail!("attempts должно быть больше 0");
        }

        if self.grab.retry_interval_ms > 60_000 {
            anyhow::bail!("retry_interval_ms не должно превышать 60000");
        }

        if let Some(name) = &self.display.name {
            if name.trim().is_empty() {
                anyhow::bail!("Пустое имя дисплея");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grab.attempts, 4);
        assert_eq!(config.grab.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.grab.status_policy, StatusPolicy::LastWins);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.grab.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.display.name = Some("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load("/non/existent/lockgrab.toml").unwrap();
        assert_eq!(config.grab.attempts, 4);
        assert!(config.grab.hide_cursor);
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("lockgrab-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[grab]
attempts = 2
retry_interval_ms = 10
hide_cursor = false
status_policy = "require_all"
clear_focus = false

[display]
name = ":1"
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.grab.attempts, 2);
        assert_eq!(config.grab.retry_interval(), Duration::from_millis(10));
        assert!(!config.grab.hide_cursor);
        assert_eq!(config.grab.status_policy, StatusPolicy::RequireAll);
        assert_eq!(config.display.name.as_deref(), Some(":1"));
        assert_eq!(config.logging.level, "info");
    }
}
