use crate::events::{DeviceClass, GrabStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrabError {
    #[error("Ошибка конфигурации: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Не удалось подключиться к X-серверу: {0}")]
    Connect(#[from] x11rb::errors::ConnectError),

    #[error("Ошибка соединения с X-сервером: {0}")]
    Connection(#[from] x11rb::errors::ConnectionError),

    #[error("Ошибка ответа X-сервера: {0}")]
    Reply(#[from] x11rb::errors::ReplyError),

    #[error("Ошибка ответа X-сервера: {0}")]
    ReplyOrId(#[from] x11rb::errors::ReplyOrIdError),

    /// Сервер отказал в захвате (временная ошибка, повторяется)
    #[error("Сервер отказал в захвате ({class}): {status}")]
    Denied { class: DeviceClass, status: GrabStatus },

    /// Клавиатура не захватывается из-за владельца фокуса
    #[error("Захват клавиатуры блокируется владельцем фокуса ввода")]
    FocusBlocked,

    /// Захвачен только один класс устройств
    #[error("Частичный захват: клавиатура={keyboard}, указатель={pointer}")]
    PartialGrab { keyboard: bool, pointer: bool },

    #[error("Сервис недоступен: {0}")]
    ServiceUnavailable(String),

    #[error("Внутренняя ошибка: {0}")]
    Internal(String),
}

impl GrabError {
    pub fn denied<T>(class: DeviceClass, status: GrabStatus) -> Result<T> {
        Err(GrabError::Denied { class, status })
    }

    /// Отказ сервера, а не сбой транспорта
    pub fn is_denial(&self) -> bool {
        matches!(self, GrabError::Denied { .. } | GrabError::FocusBlocked)
    }
}

pub type Result<T> = std::result::Result<T, GrabError>;

// Удобные макросы для создания ошибок
#[macro_export]
macro_rules! grab_error {
    (service_unavailable, $($arg:tt)*) => {
        $crate::error::GrabError::ServiceUnavailable(format!($($arg)*))
    };
    (internal, $($arg:tt)*) => {
        $crate::error::GrabError::Internal(format!($($arg)*))
    };
}
