//! GrabManager: the single owner of the keyboard and pointer grab state.
//!
//! Window-level operations (`grab_window`, `move_grab_to_window`, `grab_root`)
//! live in `window_grab`; per-class acquisition and release live in `manager`.

mod manager;
mod window_grab;

pub use manager::{GrabManager, GrabPolicy};

/// Политика без пауз между попытками
#[cfg(test)]
pub(crate) fn instant_policy() -> GrabPolicy {
    GrabPolicy {
        attempts: 4,
        retry_interval: std::time::Duration::ZERO,
        status_policy: crate::config::StatusPolicy::LastWins,
        clear_focus: true,
    }
}
