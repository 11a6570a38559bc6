//! DisplaySession: responsibility and boundaries
//!
//! This module and its submodules talk to the device server ONLY: device
//! enumeration, per-device grab/ungrab, input focus, the server-wide fence and
//! round-trip synchronisation. They MUST NOT remember which window "owns" the
//! lock surface or decide about retries and rollbacks. That bookkeeping belongs
//! exclusively to GrabManager.

mod dry_run;
mod x11;
mod r#trait;

pub use self::dry_run::DryRunSession;
#[cfg(test)]
pub use self::dry_run::SessionCall;
pub use self::r#trait::{create_display_session, DisplaySession};
