//! Shared building blocks for the booking bot workspace
//!
//! Holds the config-level error type, the `Secret` wrapper used for credential
//! references and operator tokens, and the `Clock` abstraction every
//! time-dependent component takes so tests can drive wall-clock time by hand.

mod clock;
mod error;
mod secret;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use secret::Secret;
