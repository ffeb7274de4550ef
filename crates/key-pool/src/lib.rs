//! Rate-limited pool of upstream API keys
//!
//! Fronts a fixed list of interchangeable keys, each bound to a
//! requests-per-minute and a requests-per-day ceiling, and hands out the
//! first key (in configured priority order) that is within both.
//!
//! Key lifecycle:
//! 1. Keys are loaded once at startup; the list never changes afterwards
//! 2. `Pool::acquire` admits and records one use on the first free key
//! 3. A key whose 60-second window is full is `RateThrottled` until its
//!    oldest use ages out
//! 4. A key that reached its daily ceiling is `DailyExhausted` until the
//!    calendar day rolls over, which also clears its minute window
//! 5. When no key is free the caller gets a `BlockReason` telling it how
//!    long to back off
//!
//! Counters live in process memory only. Separate processes sharing the same
//! keys each see their own usage.

pub mod clock;
pub mod credential;
pub mod error;
pub mod pool;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{Credential, CredentialConfig, CredentialSnapshot, CredentialStatus};
pub use error::{Error, Result};
pub use pool::{Acquisition, Assignment, BlockReason, Pool};
