//! Pool of reusable credentialed accounts with cooldown and quarantine
//!
//! Selection is least-recently-used among accounts that are active, not in use,
//! and past any cooldown or quarantine. The pool is the only writer of account
//! lifecycle fields; everything else goes through `acquire`/`release`.
//!
//! Account lifecycle:
//! 1. Account created out-of-band (accounts file / external admin), `available`
//! 2. `acquire()` picks the oldest `last_used_at` (never-used first), marks it `in_use`
//! 3. `release(success | no_capacity)` → `cooldown` for `cooldown` duration
//! 4. `release(transient_failure)` → back to `available`, unless the consecutive
//!    failure count reaches `max_failures`, then `quarantined`
//! 5. `release(banned)` → `quarantined` for twice the quarantine duration
//! 6. Cooldown/quarantine expiry → `available` again, derived from timestamps

pub mod account;
pub mod error;
pub mod pool;
pub mod repository;

pub use account::{Account, AccountSeed, AccountStatus, ReleaseOutcome};
pub use error::{Error, Result};
pub use pool::{AccountPool, PoolConfig, PoolStatus};
pub use repository::{AccountRelease, MemoryRepository, PoolStats, ResourceRepository};
