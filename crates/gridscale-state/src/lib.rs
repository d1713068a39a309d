//! gridscale-state — persisted controller state and the cluster lock.
//!
//! Backed by [redb](https://docs.rs/redb). Two tables live in one database:
//!
//! - `controller_state`: string values keyed by hierarchical paths of the
//!   form `<root>/<service>/<instance>/<field>`. Numbers are stored as
//!   decimal text. Every read and write is its own transaction, so
//!   multi-key updates are not atomic.
//! - `locks`: JSON-encoded leases used by [`DistributedLock`] to make sure
//!   at most one autoscaling pass runs at a time.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod controller;
pub mod error;
pub mod lock;
pub mod store;
pub mod tables;

pub use controller::{ControllerState, CpuSample, PidState};
pub use error::{StateError, StateResult};
pub use lock::{DistributedLock, LockBackend, LockGuard};
pub use store::StateStore;
