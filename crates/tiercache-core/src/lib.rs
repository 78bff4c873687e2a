//! Process-local caching primitives.
//!
//! - [`TtlStore`]: key/value map with proactive per-key expiry
//! - [`SingleFlight`]: per-key coalescing of in-flight operations
//! - [`LocalCache`]: the single-process cache built from the two
//!
//! The distributed cache in `tiercache-redis` reuses all three.

pub mod error;
pub mod local;
pub mod memoize;
pub mod metrics;
pub mod single_flight;
pub mod source;
pub mod store;
pub mod ttl;

pub use error::{CacheError, ErrorCategory, Result};
pub use local::LocalCache;
pub use memoize::{KeyFn, Memoizable, MemoizeOptions, Memoized, memo_key};
pub use single_flight::{Flight, SingleFlight};
pub use source::{ValueFuture, ValueSource};
pub use store::{Reservation, TtlStore};
pub use ttl::Ttl;
