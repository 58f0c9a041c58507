//! Core state machine for the two-phase collective I/O middleware: path
//! filtering, the descriptor table, stripe/chunk buffering, the
//! gather/scatter exchange, the asynchronous write-behind worker, and
//! collective close. Consumed by `iomiddle-shim` (the `LD_PRELOAD`
//! interception layer) and `iomiddle-cli` (the configuration diagnostic
//! tool); carries no `extern "C"` surface of its own.

pub mod buffer;
pub mod config;
pub mod descriptor;
pub mod diskio;
pub mod error;
pub mod exchange;
pub mod global;
pub mod group;
pub mod middleware;
pub mod pathfilter;
pub mod stats;
pub mod worker;

pub use config::{Config, DebugLevels, StatGranularity};
pub use descriptor::{DescriptorState, FdTable, RwMode};
pub use error::{MiddlewareError, Result};
pub use global::GlobalState;
pub use group::CollectiveGroup;
#[cfg(feature = "mpi-group")]
pub use group::MpiGroup;
pub use group::FakeGroup;
pub use middleware::Middleware;
