//! Client-facing proxy surface: router, handlers, worker pool, stats.

pub mod handlers;
mod ids_repair;
pub mod routes;
pub mod stats;
pub mod workers;

pub use handlers::{HandlerKind, Registry};
pub use routes::{build_router, GatewayState};
pub use workers::{WorkerPool, WorkerPoolConfig};
