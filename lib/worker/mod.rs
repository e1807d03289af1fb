//! Job queue, supervised worker pool and the periodic pollers that feed them.

pub mod poller;
pub mod pool;
pub mod queue;

pub use poller::{poll_orders_once, OrderSource, PollReport, PollerConfig, Pollers};
pub use pool::WorkerPool;
pub use queue::{JobQueue, Offer};
