pub mod pool;
pub mod processor;

pub use pool::{ConsumerPool, DEFAULT_IDLE_INTERVAL, DEFAULT_WORKER_COUNT};
pub use processor::{process_task, upsert_item, TaskOutcome, TaskReport};
