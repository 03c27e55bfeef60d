pub mod config;
pub mod environment;
pub mod error;

pub use config::HostConfig;
pub use environment::Environment;
pub use error::{HandlerError, QueueStage, WorkerError, WorkerResult};
