pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod recurrence;
pub mod remote;
pub mod store;
pub mod task;

pub use config::{AppConfig, ConfigLookup, Registry, ResourceConfig, RetryPolicy, SessionTimeouts};
pub use control::{ControlClient, ControlEnvelope};
pub use daemon::{AdminFlags, Daemon, DaemonSettings, TickReport};
pub use error::{AkrunError, Result};
pub use logging::LogRedirect;
pub use store::TaskStore;
pub use task::{TaskHandler, TaskLayout, TaskParams};
