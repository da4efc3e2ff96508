pub mod command;
pub mod driver;
pub mod fork_server;

pub use command::{LaunchError, TargetCommand, WaitOutcome};
pub use driver::{DriverConfig, DriverError, ProcessDriver};
pub use fork_server::{ForkServer, ForkServerState, RunStatus};
