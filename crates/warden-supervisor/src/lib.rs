pub mod channel;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod dequeue;
pub mod presence;
pub mod resources;
pub mod worker;

pub use channel::{ChannelEvent, ControlChannel};
pub use config::{SupervisorConfig, WorkerSpawnConfig};
pub use controller::{ControllerState, RuntimeController};
pub use coordinator::{CoordinatorEvent, WorkerCoordinator};
pub use presence::{PresenceMonitor, PresenceState};
pub use worker::{ProcessWorkerLauncher, WorkerLauncher, WorkerStatus};
