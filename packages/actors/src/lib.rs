//! Actor system for the fine-tuning job orchestrator.
//!
//! # Architecture
//!
//! - `Orchestrator` - Owns the job registry and the FIFO queue
//! - `DispatcherActor` - Moves the next queued job onto the accelerator
//! - `MonitorActor` - One per running job, polls its progress file
//!
//! Around the actors sit the process supervisor, the persistence gateway
//! in front of the remote store, and the broadcast hub for live updates.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{OrchestratorConfig, Services, start_orchestrator, start_dispatcher};
//!
//! let services = Arc::new(Services::new(config, store));
//! let (orchestrator, _) = start_orchestrator(services.clone()).await?;
//! actors::recover(&services, &orchestrator).await;
//! let (dispatcher, _) = start_dispatcher(orchestrator.clone(), services).await?;
//! ```

pub mod alerts;
pub mod config;
mod dispatcher;
pub mod gateway;
pub mod housekeeping;
pub mod hub;
pub mod layout;
mod messages;
mod monitor;
mod orchestrator;
pub mod process;
mod recovery;
pub mod remote;

pub use alerts::{Alert, AlertKind, AlertSink, TracingAlerts};
pub use config::{ConfigError, OrchestratorConfig, PersistenceConfig, StoreConfig, WorkerCommand};
pub use dispatcher::{DispatcherActor, start_dispatcher};
pub use gateway::{Delivery, PersistenceGateway, SweepReport};
pub use hub::{BroadcastHub, SubscriberId};
pub use layout::{DataLayout, JobPaths};
pub use messages::{
    ActorError, ActorResult, DispatcherMessage, JobOutcome, MonitorMessage, OrchestratorMessage,
    StopKind, SubmitReceipt,
};
pub use monitor::{MonitorActor, MonitorTarget};
pub use orchestrator::{Orchestrator, Services, start_orchestrator};
pub use process::{ProcessError, ProcessSupervisor, TerminationOutcome, WorkerProcess};
pub use recovery::{RecoveryReport, recover};
pub use remote::{EmbeddedStore, HttpRemoteStore, RemoteStore, StoreError, StoreFuture};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
