//! Per-task orchestration for the OSMO agent.
//!
//! Provides:
//! - `Agent` - Lifecycle controller: staging, barrier, workload, log drain
//! - `Barrier` - Sequential rendezvous with sibling tasks
//! - `DataStager` - Input download/mount and output upload
//! - `TaskPlan` - Declared inputs, outputs and entry command

pub mod barrier;
pub mod lifecycle;
pub mod plan;
pub mod staging;

pub use barrier::{Barrier, BarrierError};
pub use lifecycle::{Agent, LifecycleConfig, Services};
pub use plan::TaskPlan;
pub use staging::{
    BackendRegistry, CommandBackend, DataCredential, DataCredentials, DataStager, InputSpec,
    MountTable, OutputSpec, StagingConfig, StagingError,
};
