//! Job lifecycle: the record, its registry and the tasks that drive it.

pub mod model;
pub mod orchestrator;
pub mod purge;
pub mod store;

pub use model::{Job, JobStatus, JobUpdate, ResultFile};
pub use orchestrator::{ConversionOrchestrator, ConversionRequest, OrchestratorConfig};
pub use purge::{JobPurgeService, PurgeConfig};
pub use store::{JobStats, JobStore, JobStoreConfig};
