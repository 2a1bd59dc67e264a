pub mod dispatcher;
pub mod events;
pub mod job;
pub mod liveness;
pub mod manager;
pub mod registry;
pub mod store;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use events::{DispatchTrigger, EventBus, ManagerEvent};
pub use job::{DispatchedJob, JobDefinition, JobHistory, JobHistoryDetail, JobSpec, JobStatus};
pub use liveness::{LivenessMonitor, LivenessReport};
pub use manager::{CancelOutcome, JobManager};
pub use registry::{NodeRegistry, WorkerNode};
pub use store::{JobStore, TransitionOutcome};
