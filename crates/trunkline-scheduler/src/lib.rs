//! Pipeline scheduling and orchestration for trunkline.

pub mod dag;
pub mod gate;
pub mod matrix;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagBuilder, PipelineDag};
pub use gate::{ConcurrencyGate, GatePermit};
pub use matrix::MatrixExpander;
pub use orchestrator::{Orchestrator, OrchestratorConfig, PlannedStage, RunPlan, plan};
pub use policy::FailFastPolicy;
pub use scheduler::{Advance, StageScheduler};
pub use triggers::TriggerClassifier;
