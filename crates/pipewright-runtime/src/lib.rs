pub mod child;
pub mod logs;
pub mod wire;

#[cfg(feature = "metrics")]
mod metrics;
mod supervisor;

pub use supervisor::{
    create_pipeline, PipelineError, RunningPipeline, Supervisor, SupervisorConfig,
    SupervisorError,
};
