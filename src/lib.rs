pub mod clients;
pub mod config;
pub mod error;
pub mod executions;
pub mod http;
pub mod imaging;
pub mod models;
pub mod pipeline;
pub mod stages;

pub use error::{PipelineError, Result, ServiceError, StageError};
pub use models::{PipelineInput, PipelineReport};
pub use pipeline::{DefaultPipeline, Pipeline, PipelineRun, PipelineRunner, PipelineState};
