//! The three analysis stages and the trait the orchestrator drives them through

use async_trait::async_trait;

use crate::error::StageError;

pub mod activity;
pub mod assessment;
pub mod visual;

pub use activity::ActivityPatternStage;
pub use assessment::ProductivityAssessmentStage;
pub use visual::VisualAnalysisStage;

/// One unit of the pipeline. Inputs are cloned when a stage is retried.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    async fn run(&self, input: Self::Input) -> Result<Self::Output, StageError>;
}
