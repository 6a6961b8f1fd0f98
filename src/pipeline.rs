//! Orchestrator: sequences the stages and settles every run in exactly one
//! terminal state.
//!
//! ```text
//! Start -> VisualAnalysis -> ActivityPattern -> ProductivityAssessment -> Done
//!               \________________\____________________\______________-> Error
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{InferenceClient, VisionClient};
use crate::config::Config;
use crate::error::{PipelineError, ServiceError, StageError};
use crate::models::{
    ActivityPattern, PipelineInput, PipelineReport, ProductivityAssessment, StageName,
    VisualObservation,
};
use crate::stages::{ActivityPatternStage, ProductivityAssessmentStage, Stage, VisualAnalysisStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Start,
    VisualAnalysis,
    ActivityPattern,
    ProductivityAssessment,
    Done,
    Error,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }

    /// Successor on success; terminal states have none
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Start => Some(PipelineState::VisualAnalysis),
            PipelineState::VisualAnalysis => Some(PipelineState::ActivityPattern),
            PipelineState::ActivityPattern => Some(PipelineState::ProductivityAssessment),
            PipelineState::ProductivityAssessment => Some(PipelineState::Done),
            PipelineState::Done | PipelineState::Error => None,
        }
    }

    /// Success path from `Start` up to and including `self`
    pub fn path(&self) -> Vec<PipelineState> {
        let mut trace = vec![PipelineState::Start];
        let mut state = PipelineState::Start;
        while state != *self {
            match state.next() {
                Some(next) => {
                    trace.push(next);
                    state = next;
                }
                None => break,
            }
        }
        trace
    }

    pub fn stage(&self) -> Option<StageName> {
        match self {
            PipelineState::VisualAnalysis => Some(StageName::VisualAnalysis),
            PipelineState::ActivityPattern => Some(StageName::ActivityPattern),
            PipelineState::ProductivityAssessment => Some(StageName::ProductivityAssessment),
            _ => None,
        }
    }
}

/// Per-stage timeout and retry settings
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    pub timeout: Duration,
    /// Extra attempts after the first; 0 disables retry
    pub retries: u32,
    /// Delay before the first retry, doubled for each further attempt
    pub backoff: Duration,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retries: 0,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Result of one run plus the states it passed through
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub outcome: Result<PipelineReport, PipelineError>,
    pub trace: Vec<PipelineState>,
}

impl PipelineRun {
    pub fn terminal_state(&self) -> PipelineState {
        match self.outcome {
            Ok(_) => PipelineState::Done,
            Err(_) => PipelineState::Error,
        }
    }
}

/// Object-safe entry point used by the execution store and the gateway.
/// Implementations publish each state they enter on `progress`.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn execute(
        &self,
        input: PipelineInput,
        cancel: &CancellationToken,
        progress: &watch::Sender<PipelineState>,
    ) -> PipelineRun;
}

pub struct Pipeline<V, A, P> {
    visual: V,
    activity: A,
    assessment: P,
    policy: StagePolicy,
}

pub type DefaultPipeline =
    Pipeline<VisualAnalysisStage, ActivityPatternStage, ProductivityAssessmentStage>;

impl DefaultPipeline {
    /// Wire the production stages against the configured inference endpoint
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let client = VisionClient::new(&config.inference).map_err(|e| ServiceError::Config {
            message: format!("inference client: {e}"),
        })?;
        info!(
            "Vision model {} at {}",
            client.model(),
            client.endpoint()
        );
        Ok(Self::with_client(Arc::new(client), config))
    }

    pub fn with_client(client: Arc<dyn InferenceClient>, config: &Config) -> Self {
        Pipeline::new(
            VisualAnalysisStage::new(client, config.image_limits()),
            ActivityPatternStage,
            ProductivityAssessmentStage,
            config.stage_policy(),
        )
    }
}

impl<V, A, P> Pipeline<V, A, P>
where
    V: Stage<Input = PipelineInput, Output = VisualObservation>,
    A: Stage<Input = VisualObservation, Output = ActivityPattern>,
    P: Stage<Input = ActivityPattern, Output = ProductivityAssessment>,
{
    pub fn new(visual: V, activity: A, assessment: P, policy: StagePolicy) -> Self {
        Self {
            visual,
            activity,
            assessment,
            policy,
        }
    }

    pub async fn run(&self, input: PipelineInput) -> PipelineRun {
        self.run_with_cancel(input, &CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        input: PipelineInput,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let (progress, _) = watch::channel(PipelineState::Start);
        self.run_tracked(input, cancel, &progress).await
    }

    pub async fn run_tracked(
        &self,
        input: PipelineInput,
        cancel: &CancellationToken,
        progress: &watch::Sender<PipelineState>,
    ) -> PipelineRun {
        let started = Instant::now();
        let subject = input.subject.clone();
        let mut trace = vec![PipelineState::Start];
        let enter = |trace: &mut Vec<PipelineState>, state: PipelineState| {
            trace.push(state);
            progress.send_replace(state);
        };

        enter(&mut trace, PipelineState::VisualAnalysis);
        let visual = match execute_stage(
            &self.visual,
            StageName::VisualAnalysis,
            input,
            &self.policy,
            cancel,
        )
        .await
        {
            Ok(out) => out,
            Err(err) => return fail(trace, StageName::VisualAnalysis, err),
        };

        enter(&mut trace, PipelineState::ActivityPattern);
        let pattern = match execute_stage(
            &self.activity,
            StageName::ActivityPattern,
            visual.clone(),
            &self.policy,
            cancel,
        )
        .await
        {
            Ok(out) => out,
            Err(err) => return fail(trace, StageName::ActivityPattern, err),
        };

        enter(&mut trace, PipelineState::ProductivityAssessment);
        let assessment = match execute_stage(
            &self.assessment,
            StageName::ProductivityAssessment,
            pattern.clone(),
            &self.policy,
            cancel,
        )
        .await
        {
            Ok(out) => out,
            Err(err) => return fail(trace, StageName::ProductivityAssessment, err),
        };

        enter(&mut trace, PipelineState::Done);
        info!(
            subject = %subject,
            score = assessment.score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline run succeeded"
        );

        PipelineRun {
            outcome: Ok(PipelineReport {
                visual_analysis: visual,
                activity_pattern: pattern,
                productivity_assessment: assessment,
            }),
            trace,
        }
    }
}

#[async_trait]
impl<V, A, P> PipelineRunner for Pipeline<V, A, P>
where
    V: Stage<Input = PipelineInput, Output = VisualObservation>,
    A: Stage<Input = VisualObservation, Output = ActivityPattern>,
    P: Stage<Input = ActivityPattern, Output = ProductivityAssessment>,
{
    async fn execute(
        &self,
        input: PipelineInput,
        cancel: &CancellationToken,
        progress: &watch::Sender<PipelineState>,
    ) -> PipelineRun {
        self.run_tracked(input, cancel, progress).await
    }
}

fn fail(mut trace: Vec<PipelineState>, stage: StageName, err: StageError) -> PipelineRun {
    let error = PipelineError::from_stage(stage, err);
    warn!(stage = %stage, kind = ?error.kind, "pipeline run failed: {}", error.message);
    trace.push(PipelineState::Error);
    PipelineRun {
        outcome: Err(error),
        trace,
    }
}

/// Run one stage under the policy: cancellation is checked before every
/// attempt, each attempt is bounded by the timeout.
async fn execute_stage<S: Stage>(
    stage: &S,
    name: StageName,
    input: S::Input,
    policy: &StagePolicy,
    cancel: &CancellationToken,
) -> Result<S::Output, StageError> {
    let timeout_ms = policy.timeout.as_millis() as u64;
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(policy.timeout, stage.run(input.clone())).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout { timeout_ms }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(stage = %name, attempt, elapsed_ms, "stage completed");
                return Ok(output);
            }
            Err(err) if err.is_retryable() && attempt < policy.retries => {
                let delay = policy.backoff.saturating_mul(1u32 << attempt.min(16));
                warn!(
                    stage = %name,
                    attempt,
                    elapsed_ms,
                    delay_ms = delay.as_millis() as u64,
                    "stage failed, retrying: {}",
                    err
                );
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                debug!(stage = %name, attempt, elapsed_ms, "stage failed: {}", err);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_progression() {
        let mut state = PipelineState::Start;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(
            visited,
            vec![
                PipelineState::Start,
                PipelineState::VisualAnalysis,
                PipelineState::ActivityPattern,
                PipelineState::ProductivityAssessment,
                PipelineState::Done,
            ]
        );
        assert!(state.is_terminal());
        assert_eq!(PipelineState::Error.next(), None);
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(
            PipelineState::ActivityPattern.stage(),
            Some(StageName::ActivityPattern)
        );
        assert_eq!(PipelineState::Start.stage(), None);
        assert_eq!(PipelineState::Done.stage(), None);
    }

    #[test]
    fn test_path_to_state() {
        assert_eq!(PipelineState::Start.path(), vec![PipelineState::Start]);
        assert_eq!(
            PipelineState::ActivityPattern.path(),
            vec![
                PipelineState::Start,
                PipelineState::VisualAnalysis,
                PipelineState::ActivityPattern,
            ]
        );
        assert_eq!(PipelineState::Done.path().len(), 5);
    }

    struct Flaky {
        failures_left: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Stage for Flaky {
        type Input = u32;
        type Output = u32;

        async fn run(&self, input: u32) -> Result<u32, StageError> {
            use std::sync::atomic::Ordering;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StageError::analysis("transient"));
            }
            Ok(input + 1)
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures_left: std::sync::atomic::AtomicU32::new(failures),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let policy = StagePolicy {
            timeout: Duration::from_secs(1),
            retries: 2,
            backoff: Duration::from_millis(1),
        };
        let out = execute_stage(
            &flaky(2),
            StageName::VisualAnalysis,
            1,
            &policy,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out, Ok(2));
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let out = execute_stage(
            &flaky(1),
            StageName::VisualAnalysis,
            1,
            &StagePolicy::default(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out, Err(StageError::analysis("transient")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = execute_stage(
            &flaky(0),
            StageName::VisualAnalysis,
            1,
            &StagePolicy::default(),
            &cancel,
        )
        .await;
        assert_eq!(out, Err(StageError::Cancelled));
    }
}
