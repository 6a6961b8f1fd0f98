//! Asynchronous execution tracking
//!
//! Submissions return immediately with an execution ARN; the run continues on
//! its own task and callers poll `describe` until a terminal status. Each
//! running execution keeps its JoinHandle, CancellationToken and a progress
//! receiver here so an abort takes effect without waiting for the next stage
//! boundary and is tagged with the stage that was actually running. Finished
//! records are retained up to a bound, oldest evicted first.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError, Result, ServiceError};
use crate::models::{PipelineInput, PipelineReport, StageName};
use crate::pipeline::{PipelineRun, PipelineRunner, PipelineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Acknowledgement returned to the submitter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub execution_arn: String,
    pub start_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_arn: String,
    pub subject: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    pub trace: Vec<PipelineState>,
}

impl ExecutionRecord {
    fn finish(&mut self, run: PipelineRun) {
        self.stop_date = Some(Utc::now());
        self.trace = run.trace;
        match run.outcome {
            Ok(report) => {
                self.status = ExecutionStatus::Succeeded;
                self.output = Some(report);
            }
            Err(error) => {
                self.status = match error.kind {
                    ErrorKind::Timeout => ExecutionStatus::TimedOut,
                    ErrorKind::Cancelled => ExecutionStatus::Aborted,
                    ErrorKind::InvalidInput | ErrorKind::Analysis => ExecutionStatus::Failed,
                };
                self.error = Some(error);
            }
        }
    }
}

struct RunningExecution {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
    progress: watch::Receiver<PipelineState>,
}

#[derive(Clone)]
pub struct ExecutionStore {
    state_machine: String,
    runner: Arc<dyn PipelineRunner>,
    max_retained: usize,
    records: Arc<DashMap<String, ExecutionRecord>>,
    running: Arc<DashMap<String, RunningExecution>>,
}

impl ExecutionStore {
    pub fn new(state_machine: impl Into<String>, runner: Arc<dyn PipelineRunner>) -> Self {
        Self {
            state_machine: state_machine.into(),
            runner,
            max_retained: usize::MAX,
            records: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Bound on stored records. Running executions are never evicted.
    pub fn with_retention(mut self, max_retained: usize) -> Self {
        self.max_retained = max_retained.max(1);
        self
    }

    /// Start a run in the background and acknowledge it
    pub fn submit(&self, input: PipelineInput) -> Submission {
        let execution_arn = format!(
            "arn:pipeline:execution:{}:{}",
            self.state_machine,
            uuid::Uuid::new_v4()
        );
        let start_date = Utc::now();

        self.records.insert(
            execution_arn.clone(),
            ExecutionRecord {
                execution_arn: execution_arn.clone(),
                subject: input.subject.clone(),
                status: ExecutionStatus::Running,
                start_date,
                stop_date: None,
                output: None,
                error: None,
                trace: vec![PipelineState::Start],
            },
        );

        self.evict_finished();

        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(PipelineState::Start);
        // Gate the task until its handle is registered so completion always
        // observes the registration it has to remove
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn({
            let runner = self.runner.clone();
            let records = self.records.clone();
            let running = self.running.clone();
            let cancel = cancel.clone();
            let arn = execution_arn.clone();
            async move {
                let _ = ready_rx.await;
                let run = runner.execute(input, &cancel, &progress_tx).await;
                if let Some(mut record) = records.get_mut(&arn)
                    && record.status == ExecutionStatus::Running
                {
                    record.finish(run);
                    tracing::info!(execution = %arn, status = ?record.status, "execution finished");
                }
                running.remove(&arn);
            }
        });
        self.running.insert(
            execution_arn.clone(),
            RunningExecution {
                handle,
                cancel,
                progress: progress_rx,
            },
        );
        let _ = ready_tx.send(());

        tracing::info!(execution = %execution_arn, "execution started");
        Submission {
            execution_arn,
            start_date,
        }
    }

    pub fn describe(&self, execution_arn: &str) -> Option<ExecutionRecord> {
        let record = self.records.get(execution_arn).map(|r| r.value().clone())?;
        Some(self.with_progress(record))
    }

    /// All executions, most recent first
    pub fn list(&self) -> Vec<ExecutionRecord> {
        let records: Vec<ExecutionRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        let mut records: Vec<ExecutionRecord> =
            records.into_iter().map(|r| self.with_progress(r)).collect();
        records.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        records
    }

    /// Abort a running execution. Aborting a finished execution is a no-op
    /// that reports its current status.
    pub fn abort(&self, execution_arn: &str) -> Result<ExecutionStatus> {
        let live = self.live_state(execution_arn);
        {
            let mut record =
                self.records
                    .get_mut(execution_arn)
                    .ok_or_else(|| ServiceError::NotFound {
                        message: format!("Execution not found: {}", execution_arn),
                    })?;
            if record.status.is_terminal() {
                return Ok(record.status);
            }

            let current = interrupted_state(live.unwrap_or(PipelineState::Start));
            let stage = current.stage().unwrap_or(StageName::VisualAnalysis);
            let mut trace = current.path();
            trace.push(PipelineState::Error);

            record.status = ExecutionStatus::Aborted;
            record.stop_date = Some(Utc::now());
            record.trace = trace;
            record.error = Some(PipelineError {
                stage,
                kind: ErrorKind::Cancelled,
                message: "Execution aborted by caller".to_string(),
            });
        }

        if let Some((_, running)) = self.running.remove(execution_arn) {
            running.cancel.cancel();
            running.handle.abort();
        }
        tracing::info!(execution = %execution_arn, "execution aborted");
        Ok(ExecutionStatus::Aborted)
    }

    /// Poll until the execution reaches a terminal status or attempts run out
    pub async fn wait(
        &self,
        execution_arn: &str,
        delay: Duration,
        max_attempts: u32,
    ) -> Option<ExecutionRecord> {
        for _ in 0..max_attempts {
            let record = self.describe(execution_arn)?;
            if record.status.is_terminal() {
                return Some(record);
            }
            tokio::time::sleep(delay).await;
        }
        None
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn live_state(&self, execution_arn: &str) -> Option<PipelineState> {
        self.running
            .get(execution_arn)
            .map(|running| *running.progress.borrow())
    }

    /// Running records report the states entered so far
    fn with_progress(&self, mut record: ExecutionRecord) -> ExecutionRecord {
        if record.status == ExecutionStatus::Running
            && let Some(state) = self.live_state(&record.execution_arn)
        {
            record.trace = state.path();
        }
        record
    }

    fn evict_finished(&self) {
        let excess = self.records.len().saturating_sub(self.max_retained);
        if excess == 0 {
            return;
        }

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .records
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.start_date, r.key().clone()))
            .collect();
        finished.sort();
        for (_, arn) in finished.into_iter().take(excess) {
            self.records.remove(&arn);
            tracing::debug!(execution = %arn, "evicted finished execution");
        }
    }
}

/// Processing state an abort interrupts. A run that has not entered a stage
/// yet is charged to the first one; one that already left the last stage is
/// charged to that.
fn interrupted_state(live: PipelineState) -> PipelineState {
    match live {
        PipelineState::Start => PipelineState::VisualAnalysis,
        PipelineState::Done | PipelineState::Error => PipelineState::ProductivityAssessment,
        state => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::models::{ActivityPattern, ImageMeta, ProductivityAssessment, VisualObservation};
    use crate::pipeline::{Pipeline, StagePolicy};
    use crate::stages::{ProductivityAssessmentStage, Stage};
    use async_trait::async_trait;

    struct Sleeper;

    #[async_trait]
    impl PipelineRunner for Sleeper {
        async fn execute(
            &self,
            _input: PipelineInput,
            cancel: &CancellationToken,
            _progress: &watch::Sender<PipelineState>,
        ) -> PipelineRun {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
            PipelineRun {
                outcome: Err(PipelineError {
                    stage: StageName::VisualAnalysis,
                    kind: ErrorKind::Cancelled,
                    message: "cancelled".to_string(),
                }),
                trace: vec![PipelineState::Start, PipelineState::Error],
            }
        }
    }

    /// Fails immediately, so every record it produces is terminal
    struct Rejecting;

    #[async_trait]
    impl PipelineRunner for Rejecting {
        async fn execute(
            &self,
            _input: PipelineInput,
            _cancel: &CancellationToken,
            _progress: &watch::Sender<PipelineState>,
        ) -> PipelineRun {
            PipelineRun {
                outcome: Err(PipelineError {
                    stage: StageName::VisualAnalysis,
                    kind: ErrorKind::Analysis,
                    message: "no usable cues".to_string(),
                }),
                trace: vec![
                    PipelineState::Start,
                    PipelineState::VisualAnalysis,
                    PipelineState::Error,
                ],
            }
        }
    }

    struct InstantVisual;

    #[async_trait]
    impl Stage for InstantVisual {
        type Input = PipelineInput;
        type Output = VisualObservation;

        async fn run(&self, input: PipelineInput) -> std::result::Result<VisualObservation, StageError> {
            Ok(VisualObservation {
                subject: input.subject,
                window: input.window,
                history: input.history,
                image: ImageMeta {
                    format: "png".to_string(),
                    width: 8,
                    height: 8,
                    bytes: 64,
                    resized: false,
                },
                cues: Vec::new(),
                summary: "desk".to_string(),
                model: "test".to_string(),
            })
        }
    }

    struct StalledActivity;

    #[async_trait]
    impl Stage for StalledActivity {
        type Input = VisualObservation;
        type Output = ActivityPattern;

        async fn run(&self, _input: VisualObservation) -> std::result::Result<ActivityPattern, StageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(StageError::analysis("stalled"))
        }
    }

    fn input() -> PipelineInput {
        PipelineInput {
            subject: "E1".to_string(),
            window: None,
            image_data: "aGVsbG8=".to_string(),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_abort_running_execution() {
        let store = ExecutionStore::new("Test", Arc::new(Sleeper));
        let submission = store.submit(input());
        assert!(submission.execution_arn.starts_with("arn:pipeline:execution:Test:"));

        let status = store.abort(&submission.execution_arn).unwrap();
        assert_eq!(status, ExecutionStatus::Aborted);

        // Idempotent
        let again = store.abort(&submission.execution_arn).unwrap();
        assert_eq!(again, ExecutionStatus::Aborted);

        let record = store.describe(&submission.execution_arn).unwrap();
        assert!(record.stop_date.is_some());
        assert_eq!(record.error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(store.running_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_is_tagged_with_running_stage() {
        let pipeline: Pipeline<InstantVisual, StalledActivity, ProductivityAssessmentStage> =
            Pipeline::new(
                InstantVisual,
                StalledActivity,
                ProductivityAssessmentStage,
                StagePolicy::default(),
            );
        let store = ExecutionStore::new("Test", Arc::new(pipeline));
        let submission = store.submit(input());
        let arn = submission.execution_arn;

        let mut reached = false;
        for _ in 0..200 {
            let record = store.describe(&arn).unwrap();
            if record.trace.last() == Some(&PipelineState::ActivityPattern) {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reached, "run never entered the activity stage");

        store.abort(&arn).unwrap();
        let record = store.describe(&arn).unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.stage, StageName::ActivityPattern);
        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert_eq!(
            record.trace,
            vec![
                PipelineState::Start,
                PipelineState::VisualAnalysis,
                PipelineState::ActivityPattern,
                PipelineState::Error,
            ]
        );
        assert_eq!(store.running_count(), 0);
    }

    #[tokio::test]
    async fn test_oldest_finished_records_are_evicted() {
        let store = ExecutionStore::new("Test", Arc::new(Rejecting)).with_retention(2);
        let delay = Duration::from_millis(5);

        let first = store.submit(input()).execution_arn;
        store.wait(&first, delay, 200).await.unwrap();
        let second = store.submit(input()).execution_arn;
        store.wait(&second, delay, 200).await.unwrap();
        let third = store.submit(input()).execution_arn;

        assert!(store.describe(&first).is_none());
        assert!(store.describe(&second).is_some());
        assert!(store.describe(&third).is_some());
        assert_eq!(store.list().len(), 2);
    }

    #[tokio::test]
    async fn test_running_records_are_never_evicted() {
        let store = ExecutionStore::new("Test", Arc::new(Sleeper)).with_retention(1);
        let first = store.submit(input()).execution_arn;
        let second = store.submit(input()).execution_arn;

        assert!(store.describe(&first).is_some());
        assert!(store.describe(&second).is_some());
        store.abort(&first).unwrap();
        store.abort(&second).unwrap();
    }

    #[tokio::test]
    async fn test_abort_unknown_execution() {
        let store = ExecutionStore::new("Test", Arc::new(Sleeper));
        let err = store.abort("arn:pipeline:execution:Test:missing").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_record_serializes_camel_case() {
        let store = ExecutionStore::new("Test", Arc::new(Sleeper));
        let submission = store.submit(input());
        let value = serde_json::to_value(store.describe(&submission.execution_arn).unwrap()).unwrap();
        assert_eq!(value["status"], "RUNNING");
        assert!(value["executionArn"].is_string());
        assert!(value["startDate"].is_string());
        assert!(value.get("stopDate").is_none());
        store.abort(&submission.execution_arn).unwrap();
    }
}
