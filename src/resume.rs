//! Resumable execution on top of the plan executor.
//!
//! [`ResumableRunner`] pairs an executor with a [`CheckpointStore`]: `run`
//! checkpoints after every completed task boundary, and `resume` restarts
//! from a stored checkpoint without re-executing completed tasks or
//! re-emitting their ledger entries. Assuming deterministic nucleus
//! outputs, a resumed run's ledger suffix is identical to what the
//! original run would have produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::context::Context;
use crate::error::Error;
use crate::executor::{
    ExecuteRequest, ExecutionFailure, ExecutionReport, PlanExecutor, ResumeSeed, RunMetrics,
};

/// Executor plus checkpoint store. Two runs with the same run id must not
/// execute concurrently; the store is the natural place for a lease.
pub struct ResumableRunner {
    executor: PlanExecutor,
    store: Arc<dyn CheckpointStore>,
}

impl ResumableRunner {
    /// Pair an executor with the checkpoint store it was built against.
    /// The executor should have been constructed with
    /// `checkpoint_store(store.clone())` so `run` persists boundaries.
    pub fn new(executor: PlanExecutor, store: Arc<dyn CheckpointStore>) -> Self {
        Self { executor, store }
    }

    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    /// Execute from scratch, writing checkpoints on the configured
    /// interval.
    pub async fn run(
        &self,
        request: ExecuteRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        self.executor.execute(request).await
    }

    /// Resume from a stored checkpoint: completed tasks keep their outputs
    /// and ledger entries, and scheduling continues from the boundary.
    pub async fn resume(
        &self,
        request: ExecuteRequest,
        checkpoint_id: &str,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        let run_id = match self.run_id() {
            Ok(run_id) => run_id,
            Err(e) => return Err(self.bare_failure(e)),
        };
        let checkpoint = match self.store.load(&run_id, checkpoint_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Err(self.bare_failure(e)),
        };

        if checkpoint.plan.id != request.plan.id {
            return Err(self.bare_failure(Error::plan_invalid(format!(
                "checkpoint {} was taken for plan {}, not {}",
                checkpoint_id, checkpoint.plan.id, request.plan.id
            ))));
        }
        if checkpoint.goal.id != request.goal.id {
            return Err(self.bare_failure(Error::plan_invalid(format!(
                "checkpoint {} was taken for goal {}, not {}",
                checkpoint_id, checkpoint.goal.id, request.goal.id
            ))));
        }

        let seed = ResumeSeed {
            checkpoint_id: checkpoint_id.to_string(),
            completed_outputs: checkpoint.completed_outputs.clone(),
            ledger_prefix: checkpoint.ledger_prefix.clone(),
            scope_snapshot: checkpoint.internal_scope.clone(),
        };
        // the checkpointed context carries every promotion made before the
        // boundary; the request's context is superseded by it
        let request = ExecuteRequest {
            goal: request.goal,
            context: checkpoint.context.clone(),
            plan: request.plan,
            cancellation: request.cancellation,
        };
        self.executor.run(request, Some(seed)).await
    }

    /// Resume from the most recent checkpoint, or run from scratch when
    /// none exists.
    pub async fn resume_latest(
        &self,
        request: ExecuteRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        let run_id = match self.run_id() {
            Ok(run_id) => run_id,
            Err(e) => return Err(self.bare_failure(e)),
        };
        match self.store.latest(&run_id).await {
            Ok(Some(checkpoint_id)) => self.resume(request, &checkpoint_id).await,
            Ok(None) => self.run(request).await,
            Err(e) => Err(self.bare_failure(e)),
        }
    }

    fn run_id(&self) -> crate::error::Result<String> {
        self.executor
            .config()
            .run_id
            .clone()
            .ok_or_else(|| Error::CheckpointStore("resumable runs require a run_id".into()))
    }

    /// A failure raised before any execution state existed.
    fn bare_failure(&self, error: Error) -> ExecutionFailure {
        ExecutionFailure {
            error,
            report: ExecutionReport {
                run_id: self.executor.config().run_id.clone().unwrap_or_default(),
                outputs_by_task: BTreeMap::new(),
                task_records: BTreeMap::new(),
                ledger: Vec::new(),
                context: Context::with_id("unavailable"),
                metrics: RunMetrics::default(),
            },
        }
    }
}

impl std::fmt::Debug for ResumableRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableRunner")
            .field("executor", &self.executor)
            .finish()
    }
}
