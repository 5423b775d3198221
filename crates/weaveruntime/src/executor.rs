use crate::hooks::{HookContext, StepHook};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use weavecore::{
    BranchNode, Composition, EventEmitter, ExecutionEvent, ExecutionId, FlowError, LoopNode,
    LoopOutcome, ParallelNode, SequentialNode, SharedState, Step, StepContext, StepOutput,
    TerminationSignal, Value, Workflow,
};

/// Walks a composition tree against one shared state.
///
/// Sequential and loop bodies run one child at a time and merge after every
/// step. Parallel siblings each run on their own copy of the entry snapshot
/// and only their declared output keys are merged once all of them finish.
#[derive(Clone)]
pub struct Executor {
    events: broadcast::Sender<ExecutionEvent>,
    hooks: Arc<Vec<Arc<dyn StepHook>>>,
}

impl Executor {
    pub fn new(events: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            events,
            hooks: Arc::new(Vec::new()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        Arc::make_mut(&mut self.hooks).push(hook);
        self
    }

    /// Run `workflow` from `initial` and return the final state.
    pub async fn run(
        &self,
        workflow: &Workflow,
        initial: SharedState,
    ) -> Result<RunReport, FlowError> {
        self.run_with_cancellation(workflow, initial, CancellationToken::new())
            .await
    }

    /// Like [`Executor::run`], stopping at the next step boundary once
    /// `cancellation` fires. Cancelling never interrupts a running step and
    /// only affects the run the token was handed to.
    pub async fn run_with_cancellation(
        &self,
        workflow: &Workflow,
        initial: SharedState,
        cancellation: CancellationToken,
    ) -> Result<RunReport, FlowError> {
        let execution_id = ExecutionId::new_v4();
        let start = Instant::now();

        self.emit(ExecutionEvent::RunStarted {
            execution_id,
            workflow: workflow.name.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!("Starting workflow run {} ({})", workflow.name, execution_id);

        let scope = Scope {
            execution_id,
            loop_marker: None,
            defer_hooks: false,
            cancellation,
        };
        let mut state = initial;
        let mut trace = Trace::default();

        let result = self
            .execute_node(workflow.root(), &mut state, &scope, &mut trace)
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        self.emit(ExecutionEvent::RunCompleted {
            execution_id,
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        match result {
            Ok(_) => {
                tracing::info!(
                    "Workflow {} finished: {} steps in {}ms",
                    workflow.name,
                    trace.steps_executed,
                    duration_ms
                );
                Ok(RunReport {
                    execution_id,
                    state,
                    loops: trace.loops,
                    steps_executed: trace.steps_executed,
                    duration_ms,
                })
            }
            Err(e) => {
                tracing::error!("Workflow {} failed: {}", workflow.name, e);
                Err(e)
            }
        }
    }

    fn execute_node<'a>(
        &'a self,
        node: &'a Composition,
        state: &'a mut SharedState,
        scope: &'a Scope,
        trace: &'a mut Trace,
    ) -> BoxFuture<'a, Result<Option<TerminationSignal>, FlowError>> {
        let span = tracing::debug_span!("node", name = node.name(), kind = node.kind());
        async move {
            match node {
                Composition::Step(step) => self.execute_step(step, state, scope, trace).await,
                Composition::Sequential(seq) => {
                    self.execute_sequential(seq, state, scope, trace).await
                }
                Composition::Parallel(par) => self.execute_parallel(par, state, scope, trace).await,
                Composition::Loop(lp) => self.execute_loop(lp, state, scope, trace).await,
                Composition::Branch(branch) => {
                    self.execute_branch(branch, state, scope, trace).await
                }
            }
        }
        .instrument(span)
        .boxed()
    }

    async fn execute_step(
        &self,
        step: &Step,
        state: &mut SharedState,
        scope: &Scope,
        trace: &mut Trace,
    ) -> Result<Option<TerminationSignal>, FlowError> {
        let output = self.invoke(step, state, scope).await?;
        trace.steps_executed += 1;

        match (step.output_key(), output.value) {
            (Some(key), Some(value)) => {
                state.insert(key, value);
            }
            (Some(key), None) => {
                tracing::debug!("Step {} produced no value for {}", step.name(), key);
            }
            (None, Some(_)) => {
                tracing::debug!("Step {} has no output key, discarding value", step.name());
            }
            (None, None) => {}
        }

        let signal = output.signal.filter(TerminationSignal::is_set);
        if let Some(signal) = &signal {
            mark_terminated(step.name(), signal, state, scope);
        }

        if scope.defer_hooks {
            trace.deferred_hooks.push(DeferredHook {
                step: step.name().to_string(),
                output_key: step.output_key().map(str::to_string),
            });
        } else {
            self.run_hooks(scope.execution_id, step.name(), step.output_key(), state)
                .await?;
        }

        Ok(signal)
    }

    /// Resolve inputs and run the unit of work. Does not touch state.
    async fn invoke(
        &self,
        step: &Step,
        state: &SharedState,
        scope: &Scope,
    ) -> Result<StepOutput, FlowError> {
        if scope.cancellation.is_cancelled() {
            return Err(FlowError::Cancelled {
                step: step.name().to_string(),
            });
        }

        let inputs = step.resolve_inputs(state).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;

        self.emit(ExecutionEvent::StepStarted {
            execution_id: scope.execution_id,
            step: step.name().to_string(),
            kind: step.kind().to_string(),
            timestamp: Utc::now(),
        });
        tracing::debug!("Running step {} ({})", step.name(), step.kind());

        let ctx = StepContext::new(
            step.name(),
            inputs,
            EventEmitter::new(scope.execution_id, step.name(), self.events.clone()),
        );

        let start = Instant::now();
        let result = step.work().execute(ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::debug!("Step {} completed in {}ms", step.name(), duration_ms);
                self.emit(ExecutionEvent::StepCompleted {
                    execution_id: scope.execution_id,
                    step: step.name().to_string(),
                    output_key: step.output_key().map(str::to_string),
                    output: output.value.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(output)
            }
            Err(e) => {
                tracing::error!("Step {} failed: {}", step.name(), e);
                self.emit(ExecutionEvent::StepFailed {
                    execution_id: scope.execution_id,
                    step: step.name().to_string(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(FlowError::UnitOfWork {
                    step: step.name().to_string(),
                    source: e,
                })
            }
        }
    }

    async fn execute_sequential(
        &self,
        node: &SequentialNode,
        state: &mut SharedState,
        scope: &Scope,
        trace: &mut Trace,
    ) -> Result<Option<TerminationSignal>, FlowError> {
        let mut signal = None;
        for child in node.children() {
            let child_signal = self.execute_node(child, state, scope, trace).await?;
            if signal.is_none() {
                signal = child_signal;
            }
        }
        Ok(signal)
    }

    async fn execute_parallel(
        &self,
        node: &ParallelNode,
        state: &mut SharedState,
        scope: &Scope,
        trace: &mut Trace,
    ) -> Result<Option<TerminationSignal>, FlowError> {
        let snapshot = state.clone();
        let branch_scope = Scope {
            defer_hooks: true,
            ..scope.clone()
        };

        // Dropping the run aborts every sibling still in the set.
        let mut siblings = JoinSet::new();
        for (idx, child) in node.children().iter().enumerate() {
            let exec = self.clone();
            let child = Arc::clone(child);
            let scope = branch_scope.clone();
            let mut branch_state = snapshot.clone();
            let task = async move {
                let mut branch_trace = Trace::default();
                let result = AssertUnwindSafe(exec.execute_node(
                    &child,
                    &mut branch_state,
                    &scope,
                    &mut branch_trace,
                ))
                .catch_unwind()
                .await;
                (idx, result, branch_state, branch_trace)
            };
            siblings.spawn(task.in_current_span());
        }

        // Barrier: every sibling finishes, failed or not.
        let mut outcomes: Vec<Option<SiblingOutcome>> =
            (0..node.children().len()).map(|_| None).collect();
        while let Some(joined) = siblings.join_next().await {
            match joined {
                Ok((idx, result, branch_state, branch_trace)) => {
                    outcomes[idx] = Some((result, branch_state, branch_trace));
                }
                Err(join_err) => {
                    tracing::error!("Sibling task of '{}' was lost: {}", node.name(), join_err)
                }
            }
        }

        let mut failures = Vec::new();
        let mut finished = Vec::with_capacity(outcomes.len());
        for (child, outcome) in node.children().iter().zip(outcomes) {
            match outcome {
                Some((Ok(Ok(signal)), branch_state, branch_trace)) => {
                    finished.push((child, signal, branch_state, branch_trace));
                }
                Some((Ok(Err(e)), _, _)) => failures.push(e),
                Some((Err(_panic), _, _)) => failures.push(FlowError::Execution(format!(
                    "Sibling '{}' of '{}' panicked",
                    child.name(),
                    node.name()
                ))),
                None => failures.push(FlowError::Execution(format!(
                    "Sibling '{}' of '{}' did not complete",
                    child.name(),
                    node.name()
                ))),
            }
        }

        if !failures.is_empty() {
            tracing::error!(
                "Parallel node {}: {} of {} siblings failed",
                node.name(),
                failures.len(),
                node.children().len()
            );
            return Err(FlowError::SiblingFailures {
                node: node.name().to_string(),
                failures,
            });
        }

        let mut signal = None;
        for (child, child_signal, branch_state, branch_trace) in finished {
            for key in child.output_keys() {
                if let Some(value) = branch_state.get(&key) {
                    state.insert(key, value.clone());
                }
            }
            trace.absorb(branch_trace);
            if signal.is_none() {
                signal = child_signal;
            }
        }

        if let Some(signal) = &signal {
            mark_terminated(node.name(), signal, state, scope);
        }

        if !scope.defer_hooks {
            for deferred in std::mem::take(&mut trace.deferred_hooks) {
                self.run_hooks(
                    scope.execution_id,
                    &deferred.step,
                    deferred.output_key.as_deref(),
                    state,
                )
                .await?;
            }
        }

        Ok(signal)
    }

    async fn execute_loop(
        &self,
        node: &LoopNode,
        state: &mut SharedState,
        scope: &Scope,
        trace: &mut Trace,
    ) -> Result<Option<TerminationSignal>, FlowError> {
        let body_scope = Scope {
            loop_marker: Some(node.marker_key().to_string()),
            ..scope.clone()
        };

        if node.resets_marker() {
            state.insert(node.marker_key(), Value::Bool(false));
        }

        let mut status = LoopStatus::Running;
        let mut iteration = 0;

        while status == LoopStatus::Running {
            iteration += 1;
            self.emit(ExecutionEvent::LoopIteration {
                execution_id: scope.execution_id,
                node: node.name().to_string(),
                iteration,
                timestamp: Utc::now(),
            });
            tracing::debug!("Loop {} pass {}/{}", node.name(), iteration, node.max_iterations());

            // A pass always runs to completion; the signal is only acted on
            // at the pass boundary.
            let mut pass_signal: Option<TerminationSignal> = None;
            for child in node.children() {
                let child_signal = self
                    .execute_node(child, state, &body_scope, trace)
                    .await?;
                if pass_signal.is_none() {
                    pass_signal = child_signal;
                }
            }

            status = match pass_signal {
                Some(signal) => LoopStatus::TerminatedBySignal(signal.message),
                None if iteration >= node.max_iterations() => LoopStatus::TerminatedByCap,
                None => LoopStatus::Running,
            };
        }

        let outcome = match status {
            LoopStatus::TerminatedBySignal(message) => {
                tracing::info!(
                    "Loop {} terminated by signal after {} pass(es)",
                    node.name(),
                    iteration
                );
                LoopOutcome::TerminatedBySignal { message }
            }
            _ => {
                tracing::warn!(
                    "Loop {} reached its cap of {} iterations",
                    node.name(),
                    node.max_iterations()
                );
                LoopOutcome::TerminatedByCap
            }
        };

        self.emit(ExecutionEvent::LoopFinished {
            execution_id: scope.execution_id,
            node: node.name().to_string(),
            iterations: iteration,
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });
        trace.loops.push(LoopReport {
            node: node.name().to_string(),
            iterations: iteration,
            outcome,
        });

        // The signal belongs to this loop and stops here.
        Ok(None)
    }

    async fn execute_branch(
        &self,
        node: &BranchNode,
        state: &mut SharedState,
        scope: &Scope,
        trace: &mut Trace,
    ) -> Result<Option<TerminationSignal>, FlowError> {
        let value = state.require(node.name(), node.route_key())?;
        let route = value
            .as_str()
            .ok_or_else(|| FlowError::InvalidRoute {
                node: node.name().to_string(),
                key: node.route_key().to_string(),
                actual: value.type_name().to_string(),
            })?
            .to_string();

        let selected = node.route(&route).cloned();
        self.emit(ExecutionEvent::BranchSelected {
            execution_id: scope.execution_id,
            node: node.name().to_string(),
            route: selected.as_ref().map(|child| child.name().to_string()),
            timestamp: Utc::now(),
        });

        match selected {
            Some(child) => {
                tracing::debug!("Branch {} routed '{}' to {}", node.name(), route, child.name());
                self.execute_node(&child, state, scope, trace).await
            }
            None => {
                tracing::debug!("Branch {} has no route for '{}'", node.name(), route);
                Ok(None)
            }
        }
    }

    async fn run_hooks(
        &self,
        execution_id: ExecutionId,
        step: &str,
        output_key: Option<&str>,
        state: &SharedState,
    ) -> Result<(), FlowError> {
        let ctx = HookContext {
            execution_id,
            step,
            output_key,
            state,
        };
        for hook in self.hooks.iter() {
            hook.after_step(&ctx).await.map_err(|e| FlowError::Hook {
                hook: hook.name().to_string(),
                step: step.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn emit(&self, event: ExecutionEvent) {
        let _ = self.events.send(event);
    }
}

/// Record a termination signal in state so later steps of the same pass,
/// and later replays of the state, can see the loop already ended.
fn mark_terminated(source: &str, signal: &TerminationSignal, state: &mut SharedState, scope: &Scope) {
    match &scope.loop_marker {
        Some(marker) => {
            tracing::debug!(
                "{} raised termination{}",
                source,
                signal
                    .message
                    .as_deref()
                    .map(|m| format!(": {}", m))
                    .unwrap_or_default()
            );
            state.insert(marker.clone(), Value::Bool(true));
        }
        None => tracing::warn!("{} raised a termination signal outside any loop; ignored", source),
    }
}

type SiblingOutcome = (
    Result<Result<Option<TerminationSignal>, FlowError>, Box<dyn Any + Send>>,
    SharedState,
    Trace,
);

#[derive(Debug, Clone, PartialEq)]
enum LoopStatus {
    Running,
    TerminatedBySignal(Option<String>),
    TerminatedByCap,
}

#[derive(Clone)]
struct Scope {
    execution_id: ExecutionId,
    /// Marker key of the innermost enclosing loop
    loop_marker: Option<String>,
    /// Set inside parallel siblings; hooks wait for the barrier merge
    defer_hooks: bool,
    cancellation: CancellationToken,
}

struct DeferredHook {
    step: String,
    output_key: Option<String>,
}

#[derive(Default)]
struct Trace {
    loops: Vec<LoopReport>,
    steps_executed: usize,
    deferred_hooks: Vec<DeferredHook>,
}

impl Trace {
    fn absorb(&mut self, other: Trace) {
        self.loops.extend(other.loops);
        self.steps_executed += other.steps_executed;
        self.deferred_hooks.extend(other.deferred_hooks);
    }
}

/// How one loop execution ended
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub node: String,
    pub iterations: u32,
    pub outcome: LoopOutcome,
}

/// Result of a workflow run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub state: SharedState,
    pub loops: Vec<LoopReport>,
    pub steps_executed: usize,
    pub duration_ms: u64,
}

impl RunReport {
    /// Most recent execution of the named loop
    pub fn loop_report(&self, node: &str) -> Option<&LoopReport> {
        self.loops.iter().rev().find(|report| report.node == node)
    }
}
