//! ABOUTME: The control-flow interpreter — walks a parsed `Workflow`'s step list,
//! ABOUTME: dispatching by kind and enforcing concurrency, retry, timeout, and cancellation

use crate::builtins;
use crate::executor::{CostRecorder, ExecutionContext, ExecutorRegistry, NullCostRecorder};
use crate::model::{
    InputField, OnError, RetryPolicy, Step, StepKind, StepResult, StepStatus, Workflow,
    WorkflowRun, WorkflowStatus,
};
use autoflow_core::{Error, RunId, Scope, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Resolves a workflow id to its parsed document, for the `workflow` step
/// kind. Modeled as a registry lookup ( "Cyclic references") so
/// sub-workflow invocation never holds a direct reference and recursion
/// depth can be capped at the engine boundary.
#[async_trait::async_trait]
pub trait WorkflowResolver: Send + Sync {
    async fn resolve(&self, workflow_id: &str) -> Result<Workflow, Error>;
}

/// A resolver over a fixed, in-memory set of workflows — the common case
/// for a single process hosting a handful of related documents.
#[derive(Default)]
pub struct StaticWorkflowResolver {
    workflows: HashMap<String, Workflow>,
}

impl StaticWorkflowResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.workflow.id.clone(), workflow);
    }
}

#[async_trait::async_trait]
impl WorkflowResolver for StaticWorkflowResolver {
    async fn resolve(&self, workflow_id: &str) -> Result<Workflow, Error> {
        self.workflows.get(workflow_id).cloned().ok_or_else(|| {
            Error::invalid_schema(format!("no registered workflow with id '{workflow_id}'"))
        })
    }
}

/// Top-level entry point. Cheap to clone: every field is an `Arc`
/// so a single `Engine` can be shared across concurrently running workflow
/// invocations, including nested `parallel` branches spawned as tasks.
#[derive(Clone)]
pub struct Engine {
    executors: Arc<ExecutorRegistry>,
    resolver: Arc<dyn WorkflowResolver>,
    cost_recorder: Arc<dyn CostRecorder>,
    recursion_depth_limit: u32,
}

/// Outcome of a step or step-list evaluation: either everything ran (or
/// was legitimately skipped/recovered), or the run must stop — either
/// because of an uncaught error or an external cancellation signal. These
/// are deliberately distinct channels: cancellation is not "an error" that
/// a `try/catch` can intercept.
#[derive(Debug, Clone)]
enum Flow {
    Error { step_id: String, message: String },
    Cancelled,
}

type FlowResult = Result<(), Flow>;

/// Shared, `'static`-safe state threaded through a single run, including
/// nested `parallel` branches and `for_each`/`map`/`filter` iterations
/// spawned as tokio tasks.
#[derive(Clone)]
struct RunCtx {
    workflow_id: String,
    run_id: String,
    cancellation: CancellationToken,
    cost_recorder: Arc<dyn CostRecorder>,
    results: Arc<Mutex<Vec<StepResult>>>,
}

impl Engine {
    #[must_use]
    pub fn new(executors: ExecutorRegistry, resolver: Arc<dyn WorkflowResolver>) -> Self {
        Self {
            executors: Arc::new(executors),
            resolver,
            cost_recorder: Arc::new(NullCostRecorder),
            recursion_depth_limit: 64,
        }
    }

    #[must_use]
    pub fn with_cost_recorder(mut self, cost_recorder: Arc<dyn CostRecorder>) -> Self {
        self.cost_recorder = cost_recorder;
        self
    }

    #[must_use]
    pub const fn with_recursion_depth_limit(mut self, limit: u32) -> Self {
        self.recursion_depth_limit = limit;
        self
    }

    /// Runs `workflow` to completion against `inputs` ().
    #[instrument(skip(self, workflow, inputs), fields(workflow_id = %workflow.workflow.id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: IndexMap<String, serde_json::Value>,
    ) -> WorkflowRun {
        self.execute_with_cancellation(workflow, inputs, CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancellation(
        &self,
        workflow: &Workflow,
        inputs: IndexMap<String, serde_json::Value>,
        cancellation: CancellationToken,
    ) -> WorkflowRun {
        let run_id = RunId::new();

        let root = match validate_and_coerce_inputs(&workflow.inputs, inputs) {
            Ok(root) => root,
            Err(missing) => {
                return WorkflowRun {
                    run_id,
                    workflow_id: workflow.workflow.id.clone(),
                    status: WorkflowStatus::Failed,
                    step_results: Vec::new(),
                    output: IndexMap::new(),
                    error: Some(crate::model::RunError {
                        step_id: None,
                        message: Error::MissingInputs { missing }.to_string(),
                    }),
                };
            }
        };

        let run_ctx = RunCtx {
            workflow_id: workflow.workflow.id.clone(),
            run_id: run_id.to_string(),
            cancellation,
            cost_recorder: Arc::clone(&self.cost_recorder),
            results: Arc::new(Mutex::new(Vec::new())),
        };

        let mut scope = Scope::with_root(root);
        let outcome = self.run_steps(&workflow.steps, &mut scope, &run_ctx, 0).await;

        let output: IndexMap<String, Value> = scope.root_snapshot().into_iter().collect();
        let step_results = run_ctx.results.lock().clone();

        let (status, error) = match outcome {
            Ok(()) => (WorkflowStatus::Completed, None),
            Err(Flow::Cancelled) => (WorkflowStatus::Cancelled, None),
            Err(Flow::Error { step_id, message }) => (
                WorkflowStatus::Failed,
                Some(crate::model::RunError {
                    step_id: Some(step_id),
                    message,
                }),
            ),
        };

        WorkflowRun {
            run_id,
            workflow_id: workflow.workflow.id.clone(),
            status,
            step_results,
            output,
            error,
        }
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [Step],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> futures::future::BoxFuture<'a, FlowResult> {
        Box::pin(async move {
            for step in steps {
                if run_ctx.cancellation.is_cancelled() {
                    return Err(Flow::Cancelled);
                }
                self.run_step(step, scope, run_ctx, depth).await?;
            }
            Ok(())
        })
    }

    #[allow(clippy::too_many_lines)]
    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> futures::future::BoxFuture<'a, FlowResult> {
        use tracing::Instrument;

        let span = tracing::info_span!(
            "step",
            workflow_id = %run_ctx.workflow_id,
            run_id = %run_ctx.run_id,
            step_id = %step.id,
        );
        Box::pin(
            async move {
                // `if` uses the shared `condition` field to pick a branch, not to
                // gate whether the step runs at all — every other kind treats a
                // false condition as "skip this step entirely".
                if !matches!(step.kind, StepKind::If { .. }) {
                    if let Some(condition) = &step.condition {
                        match autoflow_expr::evaluate_condition(condition, scope) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.record_result(run_ctx, step, StepStatus::Skipped, None, None, 0);
                                return Ok(());
                            }
                            Err(e) => {
                                return self.fail_step(
                                    run_ctx,
                                    step,
                                    Error::expression(&step.id, condition, e.message),
                                    0,
                                );
                            }
                        }
                    }
                }

                let max_attempts = step.retry.max_attempts.max(1);
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    if run_ctx.cancellation.is_cancelled() {
                        return Err(Flow::Cancelled);
                    }

                    let dispatch = self.dispatch_with_timeout(step, scope, run_ctx, depth).await;

                    match dispatch {
                        Ok(output) => {
                            if let Some(var) = &step.output_variable {
                                scope.bind_at_root(var.clone(), output);
                            }
                            self.record_result(
                                run_ctx,
                                step,
                                StepStatus::Completed,
                                None,
                                None,
                                attempt,
                            );
                            return Ok(());
                        }
                        Err(DispatchOutcome::Cancelled) => {
                            self.record_result(
                                run_ctx,
                                step,
                                StepStatus::Cancelled,
                                None,
                                None,
                                attempt,
                            );
                            return Err(Flow::Cancelled);
                        }
                        Err(DispatchOutcome::ControlFlow(flow)) => return Err(flow),
                        Err(DispatchOutcome::Error(Error::Cancelled)) => {
                            self.record_result(
                                run_ctx,
                                step,
                                StepStatus::Cancelled,
                                None,
                                None,
                                attempt,
                            );
                            return Err(Flow::Cancelled);
                        }
                        Err(DispatchOutcome::Error(err)) => {
                            let retryable = err.is_retryable() && attempt < max_attempts;
                            if retryable {
                                let delay = backoff_delay(&step.retry, attempt);
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                continue;
                            }
                            return self.fail_step(run_ctx, step, err, attempt);
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    fn fail_step(
        &self,
        run_ctx: &RunCtx,
        step: &Step,
        error: Error,
        attempts: u32,
    ) -> FlowResult {
        let message = error.to_string();
        self.record_result(
            run_ctx,
            step,
            StepStatus::Failed,
            Some(message.clone()),
            None,
            attempts,
        );
        match step.on_error {
            OnError::Continue => Ok(()),
            OnError::Stop | OnError::Retry => Err(Flow::Error {
                step_id: step.id.clone(),
                message,
            }),
        }
    }

    fn record_result(
        &self,
        run_ctx: &RunCtx,
        step: &Step,
        status: StepStatus,
        error: Option<String>,
        output: Option<Value>,
        attempts: u32,
    ) {
        let now = chrono::Utc::now();
        run_ctx.results.lock().push(StepResult {
            step_id: step.id.clone(),
            status,
            started_at: now,
            finished_at: now,
            output,
            error,
            attempts,
        });
    }

    /// Wraps kind dispatch with the step's `timeout_ms`, converting an
    /// elapsed deadline into `Error::Timeout`.
    async fn dispatch_with_timeout<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        let future = self.dispatch_kind(step, scope, run_ctx, depth);
        match step.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), future).await {
                Ok(result) => result,
                Err(_) => Err(DispatchOutcome::Error(Error::Timeout {
                    step_id: step.id.clone(),
                    elapsed_ms: ms,
                })),
            },
            None => future.await,
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch_kind<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        match &step.kind {
            StepKind::Action { action, inputs } => {
                self.dispatch_action(step, action, inputs, scope, run_ctx).await
            }
            StepKind::InvokeWorkflow { workflow, inputs } => {
                self.dispatch_invoke_workflow(step, workflow, inputs, scope, run_ctx, depth)
                    .await
            }
            StepKind::If { then, r#else } => {
                self.dispatch_if(step, then, r#else, scope, run_ctx, depth).await
            }
            StepKind::Switch {
                expression,
                cases,
                default,
            } => {
                self.dispatch_switch(step, expression, cases, default, scope, run_ctx, depth)
                    .await
            }
            StepKind::ForEach {
                items,
                item_variable,
                index_variable,
                concurrency,
                steps,
            } => {
                self.dispatch_for_each(
                    step,
                    items,
                    item_variable,
                    index_variable.as_deref(),
                    *concurrency,
                    steps,
                    scope,
                    run_ctx,
                    depth,
                )
                .await
            }
            StepKind::While {
                condition,
                max_iterations,
                steps,
            } => {
                self.dispatch_while(step, condition, *max_iterations, steps, scope, run_ctx, depth)
                    .await
            }
            StepKind::Map {
                input, expression, ..
            } => dispatch_map(input, expression, scope).map_err(DispatchOutcome::Error),
            StepKind::Filter {
                input, condition, ..
            } => dispatch_filter(input, condition, scope).map_err(DispatchOutcome::Error),
            StepKind::Reduce {
                input,
                expression,
                initial_value,
                accumulator_variable,
            } => dispatch_reduce(input, expression, initial_value, accumulator_variable, scope)
                .map_err(DispatchOutcome::Error),
            StepKind::Parallel { branches } => {
                self.dispatch_parallel(branches, scope, run_ctx, depth).await
            }
            StepKind::Try {
                r#try,
                catch,
                finally,
            } => {
                self.dispatch_try(step, r#try, catch, finally, scope, run_ctx, depth)
                    .await
            }
        }
    }

    async fn dispatch_action<'a>(
        &'a self,
        step: &'a Step,
        action: &'a str,
        inputs: &'a IndexMap<String, String>,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
    ) -> Result<Value, DispatchOutcome> {
        if let Some(op) = action.strip_prefix("core.") {
            return builtins::dispatch(op, inputs, scope).map_err(DispatchOutcome::Error);
        }

        let mut resolved = IndexMap::new();
        for (key, template) in inputs {
            let value = autoflow_expr::resolve_input_value(template, scope)
                .map_err(|e| DispatchOutcome::Error(Error::expression(&step.id, template, e.message)))?;
            resolved.insert(key.clone(), value);
        }

        let exec_ctx = ExecutionContext {
            workflow_id: run_ctx.workflow_id.clone(),
            run_id: run_ctx.run_id.clone(),
            step_id: step.id.clone(),
            cancellation: run_ctx.cancellation.child_token(),
            timeout: step.timeout_ms.map(Duration::from_millis),
            cost_recorder: Arc::clone(&run_ctx.cost_recorder),
        };

        self.executors
            .execute(action, Value::Map(resolved), &exec_ctx)
            .await
            .map_err(DispatchOutcome::Error)
    }

    async fn dispatch_invoke_workflow<'a>(
        &'a self,
        step: &'a Step,
        workflow_id: &'a str,
        inputs: &'a IndexMap<String, String>,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        if depth + 1 > self.recursion_depth_limit {
            return Err(DispatchOutcome::Error(Error::Internal {
                message: format!(
                    "sub-workflow recursion depth limit ({}) exceeded invoking '{}'",
                    self.recursion_depth_limit, workflow_id
                ),
            }));
        }

        let mut child_inputs = IndexMap::new();
        for (key, template) in inputs {
            let value = autoflow_expr::resolve_input_value(template, scope)
                .map_err(|e| DispatchOutcome::Error(Error::expression(&step.id, template, e.message)))?;
            child_inputs.insert(key.clone(), serde_json::Value::from(value));
        }

        let target = self
            .resolver
            .resolve(workflow_id)
            .await
            .map_err(DispatchOutcome::Error)?;

        let mut child_scope = Scope::with_root(
            validate_and_coerce_inputs(&target.inputs, child_inputs)
                .map_err(|missing| DispatchOutcome::Error(Error::MissingInputs { missing }))?,
        );
        let child_ctx = RunCtx {
            workflow_id: target.workflow.id.clone(),
            run_id: run_ctx.run_id.clone(),
            cancellation: run_ctx.cancellation.child_token(),
            cost_recorder: Arc::clone(&run_ctx.cost_recorder),
            results: Arc::clone(&run_ctx.results),
        };

        self.run_steps(&target.steps, &mut child_scope, &child_ctx, depth + 1)
            .await
            .map_err(DispatchOutcome::ControlFlow)?;

        Ok(Value::Map(child_scope.root_snapshot().into_iter().collect()))
    }

    async fn dispatch_if<'a>(
        &'a self,
        step: &'a Step,
        then: &'a [Step],
        r#else: &'a [Step],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        // `Workflow::validate` guarantees an `if` step always carries a
        // `condition`; this is its branch selector, not a skip gate.
        let condition = step
            .condition
            .as_deref()
            .expect("if step without condition should have failed validation");
        let truthy = autoflow_expr::evaluate_condition(condition, scope)
            .map_err(|e| DispatchOutcome::Error(Error::expression(&step.id, condition, e.message)))?;

        let branch = if truthy { then } else { r#else };
        self.run_steps(branch, scope, run_ctx, depth)
            .await
            .map_err(DispatchOutcome::ControlFlow)?;
        Ok(Value::Null)
    }

    async fn dispatch_switch<'a>(
        &'a self,
        step: &'a Step,
        expression: &'a str,
        cases: &'a IndexMap<String, Vec<Step>>,
        default: &'a Option<Vec<Step>>,
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        let value = autoflow_expr::evaluate(expression, scope)
            .map_err(|e| DispatchOutcome::Error(Error::expression(&step.id, expression, e.message)))?;
        let key = value.to_template_string();
        let branch = cases.get(&key).or(default.as_ref());
        match branch {
            Some(steps) => self
                .run_steps(steps, scope, run_ctx, depth)
                .await
                .map_err(DispatchOutcome::ControlFlow)
                .map(|()| Value::Null),
            None => Ok(Value::Null),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_for_each<'a>(
        &'a self,
        step: &'a Step,
        items_expr: &'a str,
        item_variable: &'a str,
        index_variable: Option<&'a str>,
        concurrency: u32,
        inner_steps: &'a [Step],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        let items_value = autoflow_expr::evaluate(items_expr, scope)
            .map_err(|e| DispatchOutcome::Error(Error::expression(&step.id, items_expr, e.message)))?;
        let items = items_value
            .as_sequence()
            .ok_or_else(|| {
                DispatchOutcome::Error(Error::Type {
                    message: format!(
                        "for_each 'items' must resolve to a finite sequence, found {}",
                        items_value.type_name()
                    ),
                })
            })?
            .to_vec();

        if items.is_empty() {
            return Ok(Value::Null);
        }

        let len = items.len();
        let concurrency = concurrency.max(1) as usize;

        // A genuinely sequential block (`concurrency: 1`, the default) must
        // have iteration `i` observe every root-scope write iteration `i-1`
        // made — batching by `concurrency` and committing each batch's
        // writes before the next batch is spawned gives that for the
        // sequential case deterministically (batch size 1 means "await
        // iteration i before spawning i+1") while still bounding true
        // parallelism to `concurrency` when it's greater than 1.
        let mut current_root = scope.root_snapshot();
        let mut outcomes = Vec::with_capacity(len);

        for batch_start in (0..len).step_by(concurrency) {
            let batch_end = (batch_start + concurrency).min(len);
            let mut handles = Vec::with_capacity(batch_end - batch_start);

            for index in batch_start..batch_end {
                let item = items[index].clone();
                let mut iter_scope = Scope::with_root(current_root.clone());
                iter_scope.push_frame();
                iter_scope.bind(item_variable.to_string(), item);
                iter_scope.bind(
                    index_variable.unwrap_or("index").to_string(),
                    Value::Number(index as f64),
                );
                iter_scope.bind(
                    "loop",
                    Value::Map(IndexMap::from([
                        ("first".to_string(), Value::Bool(index == 0)),
                        ("last".to_string(), Value::Bool(index == len - 1)),
                        ("length".to_string(), Value::Number(len as f64)),
                        ("index".to_string(), Value::Number(index as f64)),
                    ])),
                );

                let engine = self.clone();
                let inner_steps = inner_steps.to_vec();
                let run_ctx = run_ctx.clone();

                handles.push(tokio::spawn(async move {
                    let outcome = engine.run_steps(&inner_steps, &mut iter_scope, &run_ctx, depth).await;
                    (index, outcome, iter_scope.root_snapshot())
                }));
            }

            let mut batch_results = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(result) => batch_results.push(result),
                    Err(join_err) => {
                        return Err(DispatchOutcome::Error(Error::Internal {
                            message: format!("for_each iteration task panicked: {join_err}"),
                        }))
                    }
                }
            }
            batch_results.sort_by_key(|(index, ..)| *index);

            for (index, outcome, after_root) in batch_results {
                current_root = after_root;
                outcomes.push((index, outcome));
            }
        }

        for (key, value) in current_root {
            scope.bind_at_root(key, value);
        }
        for (_, outcome) in outcomes {
            outcome.map_err(DispatchOutcome::ControlFlow)?;
        }

        Ok(Value::Null)
    }

    async fn dispatch_while<'a>(
        &'a self,
        step: &'a Step,
        condition: &'a str,
        max_iterations: u64,
        steps: &'a [Step],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        let mut iterations = 0u64;
        loop {
            let truthy = autoflow_expr::evaluate_condition(condition, scope).map_err(|e| {
                DispatchOutcome::Error(Error::expression(&step.id, condition, e.message))
            })?;
            if !truthy {
                break;
            }
            if iterations >= max_iterations {
                return Err(DispatchOutcome::Error(Error::MaxIterationsExceeded {
                    step_id: step.id.clone(),
                    max_iterations,
                }));
            }
            self.run_steps(steps, scope, run_ctx, depth)
                .await
                .map_err(DispatchOutcome::ControlFlow)?;
            iterations += 1;
        }
        Ok(Value::Null)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_parallel<'a>(
        &'a self,
        branches: &'a [crate::model::Branch],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        let mut handles = Vec::with_capacity(branches.len());
        for branch in branches {
            let branch_scope = scope.branch();
            let engine = self.clone();
            let steps = branch.steps.clone();
            let branch_id = branch.id.clone();
            let run_ctx = run_ctx.clone();

            handles.push(tokio::spawn(async move {
                let mut branch_scope = branch_scope;
                let outcome = engine
                    .run_steps(&steps, &mut branch_scope, &run_ctx, depth)
                    .await;
                (branch_id, outcome, branch_scope.take_branch_root())
            }));
        }

        let mut branch_outputs = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => branch_outputs.push(result),
                Err(join_err) => {
                    return Err(DispatchOutcome::Error(Error::Internal {
                        message: format!("parallel branch task panicked: {join_err}"),
                    }))
                }
            }
        }

        let mut first_error = None;
        for (branch_id, outcome, root) in branch_outputs {
            for (key, value) in root {
                scope.bind_at_root(format!("{branch_id}.{key}"), value);
            }
            if let Err(flow) = outcome {
                first_error.get_or_insert(flow);
            }
        }

        match first_error {
            Some(flow) => Err(DispatchOutcome::ControlFlow(flow)),
            None => Ok(Value::Null),
        }
    }

    async fn dispatch_try<'a>(
        &'a self,
        _step: &'a Step,
        r#try: &'a [Step],
        catch: &'a [Step],
        finally: &'a [Step],
        scope: &'a mut Scope,
        run_ctx: &'a RunCtx,
        depth: u32,
    ) -> Result<Value, DispatchOutcome> {
        // `try`'s body runs in its own frame so a failure partway through
        // can be discarded wholesale without needing a
        // per-key undo log.
        scope.push_frame();
        let try_outcome = self.run_steps(r#try, scope, run_ctx, depth).await;

        let try_error = match try_outcome {
            Ok(()) => {
                scope.merge(None);
                None
            }
            Err(Flow::Cancelled) => {
                scope.pop_frame_discard();
                let _ = self.run_steps(finally, scope, run_ctx, depth).await;
                return Err(DispatchOutcome::ControlFlow(Flow::Cancelled));
            }
            Err(Flow::Error { step_id, message }) => {
                scope.pop_frame_discard();
                Some((step_id, message))
            }
        };

        let mut pending_error = None;

        if let Some((failing_step_id, message)) = try_error {
            if catch.is_empty() {
                pending_error = Some((failing_step_id, message));
            } else {
                scope.push_frame();
                scope.bind(
                    "error",
                    Value::Map(IndexMap::from([
                        ("message".to_string(), Value::string(message.clone())),
                        ("step_id".to_string(), Value::string(failing_step_id.clone())),
                        ("kind".to_string(), Value::string("ExecutorError")),
                    ])),
                );
                let catch_outcome = self.run_steps(catch, scope, run_ctx, depth).await;
                match catch_outcome {
                    Ok(()) => scope.merge(None),
                    Err(Flow::Cancelled) => {
                        scope.pop_frame_discard();
                        let _ = self.run_steps(finally, scope, run_ctx, depth).await;
                        return Err(DispatchOutcome::ControlFlow(Flow::Cancelled));
                    }
                    Err(Flow::Error { step_id, message }) => {
                        scope.pop_frame_discard();
                        pending_error = Some((step_id, message));
                    }
                }
            }
        }

        let finally_outcome = self.run_steps(finally, scope, run_ctx, depth).await;
        match finally_outcome {
            Ok(()) => {}
            Err(Flow::Cancelled) => return Err(DispatchOutcome::ControlFlow(Flow::Cancelled)),
            // Errors raised inside `finally` supersede prior errors.
            Err(Flow::Error { step_id, message }) => pending_error = Some((step_id, message)),
        }

        match pending_error {
            Some((step_id, message)) => {
                Err(DispatchOutcome::ControlFlow(Flow::Error { step_id, message }))
            }
            None => Ok(Value::Null),
        }
    }
}

fn dispatch_map(input: &str, expression: &str, scope: &Scope) -> Result<Value, Error> {
    let value = autoflow_expr::evaluate(input, scope).map_err(|e| Error::Type { message: e.message })?;
    let items = value.as_sequence().ok_or_else(|| Error::Type {
        message: format!("map requires a sequence input, found {}", value.type_name()),
    })?;
    builtins::transform_map_with(items, expression, scope)
}

fn dispatch_filter(input: &str, condition: &str, scope: &Scope) -> Result<Value, Error> {
    let value = autoflow_expr::evaluate(input, scope).map_err(|e| Error::Type { message: e.message })?;
    let items = value.as_sequence().ok_or_else(|| Error::Type {
        message: format!(
            "filter requires a sequence input, found {}",
            value.type_name()
        ),
    })?;
    builtins::transform_filter_with(items, condition, scope)
}

fn dispatch_reduce(
    input: &str,
    expression: &str,
    initial_value: &serde_json::Value,
    accumulator_variable: &str,
    scope: &Scope,
) -> Result<Value, Error> {
    let value = autoflow_expr::evaluate(input, scope).map_err(|e| Error::Type { message: e.message })?;
    let items = value.as_sequence().ok_or_else(|| Error::Type {
        message: format!(
            "reduce requires a sequence input, found {}",
            value.type_name()
        ),
    })?;
    let initial: Value = initial_value.clone().into();
    builtins::transform_reduce_with(items, expression, initial, accumulator_variable, scope)
}

enum DispatchOutcome {
    Error(Error),
    ControlFlow(Flow),
    Cancelled,
}

impl From<Error> for DispatchOutcome {
    fn from(e: Error) -> Self {
        Self::Error(e)
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if policy.backoff_ms == 0 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1);
    let multiplier = policy.backoff_multiplier.max(0.0).powi(exponent as i32);
    let millis = (policy.backoff_ms as f64 * multiplier).max(0.0);
    Duration::from_millis(millis as u64)
}

/// Validates `inputs` against the workflow's schema ():
/// rejects missing required inputs, applies defaults, and coerces
/// string-to-number trivially when parsable. Returns the names of any
/// still-missing required inputs as the error case.
fn validate_and_coerce_inputs(
    schema: &IndexMap<String, InputField>,
    mut inputs: IndexMap<String, serde_json::Value>,
) -> Result<HashMap<String, Value>, Vec<String>> {
    let mut missing = Vec::new();
    let mut root = HashMap::new();

    for (name, field) in schema {
        let provided = inputs.shift_remove(name);
        let raw = match provided {
            Some(value) => Some(value),
            None => field.default.clone(),
        };
        match raw {
            Some(value) => {
                root.insert(name.clone(), coerce(value, &field.field_type));
            }
            None => {
                if field.required {
                    missing.push(name.clone());
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(missing);
    }

    // Inputs not declared in the schema still flow through untouched —
    // the schema only validates, it does not strip extra fields.
    for (name, value) in inputs {
        root.insert(name, Value::from(value));
    }

    Ok(root)
}

fn coerce(value: serde_json::Value, field_type: &str) -> Value {
    if field_type == "number" {
        if let serde_json::Value::String(ref s) = value {
            if let Ok(n) = s.parse::<f64>() {
                return Value::Number(n);
            }
        }
    }
    Value::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AdapterDescription, Executor};
    use crate::model::{Branch, StepKind};
    use autoflow_testing::builders::{action_step, bare_workflow};

    struct IncrementExecutor;

    #[async_trait::async_trait]
    impl Executor for IncrementExecutor {
        async fn execute(
            &self,
            _action: &str,
            inputs: Value,
            _context: &ExecutionContext,
        ) -> Result<Value, Error> {
            let n = inputs.get_key("value").as_f64().unwrap_or(0.0);
            Ok(Value::Number(n + 1.0))
        }

        fn describe(&self) -> AdapterDescription {
            AdapterDescription {
                tool_name: "math".to_string(),
                operations: vec!["increment".to_string()],
            }
        }
    }

    #[tokio::test]
    async fn core_set_binds_output_variable() {
        let mut step = action_step("s1", "core.set", &[("x", "{{ 1 + 2 }}")]);
        step.output_variable = Some("result".to_string());
        let workflow = bare_workflow(vec![step]);

        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let run = engine.execute(&workflow, IndexMap::new()).await;

        assert_eq!(run.status, WorkflowStatus::Completed);
        let result = &run.output["result"];
        assert_eq!(result.get_key("x"), Value::Number(3.0));
    }

    #[tokio::test]
    async fn switch_matches_case_or_falls_back_to_default() {
        use crate::model::StepKind as SK;

        let mut cases = IndexMap::new();
        cases.insert(
            "high".to_string(),
            vec![{
                let mut s = action_step("set-urgent", "core.set", &[("queue", "urgent")]);
                s.output_variable = Some("routed".to_string());
                s
            }],
        );
        let default_steps = vec![{
            let mut s = action_step("set-normal", "core.set", &[("queue", "normal")]);
            s.output_variable = Some("routed".to_string());
            s
        }];

        let switch_step = Step {
            id: "route".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::Switch {
                expression: "priority".to_string(),
                cases,
                default: Some(default_steps),
            },
        };

        let workflow = bare_workflow(vec![switch_step]);
        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));

        let mut inputs = IndexMap::new();
        inputs.insert("priority".to_string(), serde_json::json!("high"));
        let run = engine.execute(&workflow, inputs).await;
        assert_eq!(run.output["routed"].get_key("queue"), Value::string("urgent"));

        let mut inputs2 = IndexMap::new();
        inputs2.insert("priority".to_string(), serde_json::json!("unknown"));
        let run2 = engine.execute(&workflow, inputs2).await;
        assert_eq!(run2.output["routed"].get_key("queue"), Value::string("normal"));
    }

    #[tokio::test]
    async fn while_loop_fails_when_cap_is_exceeded() {
        use crate::model::StepKind as SK;

        let body = vec![{
            let mut s = action_step("inc", "math.increment", &[("value", "{{ counter }}")]);
            s.output_variable = Some("counter".to_string());
            s
        }];

        let step = Step {
            id: "loop".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::While {
                condition: "true".to_string(),
                max_iterations: 5,
                steps: body,
            },
        };

        let workflow = bare_workflow(vec![step]);
        let mut registry = ExecutorRegistry::new();
        registry.register("math", Arc::new(IncrementExecutor));
        let engine = Engine::new(registry, Arc::new(StaticWorkflowResolver::new()));

        let mut inputs = IndexMap::new();
        inputs.insert("counter".to_string(), serde_json::json!(0));
        let run = engine.execute(&workflow, inputs).await;

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert!(run.error.unwrap().message.contains("exceeded"));
    }

    #[tokio::test]
    async fn while_loop_runs_until_condition_false() {
        use crate::model::StepKind as SK;

        let body = vec![{
            let mut s = action_step("inc", "math.increment", &[("value", "{{ counter }}")]);
            s.output_variable = Some("counter".to_string());
            s
        }];

        let step = Step {
            id: "loop".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::While {
                condition: "counter < 3".to_string(),
                max_iterations: 10,
                steps: body,
            },
        };

        let workflow = bare_workflow(vec![step]);
        let mut registry = ExecutorRegistry::new();
        registry.register("math", Arc::new(IncrementExecutor));
        let engine = Engine::new(registry, Arc::new(StaticWorkflowResolver::new()));

        let mut inputs = IndexMap::new();
        inputs.insert("counter".to_string(), serde_json::json!(0));
        let run = engine.execute(&workflow, inputs).await;

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.output["counter"], Value::Number(3.0));
    }

    #[tokio::test]
    async fn for_each_sequential_iterations_observe_prior_writes() {
        use crate::model::StepKind as SK;

        let body = vec![{
            let mut s = action_step("inc", "math.increment", &[("value", "{{ counter }}")]);
            s.output_variable = Some("counter".to_string());
            s
        }];

        let step = Step {
            id: "each".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::ForEach {
                items: "[1, 1, 1]".to_string(),
                item_variable: "item".to_string(),
                index_variable: None,
                concurrency: 1,
                steps: body,
            },
        };

        let workflow = bare_workflow(vec![step]);
        let mut registry = ExecutorRegistry::new();
        registry.register("math", Arc::new(IncrementExecutor));
        let engine = Engine::new(registry, Arc::new(StaticWorkflowResolver::new()));

        let mut inputs = IndexMap::new();
        inputs.insert("counter".to_string(), serde_json::json!(0));
        let run = engine.execute(&workflow, inputs).await;

        // With `concurrency: 1` (sequential by default), each of the three
        // iterations must observe the previous iteration's write to
        // `counter` — a stale-scope bug would leave every iteration
        // incrementing the same pre-loop value, collapsing the final
        // result to 1 instead of 3.
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.output["counter"], Value::Number(3.0));
    }

    #[tokio::test]
    async fn parallel_branches_write_under_their_own_prefix() {
        use crate::model::StepKind as SK;

        let branch_a = Branch {
            id: "branch-a".to_string(),
            steps: vec![{
                let mut s = action_step("set-a", "core.set", &[("value", "\"A\"")]);
                s.output_variable = Some("local_var".to_string());
                s
            }],
        };
        let branch_b = Branch {
            id: "branch-b".to_string(),
            steps: vec![{
                let mut s = action_step("set-b", "core.set", &[("value", "\"B\"")]);
                s.output_variable = Some("local_var".to_string());
                s
            }],
        };

        let step = Step {
            id: "par".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::Parallel {
                branches: vec![branch_a, branch_b],
            },
        };

        let workflow = bare_workflow(vec![step]);
        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let run = engine.execute(&workflow, IndexMap::new()).await;

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(
            run.output["branch-a.local_var"].get_key("value"),
            Value::string("A")
        );
        assert_eq!(
            run.output["branch-b.local_var"].get_key("value"),
            Value::string("B")
        );
    }

    #[tokio::test]
    async fn try_catch_finally_both_bindings_appear_and_run_completes() {
        use crate::model::StepKind as SK;

        struct FailingExecutor;
        #[async_trait::async_trait]
        impl Executor for FailingExecutor {
            async fn execute(
                &self,
                _action: &str,
                _inputs: Value,
                _context: &ExecutionContext,
            ) -> Result<Value, Error> {
                Err(Error::Executor {
                    action: "flaky.fail".to_string(),
                    kind: autoflow_core::ExecutorErrorKind::Permanent,
                    message: "boom".to_string(),
                })
            }
            fn describe(&self) -> AdapterDescription {
                AdapterDescription {
                    tool_name: "flaky".to_string(),
                    operations: vec!["fail".to_string()],
                }
            }
        }

        let mut registry = ExecutorRegistry::new();
        registry.register("flaky", Arc::new(FailingExecutor));

        let try_steps = vec![action_step("boom", "flaky.fail", &[])];
        let catch_steps = vec![{
            let mut s = action_step("set-handled", "core.set", &[("v", "true")]);
            s.output_variable = Some("handled".to_string());
            s
        }];
        let finally_steps = vec![{
            let mut s = action_step("set-cleaned", "core.set", &[("v", "true")]);
            s.output_variable = Some("cleaned".to_string());
            s
        }];

        let step = Step {
            id: "guarded".to_string(),
            name: None,
            output_variable: None,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            on_error: OnError::Stop,
            kind: SK::Try {
                r#try: try_steps,
                catch: catch_steps,
                finally: finally_steps,
            },
        };

        let workflow = bare_workflow(vec![step]);
        let engine = Engine::new(registry, Arc::new(StaticWorkflowResolver::new()));
        let run = engine.execute(&workflow, IndexMap::new()).await;

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert_eq!(run.output["handled"].get_key("v"), Value::Bool(true));
        assert_eq!(run.output["cleaned"].get_key("v"), Value::Bool(true));
    }

    #[tokio::test]
    async fn missing_required_input_fails_before_execution() {
        let mut schema = IndexMap::new();
        schema.insert(
            "user_id".to_string(),
            InputField {
                field_type: "string".to_string(),
                required: true,
                default: None,
                description: Some("the user id".to_string()),
                pattern: None,
            },
        );
        let mut workflow = bare_workflow(vec![]);
        workflow.inputs = schema;

        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let run = engine.execute(&workflow, IndexMap::new()).await;

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert!(run.error.unwrap().message.contains("user_id"));
    }
}
