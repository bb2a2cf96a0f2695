//! Control-flow executor
//!
//! Walks a pipeline's steps in order: compile, policy gate, dispatch,
//! then next-step resolution. Control intents (`system.*`,
//! `memory.*`) are handled here and never reach a provider. Ordinary
//! step failures end the run with a `failure` status; `Err` is
//! reserved for malformed top-level input.

use crate::compile::{compile_step, InputCollector, Resolver};
use crate::core::{
    LoopConfig, LoopErrorStrategy, LoopExecutionMode, PipelineFile, RunContext, RuntimeConfig,
    Step, SwitchRoute, VariableStore,
};
use crate::execution::error::StepError;
use crate::execution::events::{EventBus, LogStream, PipelineEvent, RunStatus};
use crate::execution::provider::{ProviderMeta, ProviderRegistry};
use crate::memory::{ClearMemoryInput, QueryMemoryInput, RunMemoryStore, SaveMemoryInput};
use crate::sandbox::{validate_step, SandboxPolicy};
use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Options for a top-level run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip provider side effects; control flow still executes
    pub dry_run: bool,
    /// Start the walk at this step instead of the first one
    pub start_step_id: Option<String>,
    /// Seed variables for the run
    pub variables: Vec<(String, String)>,
    /// Working directory; defaults to the engine root
    pub cwd: Option<String>,
    /// Memory session the run's `memory.*` intents default to
    pub session_id: Option<String>,
}

/// Final result of a pipeline run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub status: RunStatus,
}

/// Everything the engine needs from its host, injected at construction
pub struct EngineContext {
    pub registry: Arc<ProviderRegistry>,
    pub bus: Arc<EventBus>,
    pub config: RuntimeConfig,
    /// Root directory: pipeline paths and the memory store live under it
    pub root: PathBuf,
    pub inputs: Box<dyn InputCollector>,
}

/// Per-run-tree control state: cancellation, pause, pending decision
#[derive(Default)]
struct RunControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    decision: Mutex<Option<bool>>,
    notify: Notify,
}

impl RunControl {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused; returns false once the run is cancelled
    async fn wait_ready(&self) -> bool {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            notified.await;
        }
    }

    async fn wait_cancelled(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Await an approval decision for this run
    async fn wait_decision(&self) -> Result<bool, StepError> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            if let Some(approved) = self.decision.lock().expect("decision poisoned").take() {
                return Ok(approved);
            }
            notified.await;
        }
    }
}

/// Where control goes after a step completes
enum StepFlow {
    Advance,
    Jump(String),
}

/// The pipeline engine. One instance serves many runs; per-run state
/// lives in [`RunContext`] and the control map.
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    bus: Arc<EventBus>,
    config: RuntimeConfig,
    memory: RunMemoryStore,
    inputs: Box<dyn InputCollector>,
    root: PathBuf,
    controls: Mutex<HashMap<String, Arc<RunControl>>>,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        let memory = RunMemoryStore::new(&ctx.root, ctx.config.memory_limits());
        Self {
            registry: ctx.registry,
            bus: ctx.bus,
            config: ctx.config,
            memory,
            inputs: ctx.inputs,
            root: ctx.root,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &RunMemoryStore {
        &self.memory
    }

    /// Load and run a pipeline file
    pub async fn run_file(&self, path: impl AsRef<std::path::Path>, options: RunOptions) -> Result<RunOutcome> {
        let pipeline = PipelineFile::from_file(path)?;
        self.run_pipeline_from_data(pipeline, options).await
    }

    /// Run an in-memory pipeline definition.
    ///
    /// Step failures end in `Ok` with a failure status; `Err` means
    /// the input itself was unusable (bad structure, unknown start
    /// step).
    pub async fn run_pipeline_from_data(
        &self,
        pipeline: PipelineFile,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        pipeline.validate()?;
        if let Some(id) = &options.start_step_id {
            if pipeline.step_index(id).is_none() {
                bail!("Unknown start step: {id}");
            }
        }

        let cwd = options
            .cwd
            .clone()
            .unwrap_or_else(|| self.root.display().to_string());
        let mut ctx = RunContext::new(cwd);
        for (name, value) in &options.variables {
            ctx.variables.set(name, value);
        }

        let control = Arc::new(RunControl::default());
        let run_id = ctx.run_id.clone();
        self.register_control(&run_id, Arc::clone(&control));
        let session_id = options.session_id.as_deref().unwrap_or("default").to_string();

        let result = self
            .drive(
                &pipeline,
                &mut ctx,
                &control,
                options.dry_run,
                options.start_step_id.as_deref(),
                &session_id,
            )
            .await;
        self.remove_control(&run_id);

        let status = result?;
        Ok(RunOutcome {
            run_id,
            success: status == RunStatus::Success,
            status,
        })
    }

    /// Request cancellation of a running pipeline (or any of its
    /// nested runs). Returns false when no such run is active.
    pub fn cancel(&self, run_id: &str) -> bool {
        let Some(control) = self.control(run_id) else {
            return false;
        };
        control.cancelled.store(true, Ordering::SeqCst);
        control.notify.notify_waiters();
        info!(run_id, "cancellation requested");
        true
    }

    pub fn pause(&self, run_id: &str) -> bool {
        let Some(control) = self.control(run_id) else {
            return false;
        };
        control.paused.store(true, Ordering::SeqCst);
        control.notify.notify_waiters();
        self.bus.emit(PipelineEvent::PipelinePause {
            run_id: run_id.to_string(),
        });
        true
    }

    pub fn resume(&self, run_id: &str) -> bool {
        let Some(control) = self.control(run_id) else {
            return false;
        };
        control.paused.store(false, Ordering::SeqCst);
        control.notify.notify_waiters();
        self.bus.emit(PipelineEvent::PipelineResume {
            run_id: run_id.to_string(),
        });
        true
    }

    /// Deliver a human approval decision to a run blocked on
    /// `system.approval`.
    pub fn submit_decision(&self, run_id: &str, approved: bool) -> bool {
        let Some(control) = self.control(run_id) else {
            return false;
        };
        *control.decision.lock().expect("decision poisoned") = Some(approved);
        control.notify.notify_waiters();
        self.bus.emit(PipelineEvent::PipelineDecision {
            run_id: run_id.to_string(),
            approved,
        });
        true
    }

    fn control(&self, run_id: &str) -> Option<Arc<RunControl>> {
        self.controls
            .lock()
            .expect("control map poisoned")
            .get(run_id)
            .cloned()
    }

    fn register_control(&self, run_id: &str, control: Arc<RunControl>) {
        self.controls
            .lock()
            .expect("control map poisoned")
            .insert(run_id.to_string(), control);
    }

    fn remove_control(&self, run_id: &str) {
        self.controls
            .lock()
            .expect("control map poisoned")
            .remove(run_id);
    }

    /// Main step walk for one run (top-level or nested)
    async fn drive(
        &self,
        pipeline: &PipelineFile,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
        start_step_id: Option<&str>,
        session_id: &str,
    ) -> Result<RunStatus> {
        let mut index = match start_step_id {
            Some(id) => pipeline
                .step_index(id)
                .ok_or_else(|| anyhow::anyhow!("Unknown start step: {id}"))?,
            None => 0,
        };

        self.bus.emit(PipelineEvent::PipelineStart {
            run_id: ctx.run_id.clone(),
            name: pipeline.name.clone(),
            total_steps: pipeline.steps.len(),
        });
        info!(run_id = %ctx.run_id, pipeline = %pipeline.name, dry_run, "pipeline run started");

        let status = loop {
            if index >= pipeline.steps.len() {
                break RunStatus::Success;
            }
            if !control.wait_ready().await {
                break RunStatus::Cancelled;
            }

            let step = &pipeline.steps[index];
            match self
                .run_step_with_policy(pipeline, step, index, ctx, control, dry_run, session_id)
                .await
            {
                Ok(StepFlow::Advance) => index += 1,
                Ok(StepFlow::Jump(target)) => match pipeline.step_index(&target) {
                    Some(next) => index = next,
                    None => {
                        self.log(ctx, step, format!("Unknown jump target: {target}"), LogStream::Stderr);
                        break RunStatus::Failure;
                    }
                },
                Err(StepError::Cancelled) => break RunStatus::Cancelled,
                Err(_) => break RunStatus::Failure,
            }
        };

        self.bus.emit(PipelineEvent::PipelineEnd {
            run_id: ctx.run_id.clone(),
            success: status == RunStatus::Success,
            status,
        });
        info!(run_id = %ctx.run_id, %status, "pipeline run finished");
        Ok(status)
    }

    /// One step, wrapped in the failure machinery: retry, then absorb
    /// (`continue_on_error`), then route (`on_failure`). `Err` here
    /// means the run fails.
    #[allow(clippy::too_many_arguments)]
    async fn run_step_with_policy(
        &self,
        pipeline: &PipelineFile,
        step: &Step,
        index: usize,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        self.bus.emit(PipelineEvent::StepStart {
            run_id: ctx.run_id.clone(),
            intent_id: step.intent.clone(),
            step_id: step.id.clone(),
            index,
            description: step.description.clone(),
        });

        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let delay_ms = step.retry.as_ref().map(|r| r.delay_ms).unwrap_or(0);

        let mut last_error: Option<StepError> = None;
        let mut flow: Option<StepFlow> = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.log(
                    ctx,
                    step,
                    format!("[retry] attempt {attempt}/{max_attempts} for step '{}'", step.id),
                    LogStream::Stderr,
                );
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                if control.is_cancelled() {
                    last_error = Some(StepError::Cancelled);
                    break;
                }
            }
            match self
                .execute_step(pipeline, step, ctx, control, dry_run, session_id)
                .await
            {
                Ok(next) => {
                    flow = Some(next);
                    last_error = None;
                    break;
                }
                Err(StepError::Cancelled) => {
                    last_error = Some(StepError::Cancelled);
                    break;
                }
                Err(err) => {
                    warn!(step_id = %step.id, attempt, error = %err, "step attempt failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(flow) = flow {
            self.emit_step_end(ctx, step, index, true);
            return Ok(flow);
        }

        let error = last_error.unwrap_or(StepError::Invalid("step produced no result".to_string()));
        if matches!(error, StepError::Cancelled) {
            self.emit_step_end(ctx, step, index, false);
            return Err(error);
        }

        let message = format!("Step '{}' ({}) failed: {error}", step.id, step.intent);
        self.log(ctx, step, message.clone(), LogStream::Stderr);

        if step.continue_on_error {
            if let Some(var) = &step.capture_error_var {
                ctx.variables.set(var, &message);
            }
            self.emit_step_end(ctx, step, index, false);
            return Ok(StepFlow::Advance);
        }

        if let Some(target) = &step.on_failure {
            self.emit_step_end(ctx, step, index, false);
            return Ok(StepFlow::Jump(target.clone()));
        }

        self.emit_step_end(ctx, step, index, false);
        Err(error)
    }

    /// Execute a single step attempt. Boxed because loops and
    /// sub-pipelines recurse through here.
    fn execute_step<'a>(
        &'a self,
        pipeline: &'a PipelineFile,
        step: &'a Step,
        ctx: &'a mut RunContext,
        control: &'a Arc<RunControl>,
        dry_run: bool,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<StepFlow, StepError>> + Send + 'a>> {
        Box::pin(async move {
            match step.intent.as_str() {
                "system.setVar" | "system.set_var" => self.handle_set_var(step, ctx),
                "system.setCwd" | "system.set_cwd" => self.handle_set_cwd(step, ctx),
                "system.form" => self.handle_form(step, ctx),
                "system.switch" => self.handle_switch(step, ctx),
                "system.loop" => {
                    self.handle_loop(pipeline, step, ctx, control, dry_run, session_id)
                        .await
                }
                "system.subPipeline" | "system.sub_pipeline" => {
                    self.handle_sub_pipeline(step, ctx, control, dry_run, session_id)
                        .await
                }
                "system.approval" | "system.pause" => {
                    self.handle_approval(step, ctx, control, dry_run).await
                }
                "memory.save" => self.handle_memory_save(step, ctx, session_id),
                "memory.recall" => self.handle_memory_recall(step, ctx, session_id),
                "memory.clear" => self.handle_memory_clear(step, ctx, session_id),
                _ => self.dispatch(step, ctx, control, dry_run).await,
            }
        })
    }

    /// Compile, gate, and dispatch an ordinary intent to a provider
    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
    ) -> Result<StepFlow, StepError> {
        let mut compiled = {
            let mut resolver =
                Resolver::new(&ctx.variables, &mut ctx.input_cache, self.inputs.as_ref());
            compile_step(step, &mut resolver, &ctx.cwd)?
        };
        if compiled.intent == "terminal.run" {
            ensure_cwd(&mut compiled.payload, &ctx.cwd);
        }

        let policy = SandboxPolicy::from_config(&self.config);
        validate_step(&compiled, &policy, &ctx.sandbox)?;

        let provider = self
            .registry
            .resolve(&compiled.intent)
            .ok_or_else(|| StepError::UnknownCapability(compiled.intent.clone()))?;

        if dry_run {
            self.log(
                ctx,
                step,
                format!("[dry-run] skipping dispatch of '{}'", compiled.intent),
                LogStream::Stdout,
            );
            return Ok(StepFlow::Advance);
        }

        let meta = ProviderMeta {
            run_id: ctx.run_id.clone(),
            trace_id: ctx.trace_id.clone(),
            step_id: step.id.clone(),
            dry_run,
        };
        debug!(step_id = %step.id, intent = %compiled.intent, "dispatching");

        let result = tokio::select! {
            _ = control.wait_cancelled() => return Err(StepError::Cancelled),
            invoked = timeout(
                Duration::from_millis(policy.timeout_ms),
                provider.invoke(&compiled.intent, &compiled.payload, &meta),
            ) => match invoked {
                Err(_) => return Err(StepError::Timeout(policy.timeout_ms)),
                Ok(Err(err)) => return Err(StepError::Provider(err.to_string())),
                Ok(Ok(result)) => result,
            },
        };

        if let Some(content) = result.content {
            if let Some(var) = output_var(&compiled.payload) {
                ctx.variables.set(var, &content);
            }
            if compiled.intent.starts_with("github.") {
                if let Some(url) = pull_request_url(&content) {
                    self.bus.emit(PipelineEvent::GithubPullRequestCreated {
                        run_id: ctx.run_id.clone(),
                        url,
                    });
                }
            }
        }
        Ok(StepFlow::Advance)
    }

    fn handle_set_var(&self, step: &Step, ctx: &mut RunContext) -> Result<StepFlow, StepError> {
        let payload = self.resolve_payload(step, ctx);
        let name = required_payload_str(&payload, "name", "system.setVar")?;
        let value = payload
            .get("value")
            .map(value_to_string)
            .unwrap_or_default();
        ctx.variables.set(name, value);
        Ok(StepFlow::Advance)
    }

    /// Change the run's working directory, confined to the engine root
    fn handle_set_cwd(&self, step: &Step, ctx: &mut RunContext) -> Result<StepFlow, StepError> {
        let payload = self.resolve_payload(step, ctx);
        let path = required_payload_str(&payload, "path", "system.setCwd")?;
        let requested = path.replace("${workspaceRoot}", &self.root.display().to_string());

        let root = self
            .root
            .canonicalize()
            .map_err(|e| StepError::Invalid(format!("engine root unavailable: {e}")))?;
        let resolved = root
            .join(&requested)
            .canonicalize()
            .map_err(|e| StepError::Invalid(format!("cannot set cwd '{path}': {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(StepError::Invalid(format!(
                "cwd '{path}' escapes the engine root"
            )));
        }
        ctx.cwd = resolved.display().to_string();
        Ok(StepFlow::Advance)
    }

    fn handle_form(&self, step: &Step, ctx: &mut RunContext) -> Result<StepFlow, StepError> {
        let payload = self.resolve_payload(step, ctx);
        let Some(fields) = payload.get("fields").and_then(Value::as_array) else {
            return Err(StepError::Invalid(
                "system.form requires a \"fields\" array".to_string(),
            ));
        };
        for field in fields {
            let Some(name) = field.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())
            else {
                continue;
            };
            let prompt = field
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or(name);
            let value = self
                .inputs
                .collect(prompt)
                .or_else(|| field.get("default").map(value_to_string))
                .unwrap_or_default();
            ctx.variables.set(name, value);
        }
        Ok(StepFlow::Advance)
    }

    /// Ordered route evaluation; exactly one branch is taken
    fn handle_switch(&self, step: &Step, ctx: &mut RunContext) -> Result<StepFlow, StepError> {
        let payload = self.resolve_payload(step, ctx);
        // "variable" is accepted as a legacy alias of "variableKey"
        let variable = payload
            .get("variableKey")
            .or_else(|| payload.get("variable"))
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                StepError::Invalid("system.switch requires \"variableKey\"".to_string())
            })?;
        let routes: Vec<SwitchRoute> = payload
            .get("routes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StepError::Invalid(format!("Invalid switch routes: {e}")))?
            .unwrap_or_default();

        let observed = ctx.variables.get(variable).unwrap_or("");
        for route in &routes {
            if route.matches(observed) {
                debug!(
                    step_id = %step.id,
                    route = route.label.as_deref().unwrap_or(&route.target_step_id),
                    "switch route matched"
                );
                return Ok(StepFlow::Jump(route.target_step_id.clone()));
            }
        }
        match payload.get("defaultStepId").and_then(Value::as_str) {
            Some(target) if !target.is_empty() => Ok(StepFlow::Jump(target.to_string())),
            _ => Ok(StepFlow::Advance),
        }
    }

    /// `system.loop`: iterate items through a child pipeline or a
    /// segment of the current graph
    async fn handle_loop(
        &self,
        pipeline: &PipelineFile,
        step: &Step,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        let limits = self.config.loop_limits();
        if !limits.enabled {
            return Err(StepError::Invalid(
                "loops are disabled by configuration".to_string(),
            ));
        }
        let payload = self.resolve_payload(step, ctx);
        let cfg = LoopConfig::from_payload(&payload);
        let items = LoopConfig::parse_items(&cfg.items);
        if items.is_empty() {
            return Err(StepError::Invalid(
                "system.loop requires non-empty \"items\"".to_string(),
            ));
        }

        let child_pipeline = match cfg.execution_mode {
            LoopExecutionMode::ChildPipeline => {
                let max_depth = self.config.max_sub_pipeline_depth();
                if ctx.depth >= max_depth {
                    return Err(StepError::DepthExceeded {
                        depth: ctx.depth,
                        max: max_depth,
                    });
                }
                let path = cfg.pipeline_path.as_deref().ok_or_else(|| {
                    StepError::Invalid("system.loop requires \"pipelinePath\"".to_string())
                })?;
                Some(self.load_child_pipeline(path)?)
            }
            LoopExecutionMode::GraphSegment => {
                if cfg.graph_step_ids.is_empty() {
                    return Err(StepError::Invalid(
                        "system.loop requires \"graphStepIds\"".to_string(),
                    ));
                }
                None
            }
        };

        let planned = items.len() as u64 * u64::from(cfg.repeat_count);
        let allowed = u64::from(cfg.max_iterations.min(limits.max_total_ops));
        let started = Instant::now();

        let mut processed: u64 = 0;
        let mut successes: u64 = 0;
        let mut failures: u64 = 0;
        let mut truncated = false;

        'cycles: for cycle in 0..cfg.repeat_count {
            for (item_index, item) in items.iter().enumerate() {
                if processed >= allowed {
                    truncated = true;
                    break 'cycles;
                }
                if started.elapsed().as_millis() as u64 > limits.max_duration_ms {
                    truncated = true;
                    self.log(ctx, step, "[loop] time budget exhausted".to_string(), LogStream::Stderr);
                    break 'cycles;
                }
                if control.is_cancelled() {
                    return Err(StepError::Cancelled);
                }

                self.log(
                    ctx,
                    step,
                    format!("[loop] item {}/{}: {item}", item_index + 1, items.len()),
                    LogStream::Stdout,
                );

                let succeeded = match cfg.execution_mode {
                    LoopExecutionMode::ChildPipeline => {
                        let child = child_pipeline.clone().expect("child pipeline loaded");
                        let mut vars = seed_variables(cfg.input.as_ref());
                        vars.set(&cfg.item_var, item);
                        // Global iteration index, continuing across cycles
                        vars.set(&cfg.index_var, processed.to_string());
                        vars.set("loop_cycle", cycle.to_string());
                        let child_ctx = ctx.child(vars);
                        let child_dry = dry_run || cfg.dry_run_child;
                        let (_, status) = self
                            .run_nested(child, child_ctx, Arc::clone(control), child_dry, session_id)
                            .await;
                        if status == RunStatus::Cancelled {
                            return Err(StepError::Cancelled);
                        }
                        status == RunStatus::Success
                    }
                    LoopExecutionMode::GraphSegment => {
                        ctx.variables.set(&cfg.item_var, item);
                        ctx.variables.set(&cfg.index_var, processed.to_string());
                        ctx.variables.set("loop_cycle", cycle.to_string());
                        self.run_graph_segment(
                            pipeline,
                            &cfg.graph_step_ids,
                            ctx,
                            control,
                            dry_run,
                            session_id,
                        )
                        .await?
                    }
                };

                processed += 1;
                if succeeded {
                    successes += 1;
                } else {
                    failures += 1;
                    match cfg.error_strategy {
                        LoopErrorStrategy::FailFast => {
                            return Err(StepError::Invalid(format!(
                                "loop aborted: item {} failed",
                                item_index + 1
                            )));
                        }
                        LoopErrorStrategy::Threshold => {
                            if failures > u64::from(cfg.error_threshold) {
                                return Err(StepError::Invalid(format!(
                                    "loop aborted: {failures} failures exceeded threshold {}",
                                    cfg.error_threshold
                                )));
                            }
                        }
                        LoopErrorStrategy::FailAtEnd => {}
                    }
                }
            }
        }

        let summary = json!({
            "processedItems": processed,
            "successCount": successes,
            "failureCount": failures,
            "plannedItems": planned,
            "truncated": truncated,
            "durationMs": started.elapsed().as_millis() as u64,
        });
        if let Some(var) = &cfg.output_var {
            ctx.variables.set(var, summary.to_string());
        }
        self.log(
            ctx,
            step,
            format!(
                "[loop] done: {successes} ok, {failures} failed{}",
                if truncated { ", truncated" } else { "" }
            ),
            LogStream::Stdout,
        );

        if failures > 0 && cfg.error_strategy == LoopErrorStrategy::FailAtEnd {
            return Err(StepError::Invalid(format!(
                "loop completed with {failures} failed items"
            )));
        }

        match &cfg.done_step_id {
            Some(target) => Ok(StepFlow::Jump(target.clone())),
            None => Ok(StepFlow::Advance),
        }
    }

    /// Run one pass over a loop's graph segment in the current context
    async fn run_graph_segment(
        &self,
        pipeline: &PipelineFile,
        step_ids: &[String],
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
        session_id: &str,
    ) -> Result<bool, StepError> {
        for id in step_ids {
            let Some(index) = pipeline.step_index(id) else {
                return Err(StepError::Invalid(format!("Unknown loop segment step: {id}")));
            };
            let segment_step = &pipeline.steps[index];
            match self
                .run_step_with_policy(pipeline, segment_step, index, ctx, control, dry_run, session_id)
                .await
            {
                Ok(_) => {}
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn handle_sub_pipeline(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        let max_depth = self.config.max_sub_pipeline_depth();
        if ctx.depth >= max_depth {
            return Err(StepError::DepthExceeded {
                depth: ctx.depth,
                max: max_depth,
            });
        }

        let payload = self.resolve_payload(step, ctx);
        let path = required_payload_str(&payload, "pipelinePath", "system.subPipeline")?;
        let child = self.load_child_pipeline(path)?;

        let vars = seed_variables(payload.get("input"));
        let child_ctx = ctx.child(vars);
        let child_dry = dry_run
            || payload
                .get("dryRunChild")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let (child_run_id, status) = self
            .run_nested(child, child_ctx, Arc::clone(control), child_dry, session_id)
            .await;
        if status == RunStatus::Cancelled {
            return Err(StepError::Cancelled);
        }

        if let Some(var) = output_var(&payload) {
            ctx.variables.set(
                var,
                json!({
                    "runId": child_run_id,
                    "status": status,
                    "success": status == RunStatus::Success,
                })
                .to_string(),
            );
        }
        Ok(StepFlow::Advance)
    }

    /// Run a child pipeline as a fresh nested run sharing the parent's
    /// control handle and sandbox counters
    fn run_nested<'a>(
        &'a self,
        pipeline: PipelineFile,
        mut ctx: RunContext,
        control: Arc<RunControl>,
        dry_run: bool,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = (String, RunStatus)> + Send + 'a>> {
        Box::pin(async move {
            let run_id = ctx.run_id.clone();
            self.register_control(&run_id, Arc::clone(&control));
            let status = self
                .drive(&pipeline, &mut ctx, &control, dry_run, None, session_id)
                .await
                .unwrap_or(RunStatus::Failure);
            self.remove_control(&run_id);
            (run_id, status)
        })
    }

    async fn handle_approval(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        control: &Arc<RunControl>,
        dry_run: bool,
    ) -> Result<StepFlow, StepError> {
        let payload = self.resolve_payload(step, ctx);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("Approve to continue")
            .to_string();

        self.bus.emit(PipelineEvent::ApprovalReviewReady {
            run_id: ctx.run_id.clone(),
            step_id: step.id.clone(),
            message,
        });

        if dry_run {
            self.log(ctx, step, "[dry-run] auto-approved".to_string(), LogStream::Stdout);
            return Ok(StepFlow::Advance);
        }

        if control.wait_decision().await? {
            Ok(StepFlow::Advance)
        } else {
            Err(StepError::Rejected("approval was declined".to_string()))
        }
    }

    fn handle_memory_save(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        let limits = self.config.memory_limits();
        if !limits.enabled {
            return Err(StepError::Invalid("run memory is disabled".to_string()));
        }
        let payload = self.resolve_payload(step, ctx);

        let scope: crate::memory::MemoryScope = payload
            .get("scope")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StepError::Invalid(format!("Invalid memory scope: {e}")))?
            .unwrap_or_default();

        let data = match payload.get("data") {
            Some(data) => data.clone(),
            None => json!({ "variables": variable_snapshot(&ctx.variables) }),
        };

        let record_id = self
            .memory
            .save(SaveMemoryInput {
                session_id: payload
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or(session_id)
                    .to_string(),
                key: payload.get("key").and_then(Value::as_str).map(str::to_string),
                tags: string_list(payload.get("tags")),
                scope,
                run_id: Some(ctx.run_id.clone()),
                step_id: Some(step.id.clone()),
                data,
            })
            .map_err(|e| StepError::Invalid(format!("memory.save failed: {e}")))?;

        if let Some(var) = output_var(&payload) {
            ctx.variables.set(var, record_id);
        }
        Ok(StepFlow::Advance)
    }

    fn handle_memory_recall(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        let limits = self.config.memory_limits();
        if !limits.enabled {
            return Err(StepError::Invalid("run memory is disabled".to_string()));
        }
        let payload = self.resolve_payload(step, ctx);

        let records = self.memory.query(&QueryMemoryInput {
            session_id: Some(
                payload
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or(session_id)
                    .to_string(),
            ),
            key: payload.get("key").and_then(Value::as_str).map(str::to_string),
            tag: payload.get("tag").and_then(Value::as_str).map(str::to_string),
            run_id: payload.get("runId").and_then(Value::as_str).map(str::to_string),
            limit: payload.get("limit").and_then(Value::as_u64).map(|v| v as usize),
            newest_first: payload.get("newestFirst").and_then(Value::as_bool),
        });

        let require_match = payload
            .get("requireMatch")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if records.is_empty() && require_match {
            return Err(StepError::Invalid(
                "memory.recall matched no records".to_string(),
            ));
        }

        let inject = payload
            .get("injectVars")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if inject {
            if let Some(newest) = records.first() {
                if let Some(vars) = newest.data.get("variables").and_then(Value::as_object) {
                    for (name, value) in vars {
                        ctx.variables.set(name, value_to_string(value));
                    }
                }
            }
        }

        if let Some(var) = output_var(&payload) {
            let serialized = serde_json::to_string(&records)
                .map_err(|e| StepError::Invalid(format!("memory.recall failed: {e}")))?;
            ctx.variables.set(var, serialized);
        }
        self.log(
            ctx,
            step,
            format!("recalled {} memory record(s)", records.len()),
            LogStream::Stdout,
        );
        Ok(StepFlow::Advance)
    }

    fn handle_memory_clear(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        session_id: &str,
    ) -> Result<StepFlow, StepError> {
        let limits = self.config.memory_limits();
        if !limits.enabled {
            return Err(StepError::Invalid("run memory is disabled".to_string()));
        }
        let payload = self.resolve_payload(step, ctx);

        let (removed, remaining) = self
            .memory
            .clear(&ClearMemoryInput {
                session_id: Some(
                    payload
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .unwrap_or(session_id)
                        .to_string(),
                ),
                key: payload.get("key").and_then(Value::as_str).map(str::to_string),
                tag: payload.get("tag").and_then(Value::as_str).map(str::to_string),
                run_id: payload.get("runId").and_then(Value::as_str).map(str::to_string),
                keep_last: payload
                    .get("keepLast")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
            })
            .map_err(|e| StepError::Invalid(format!("memory.clear failed: {e}")))?;

        self.log(
            ctx,
            step,
            format!("cleared {removed} memory record(s), {remaining} remaining"),
            LogStream::Stdout,
        );
        Ok(StepFlow::Advance)
    }

    /// Resolve the step payload without shell sanitization (control
    /// intents never splice into a shell command)
    fn resolve_payload(&self, step: &Step, ctx: &mut RunContext) -> Value {
        let mut resolver =
            Resolver::new(&ctx.variables, &mut ctx.input_cache, self.inputs.as_ref());
        resolver.resolve_value(&step.payload, false)
    }

    /// Load a child pipeline, confined to the engine root
    fn load_child_pipeline(&self, relative: &str) -> Result<PipelineFile, StepError> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| StepError::Invalid(format!("engine root unavailable: {e}")))?;
        let resolved = root
            .join(relative)
            .canonicalize()
            .map_err(|e| StepError::Invalid(format!("cannot load pipeline '{relative}': {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(StepError::Invalid(format!(
                "pipeline path '{relative}' escapes the engine root"
            )));
        }
        PipelineFile::from_file(&resolved).map_err(|e| StepError::Invalid(e.to_string()))
    }

    fn log(&self, ctx: &RunContext, step: &Step, text: String, stream: LogStream) {
        self.bus.emit(PipelineEvent::StepLog {
            run_id: ctx.run_id.clone(),
            intent_id: step.intent.clone(),
            step_id: step.id.clone(),
            text,
            stream,
        });
    }

    fn emit_step_end(&self, ctx: &RunContext, step: &Step, index: usize, success: bool) {
        self.bus.emit(PipelineEvent::StepEnd {
            run_id: ctx.run_id.clone(),
            intent_id: step.intent.clone(),
            step_id: step.id.clone(),
            index,
            success,
        });
    }
}

fn ensure_cwd(payload: &mut Value, cwd: &str) {
    let needs_cwd = payload
        .get("cwd")
        .and_then(Value::as_str)
        .map(|c| c.is_empty())
        .unwrap_or(true);
    if needs_cwd {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("cwd".to_string(), Value::String(cwd.to_string()));
        }
    }
}

fn output_var(payload: &Value) -> Option<&str> {
    payload
        .get("outputVar")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

fn required_payload_str<'v>(
    payload: &'v Value,
    field: &str,
    intent: &str,
) -> Result<&'v str, StepError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StepError::Invalid(format!("{intent} requires \"{field}\"")))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(entries)) => entries.iter().map(value_to_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Build a child run's variable store from a payload `input` object
fn seed_variables(input: Option<&Value>) -> VariableStore {
    let mut vars = VariableStore::new();
    if let Some(Value::Object(map)) = input {
        for (name, value) in map {
            vars.set(name, value_to_string(value));
        }
    }
    vars
}

fn variable_snapshot(store: &VariableStore) -> Map<String, Value> {
    store
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect()
}

/// Extract a PR URL from a `github.*` provider result: plain URL
/// content or a JSON object with a `url`/`htmlUrl` field
fn pull_request_url(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(trimmed.to_string());
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    value
        .get("url")
        .or_else(|| value.get("htmlUrl"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
