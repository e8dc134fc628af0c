use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    agent::AgentAssigner,
    config::{EngineConfig, TaskCompletionMode},
    metrics,
    store::Store,
    workflow::{
        ConditionEvaluator, ExecutionContext, PathConditionEvaluator, StepExecution, StepRunner,
        StepStatus, StepType, TransitionType, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
        WorkflowStep, WorkflowTransition,
    },
    Error, Result,
};

/// Result of a TASK step reported by whoever worked on it.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { output: HashMap<String, Value> },
    Failed { reason: String },
}

/// What the cascade does after dispatching one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Continue,
    Halt,
}

/// Instance metadata key counting reroutes to error handling steps.
const ERROR_HANDLER_HOPS: &str = "errorHandlerHops";

/// Per-instance serialisation. `lock` is held for every single-step dispatch
/// and every lifecycle call; `pending` counts queued or running drives.
/// A slot lives in the map only while someone holds it or drives are pending.
struct InstanceSlot {
    lock: Mutex<()>,
    pending: watch::Sender<usize>,
}

impl InstanceSlot {
    fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            lock: Mutex::new(()),
            pending,
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    assigner: Arc<dyn AgentAssigner>,
    executor: Arc<dyn StepRunner>,
    conditions: Arc<dyn ConditionEvaluator>,
    config: EngineConfig,
    slots: RwLock<HashMap<String, Arc<InstanceSlot>>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        assigner: Arc<dyn AgentAssigner>,
        executor: Arc<dyn StepRunner>,
        config: EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        Self {
            store,
            assigner,
            executor,
            conditions: Arc::new(PathConditionEvaluator::new()),
            config,
            slots: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn with_condition_evaluator(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Spawn the work-queue consumer and, when configured, the timeout sweeper.
    pub async fn start(self: Arc<Self>) {
        info!("Starting workflow engine");

        let Some(rx) = self.queue_rx.lock().await.take() else {
            warn!("Workflow engine already started");
            return;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.execution_loop(rx).await;
        });

        let interval = self.config.timeout_sweep_interval_secs;
        if interval > 0 {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.timeout_loop(Duration::from_secs(interval)).await;
            });
        }
    }

    async fn execution_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(instance_id) = rx.recv().await {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drive(instance_id).await;
            });
        }
    }

    async fn timeout_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.check_timeouts().await {
                Ok(0) => {}
                Ok(count) => info!("Timed out {} step execution(s)", count),
                Err(e) => error!("Timeout sweep failed: {}", e),
            }
        }
    }

    async fn drive(&self, instance_id: String) {
        if let Err(e) = self.execute_next_step(&instance_id).await {
            error!("Workflow instance {} stopped advancing: {}", instance_id, e);
        }
        {
            let slot = self.slot(&instance_id).await;
            slot.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
        self.release_slot(&instance_id).await;
    }

    async fn slot(&self, instance_id: &str) -> Arc<InstanceSlot> {
        if let Some(slot) = self.slots.read().await.get(instance_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(InstanceSlot::new()))
            .clone()
    }

    /// Drop the slot once nothing is pending and no caller holds it. Callers
    /// must have dropped their own `Arc` first.
    async fn release_slot(&self, instance_id: &str) {
        let mut slots = self.slots.write().await;
        let idle = slots.get(instance_id).map_or(false, |slot| {
            Arc::strong_count(slot) == 1 && *slot.pending.borrow() == 0
        });
        if idle {
            slots.remove(instance_id);
        }
    }

    async fn enqueue(&self, instance_id: &str) -> Result<()> {
        let slot = self.slot(instance_id).await;
        slot.pending.send_modify(|n| *n += 1);

        if let Err(e) = self.queue_tx.send(instance_id.to_string()).await {
            slot.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(Error::Internal(format!("Work queue closed: {}", e)));
        }

        debug!("Queued workflow instance {}", instance_id);
        Ok(())
    }

    /// Resolves once nothing is queued or running for the instance.
    pub async fn wait_for_idle(&self, instance_id: &str) -> Result<()> {
        let mut rx = match self.slots.read().await.get(instance_id) {
            Some(slot) => slot.pending.subscribe(),
            // No slot means nothing queued or running
            None => return Ok(()),
        };
        rx.wait_for(|pending| *pending == 0)
            .await
            .map(|_| ())
            .map_err(|e| Error::Internal(format!("Idle wait for {} failed: {}", instance_id, e)))
    }

    async fn require_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow instance not found: {}", instance_id)))
    }

    async fn require_definition(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        self.store.get_definition(definition_id).await?.ok_or_else(|| {
            Error::NotFound(format!("Workflow definition not found: {}", definition_id))
        })
    }

    pub async fn start_workflow(
        &self,
        definition_id: &str,
        name: &str,
        user_id: &str,
        initial_context: HashMap<String, Value>,
    ) -> Result<WorkflowInstance> {
        info!("Starting workflow {} from definition {}", name, definition_id);

        let definition = self.require_definition(definition_id).await?;
        if !definition.is_active {
            return Err(Error::InvalidDefinition(format!(
                "Workflow definition {} is not active",
                definition.id
            )));
        }
        definition.validate()?;
        let start = definition.start_step()?;

        let mut instance = WorkflowInstance::new(&definition.id, name, user_id);
        self.store.save_instance(instance.clone()).await?;

        let context = ExecutionContext::with_data(&instance.id, initial_context);
        self.store.save_execution_context(context, None).await?;

        let mut execution = StepExecution::for_step(&instance.id, start);
        execution.input = start.parameters.clone();
        self.store.save_step_execution(execution).await?;

        instance.start(start.id.clone())?;
        self.store.save_instance(instance.clone()).await?;
        metrics::record_instance_started();

        info!(
            "Workflow instance {} running at step {}",
            instance.id, start.id
        );

        self.enqueue(&instance.id).await?;
        Ok(instance)
    }

    /// Drive an instance forward one step at a time until it leaves RUNNING,
    /// waits on a step, or stalls. Missing instances are ignored.
    pub async fn execute_next_step(&self, instance_id: &str) -> Result<()> {
        let result = self.cascade(instance_id).await;
        self.release_slot(instance_id).await;
        result
    }

    async fn cascade(&self, instance_id: &str) -> Result<()> {
        loop {
            let slot = self.slot(instance_id).await;
            let _guard = slot.lock.lock().await;

            if self.dispatch_current_step(instance_id).await? == Advance::Halt {
                return Ok(());
            }
        }
    }

    async fn dispatch_current_step(&self, instance_id: &str) -> Result<Advance> {
        let Some(mut instance) = self.store.get_instance(instance_id).await? else {
            debug!("Workflow instance {} not found, nothing to execute", instance_id);
            return Ok(Advance::Halt);
        };
        if !instance.is_running() {
            debug!(
                "Workflow instance {} is {}, not executing",
                instance.id, instance.status
            );
            return Ok(Advance::Halt);
        }

        let Some(definition) = self
            .store
            .get_definition(&instance.workflow_definition_id)
            .await?
        else {
            let reason = format!(
                "Workflow definition not found: {}",
                instance.workflow_definition_id
            );
            self.fail_instance(&mut instance, reason).await?;
            return Ok(Advance::Halt);
        };

        let Some(step_id) = instance.current_step_id.clone() else {
            self.fail_instance(&mut instance, "Workflow instance has no current step")
                .await?;
            return Ok(Advance::Halt);
        };
        let Some(step) = definition.step(&step_id).cloned() else {
            let reason = format!("Step not found in definition: {}", step_id);
            self.fail_instance(&mut instance, reason).await?;
            return Ok(Advance::Halt);
        };

        let pending = self
            .store
            .find_step_executions_by_status(&instance.id, StepStatus::Pending)
            .await?
            .into_iter()
            .find(|e| e.step_id == step.id);

        let mut execution = match pending {
            Some(execution) => execution,
            None => {
                let in_flight = self
                    .store
                    .list_step_executions(&instance.id)
                    .await?
                    .into_iter()
                    .any(|e| e.step_id == step.id && !e.status.is_terminal());
                if in_flight {
                    debug!(
                        "Step {} of instance {} is already in flight",
                        step.id, instance.id
                    );
                    return Ok(Advance::Halt);
                }

                let mut execution = StepExecution::for_step(&instance.id, &step);
                execution.input = step.parameters.clone();
                self.store.save_step_execution(execution.clone()).await?;
                execution
            }
        };

        let context = self
            .store
            .get_execution_context(&instance.id)
            .await?
            .unwrap_or_else(|| ExecutionContext::new(&instance.id));

        info!(
            "Executing step {} ({}) of workflow instance {}",
            step.id, step.step_type, instance.id
        );

        match &step.step_type {
            StepType::Start => {
                execution.start()?;
                self.complete_step(&mut execution).await?;
                self.advance(&mut instance, &definition, &step).await
            }
            StepType::End => {
                execution.start()?;
                self.complete_step(&mut execution).await?;
                instance.complete()?;
                self.store.save_instance(instance.clone()).await?;
                metrics::record_instance_finished(WorkflowStatus::Completed);
                info!("Workflow instance {} completed", instance.id);
                Ok(Advance::Halt)
            }
            StepType::Task => {
                self.execute_task_step(&mut instance, &definition, &step, &mut execution)
                    .await
            }
            StepType::Decision => {
                self.execute_decision_step(&mut instance, &definition, &step, &mut execution, &context)
                    .await
            }
            StepType::Notification | StepType::Integration | StepType::Subprocess => {
                execution.start()?;
                self.store.save_step_execution(execution.clone()).await?;

                match self.executor.execute_step(&step, &context).await {
                    Ok(result) if result.success => {
                        execution.output = into_map(result.output);
                        self.complete_step(&mut execution).await?;
                        self.advance(&mut instance, &definition, &step).await
                    }
                    Ok(result) => {
                        execution.output = into_map(result.output);
                        let reason = format!("Step {} reported failure", step.id);
                        self.handle_step_failure(&mut instance, &step, &mut execution, reason, true)
                            .await
                    }
                    Err(e) => {
                        self.handle_step_failure(&mut instance, &step, &mut execution, e.to_string(), true)
                            .await
                    }
                }
            }
            StepType::Other(kind) => {
                execution.start()?;
                let reason = format!("Unknown step type: {}", kind);
                self.handle_step_failure(&mut instance, &step, &mut execution, reason, false)
                    .await
            }
        }
    }

    async fn execute_task_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        execution: &mut StepExecution,
    ) -> Result<Advance> {
        let role = step.agent_role_required.clone();
        let agent_id = match self.assigner.assign_best_agent(role.clone()).await {
            Ok(agent_id) => agent_id,
            Err(e) => {
                warn!(
                    "Agent assignment for step {} failed, using {}: {}",
                    step.id, self.config.default_agent_id, e
                );
                self.config.default_agent_id.clone()
            }
        };

        execution.assign(agent_id, role)?;
        execution.start()?;

        match self.config.task_completion {
            TaskCompletionMode::Auto => {
                self.complete_step(execution).await?;
                self.advance(instance, definition, step).await
            }
            TaskCompletionMode::External => {
                execution.wait()?;
                self.store.save_step_execution(execution.clone()).await?;
                info!(
                    "Step {} of workflow instance {} is waiting for completion ({})",
                    step.id, instance.id, execution.id
                );
                Ok(Advance::Halt)
            }
        }
    }

    async fn execute_decision_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        execution: &mut StepExecution,
        context: &ExecutionContext,
    ) -> Result<Advance> {
        execution.start()?;

        let outgoing = definition.transitions_from(&step.id);
        if outgoing.is_empty() {
            let reason = format!("No transitions from step: {}", step.id);
            execution.fail(reason.clone())?;
            self.store.save_step_execution(execution.clone()).await?;
            metrics::record_step_execution(StepStatus::Failed);
            self.fail_instance(instance, reason).await?;
            return Ok(Advance::Halt);
        }

        let selected = match self.select_transition(&outgoing, context) {
            Ok(selected) => selected,
            Err(e) => {
                return self
                    .handle_step_failure(instance, step, execution, e.to_string(), false)
                    .await;
            }
        };

        let Some(transition) = selected else {
            let reason = format!("No matching transition from decision step: {}", step.id);
            return self
                .handle_step_failure(instance, step, execution, reason, false)
                .await;
        };

        execution
            .output
            .insert("selectedTransition".to_string(), Value::String(transition.id.clone()));
        execution
            .output
            .insert("nextStepId".to_string(), Value::String(transition.to_step_id.clone()));
        self.complete_step(execution).await?;
        self.move_to(instance, definition, &transition.to_step_id).await
    }

    /// AUTOMATIC beats CONDITIONAL whatever the order. Within a type, higher
    /// priority first, then definition order.
    fn select_transition<'a>(
        &self,
        outgoing: &[&'a WorkflowTransition],
        context: &ExecutionContext,
    ) -> Result<Option<&'a WorkflowTransition>> {
        let by_type = |kind: TransitionType| {
            let mut matching: Vec<&'a WorkflowTransition> = outgoing
                .iter()
                .copied()
                .filter(|t| t.transition_type == kind)
                .collect();
            matching.sort_by(|a, b| b.priority.cmp(&a.priority));
            matching
        };

        if let Some(automatic) = by_type(TransitionType::Automatic).into_iter().next() {
            return Ok(Some(automatic));
        }

        let conditional = by_type(TransitionType::Conditional);
        if !self.config.evaluate_conditions {
            return Ok(conditional.into_iter().next());
        }

        for transition in conditional {
            let matched = match transition.condition.as_deref() {
                None => true,
                Some(condition) if condition.trim().is_empty() => true,
                Some(condition) => self.conditions.evaluate(condition, context)?,
            };
            if matched {
                return Ok(Some(transition));
            }
        }
        Ok(None)
    }

    /// Follow the first outgoing transition of `step`. A step with none fails the instance.
    async fn advance(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
    ) -> Result<Advance> {
        let next = definition
            .transitions_from(&step.id)
            .first()
            .map(|t| t.to_step_id.clone());

        match next {
            Some(next) => self.move_to(instance, definition, &next).await,
            None => {
                let reason = format!("No transitions from step: {}", step.id);
                self.fail_instance(instance, reason).await?;
                Ok(Advance::Halt)
            }
        }
    }

    async fn move_to(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step_id: &str,
    ) -> Result<Advance> {
        if definition.step(step_id).is_none() {
            let reason = format!("Transition target not found in definition: {}", step_id);
            self.fail_instance(instance, reason).await?;
            return Ok(Advance::Halt);
        }

        instance.transition_to(step_id)?;
        self.store.save_instance(instance.clone()).await?;
        debug!("Workflow instance {} moved to step {}", instance.id, step_id);
        Ok(Advance::Continue)
    }

    async fn complete_step(&self, execution: &mut StepExecution) -> Result<()> {
        execution.complete()?;
        self.store.save_step_execution(execution.clone()).await?;
        metrics::record_step_execution(StepStatus::Completed);
        Ok(())
    }

    /// Record a failed step and decide what happens next: another attempt,
    /// the step's error handler, or the configured stall/escalate policy.
    async fn handle_step_failure(
        &self,
        instance: &mut WorkflowInstance,
        step: &WorkflowStep,
        execution: &mut StepExecution,
        reason: String,
        retryable: bool,
    ) -> Result<Advance> {
        warn!(
            "Step {} of workflow instance {} failed (attempt {}): {}",
            step.id, instance.id, execution.attempt, reason
        );

        if execution.status == StepStatus::Pending {
            execution.start()?;
        }
        if !execution.status.is_terminal() {
            execution.fail(reason.clone())?;
        }
        self.store.save_step_execution(execution.clone()).await?;
        metrics::record_step_execution(execution.status);

        if retryable && execution.attempt < step.retry_limit {
            let retry = execution.retry();
            info!(
                "Retrying step {} of workflow instance {} (attempt {} of {})",
                step.id, instance.id, retry.attempt, step.retry_limit
            );
            self.store.save_step_execution(retry).await?;
            return Ok(Advance::Continue);
        }

        if let Some(handler) = step.error_handling_step_id.clone() {
            let hops = error_handler_hops(instance);
            if handler == step.id {
                warn!(
                    "Step {} names itself as error handler, not rerouting workflow instance {}",
                    step.id, instance.id
                );
            } else if hops >= self.config.max_error_handler_hops {
                warn!(
                    "Workflow instance {} reached {} error handler reroutes, not rerouting to {}",
                    instance.id, hops, handler
                );
            } else {
                info!(
                    "Routing workflow instance {} to error handling step {}",
                    instance.id, handler
                );
                instance
                    .metadata
                    .insert(ERROR_HANDLER_HOPS.to_string(), Value::from(hops + 1));
                instance.transition_to(handler)?;
                self.store.save_instance(instance.clone()).await?;
                return Ok(Advance::Continue);
            }
        }

        if self.config.escalate_step_failures {
            self.fail_instance(instance, reason).await?;
        } else {
            warn!(
                "Workflow instance {} is stalled at step {}",
                instance.id, step.id
            );
        }
        Ok(Advance::Halt)
    }

    async fn fail_instance(
        &self,
        instance: &mut WorkflowInstance,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        error!("Workflow instance {} failed: {}", instance.id, reason);
        instance.fail(reason)?;
        self.store.save_instance(instance.clone()).await?;
        metrics::record_instance_finished(WorkflowStatus::Failed);
        Ok(())
    }

    pub async fn pause_workflow(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.require_instance(instance_id).await?;
        let result = self.pause_locked(instance_id).await;
        self.release_slot(instance_id).await;
        result
    }

    async fn pause_locked(&self, instance_id: &str) -> Result<WorkflowInstance> {
        let slot = self.slot(instance_id).await;
        let _guard = slot.lock.lock().await;

        let mut instance = self.require_instance(instance_id).await?;
        instance.pause()?;
        self.store.save_instance(instance.clone()).await?;
        info!("Workflow instance {} paused", instance.id);
        Ok(instance)
    }

    pub async fn resume_workflow(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.require_instance(instance_id).await?;
        let result = self.resume_locked(instance_id).await;
        self.release_slot(instance_id).await;
        let instance = result?;

        info!("Workflow instance {} resumed", instance.id);
        self.enqueue(&instance.id).await?;
        Ok(instance)
    }

    async fn resume_locked(&self, instance_id: &str) -> Result<WorkflowInstance> {
        let slot = self.slot(instance_id).await;
        let _guard = slot.lock.lock().await;

        let mut instance = self.require_instance(instance_id).await?;
        instance.resume()?;
        self.store.save_instance(instance.clone()).await?;
        Ok(instance)
    }

    pub async fn cancel_workflow(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.require_instance(instance_id).await?;
        let result = self.cancel_locked(instance_id).await;
        self.release_slot(instance_id).await;
        result
    }

    async fn cancel_locked(&self, instance_id: &str) -> Result<WorkflowInstance> {
        let slot = self.slot(instance_id).await;
        let _guard = slot.lock.lock().await;

        let mut instance = self.require_instance(instance_id).await?;
        instance.cancel()?;
        self.store.save_instance(instance.clone()).await?;
        metrics::record_instance_finished(WorkflowStatus::Cancelled);
        info!("Workflow instance {} cancelled", instance.id);
        Ok(instance)
    }

    pub async fn get_workflow_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        self.store.get_instance(instance_id).await
    }

    /// Every step execution of the instance, oldest first.
    pub async fn get_step_executions(&self, instance_id: &str) -> Result<Vec<StepExecution>> {
        self.store.list_step_executions(instance_id).await
    }

    pub async fn get_execution_context(&self, instance_id: &str) -> Result<Option<ExecutionContext>> {
        self.store.get_execution_context(instance_id).await
    }

    /// Merge `updates` into the instance's context data, creating the context
    /// when there is none yet.
    pub async fn update_execution_context(
        &self,
        instance_id: &str,
        updates: HashMap<String, Value>,
    ) -> Result<ExecutionContext> {
        let result = {
            let slot = self.slot(instance_id).await;
            let _guard = slot.lock.lock().await;
            self.merge_context(instance_id, updates).await
        };
        self.release_slot(instance_id).await;
        result
    }

    async fn merge_context(
        &self,
        instance_id: &str,
        updates: HashMap<String, Value>,
    ) -> Result<ExecutionContext> {
        let mut attempt = 0;
        loop {
            let (context, expected) = match self.store.get_execution_context(instance_id).await? {
                Some(mut context) => {
                    let expected = context.version;
                    context.merge(updates.clone());
                    (context, Some(expected))
                }
                None => (ExecutionContext::with_data(instance_id, updates.clone()), None),
            };

            match self
                .store
                .save_execution_context(context.clone(), expected)
                .await
            {
                Ok(()) => {
                    debug!(
                        "Execution context of {} at version {}",
                        instance_id, context.version
                    );
                    return Ok(context);
                }
                Err(Error::VersionConflict(msg)) if attempt < self.config.context_update_retries => {
                    attempt += 1;
                    warn!(
                        "Execution context update for {} conflicted, retrying ({}/{}): {}",
                        instance_id, attempt, self.config.context_update_retries, msg
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete or fail a step execution that is waiting on external work,
    /// then let the instance continue.
    pub async fn report_step_completion(
        &self,
        step_execution_id: &str,
        outcome: StepOutcome,
    ) -> Result<StepExecution> {
        let known = self
            .store
            .get_step_execution(step_execution_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Step execution not found: {}", step_execution_id))
            })?;

        let result = self.complete_locked(&known.workflow_instance_id, step_execution_id, outcome).await;
        self.release_slot(&known.workflow_instance_id).await;
        let (execution, next) = result?;

        if next == Advance::Continue {
            self.enqueue(&known.workflow_instance_id).await?;
        }
        Ok(execution)
    }

    async fn complete_locked(
        &self,
        instance_id: &str,
        step_execution_id: &str,
        outcome: StepOutcome,
    ) -> Result<(StepExecution, Advance)> {
        let slot = self.slot(instance_id).await;
        let _guard = slot.lock.lock().await;

        let mut execution = self
            .store
            .get_step_execution(step_execution_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Step execution not found: {}", step_execution_id))
            })?;
        if execution.status != StepStatus::Waiting {
            return Err(Error::StateConflict(format!(
                "Step execution {} is {}, not waiting for completion",
                execution.id, execution.status
            )));
        }

        let mut instance = self.require_instance(&execution.workflow_instance_id).await?;
        if !instance.is_running() {
            return Err(Error::StateConflict(format!(
                "Workflow instance {} is {}, cannot accept step completion",
                instance.id, instance.status
            )));
        }

        let definition = self
            .require_definition(&instance.workflow_definition_id)
            .await?;
        let step = definition.step(&execution.step_id).cloned().ok_or_else(|| {
            Error::StepDispatch(format!(
                "Step {} is not part of workflow definition {}",
                execution.step_id, definition.id
            ))
        })?;

        let next = match outcome {
            StepOutcome::Completed { output } => {
                execution.output = output.clone();
                self.complete_step(&mut execution).await?;
                info!(
                    "Step {} of workflow instance {} completed externally",
                    step.id, instance.id
                );
                if !output.is_empty() {
                    self.merge_context(&instance.id, output).await?;
                }
                if instance.current_step_id.as_deref() == Some(step.id.as_str()) {
                    self.advance(&mut instance, &definition, &step).await?
                } else {
                    Advance::Halt
                }
            }
            StepOutcome::Failed { reason } => {
                self.handle_step_failure(&mut instance, &step, &mut execution, reason, true)
                    .await?
            }
        };

        Ok((execution, next))
    }

    /// Mark every running or waiting step execution that outlived its
    /// timeout as TIMEOUT. Returns how many were timed out.
    pub async fn check_timeouts(&self) -> Result<usize> {
        let now = Utc::now();
        let mut candidates = self
            .store
            .list_step_executions_by_status(StepStatus::Running)
            .await?;
        candidates.extend(
            self.store
                .list_step_executions_by_status(StepStatus::Waiting)
                .await?,
        );

        let mut timed_out = 0;
        for candidate in candidates.into_iter().filter(|e| e.is_timed_out(now)) {
            let result = self
                .time_out_locked(&candidate.workflow_instance_id, &candidate.id, now)
                .await;
            self.release_slot(&candidate.workflow_instance_id).await;

            if let Some(next) = result? {
                timed_out += 1;
                if next == Advance::Continue {
                    self.enqueue(&candidate.workflow_instance_id).await?;
                }
            }
        }

        Ok(timed_out)
    }

    /// `None` when the execution no longer qualifies once the lock is held.
    async fn time_out_locked(
        &self,
        instance_id: &str,
        step_execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Advance>> {
        let slot = self.slot(instance_id).await;
        let _guard = slot.lock.lock().await;

        let Some(mut execution) = self.store.get_step_execution(step_execution_id).await? else {
            return Ok(None);
        };
        if !execution.is_timed_out(now) {
            return Ok(None);
        }
        let Some(mut instance) = self.store.get_instance(instance_id).await? else {
            return Ok(None);
        };
        if !instance.is_running() {
            return Ok(None);
        }
        let Some(definition) = self
            .store
            .get_definition(&instance.workflow_definition_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(step) = definition.step(&execution.step_id).cloned() else {
            return Ok(None);
        };

        let reason = format!(
            "Step {} timed out after {} seconds",
            step.id, execution.timeout_seconds
        );
        execution.time_out(reason.clone())?;
        let next = self
            .handle_step_failure(&mut instance, &step, &mut execution, reason, true)
            .await?;
        Ok(Some(next))
    }
}

fn error_handler_hops(instance: &WorkflowInstance) -> u32 {
    instance
        .metadata
        .get(ERROR_HANDLER_HOPS)
        .and_then(Value::as_u64)
        .map_or(0, |hops| u32::try_from(hops).unwrap_or(u32::MAX))
}

fn into_map(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => HashMap::new(),
        other => HashMap::from([("result".to_string(), other)]),
    }
}
