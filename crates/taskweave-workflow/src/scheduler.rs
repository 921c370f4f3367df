use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use taskweave_core::config::WorkflowConfig;
use taskweave_core::error::{Result, WeaveError};
use taskweave_core::event::{EventBus, RunEvent};
use taskweave_core::types::{NodeDefinition, NodeStatus, RunId, RunStatus, WorkflowDefinition};

use crate::context::ExecutionContext;
use crate::graph::DependencyGraph;
use crate::retry::execute_node;
use crate::step::StepRegistry;

/// Control flag for a run. Pause and cancel are cooperative: they take
/// effect at the next node completion boundary, never mid-attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

/// Snapshot of one run: status plus the full execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Caller-side handle to a running workflow.
pub struct RunHandle {
    run_id: RunId,
    control: watch::Sender<Control>,
    state: Arc<Mutex<RunState>>,
    status_rx: watch::Receiver<RunStatus>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Clone of the current run state.
    pub fn snapshot(&self) -> RunState {
        lock_unpoisoned(&self.state).clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status_rx.borrow()
    }

    /// Stop dispatching new nodes; in-flight nodes run to completion.
    pub fn pause(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.control_error("cannot pause a finished run"));
        }
        match *self.control.borrow() {
            Control::Cancel => return Err(self.control_error("cannot pause a cancelled run")),
            Control::Pause => return Ok(()),
            Control::Run => {}
        }
        self.send_control(Control::Pause)
    }

    /// Recompute the ready set and continue dispatching.
    pub fn resume(&self) -> Result<()> {
        if self.status().is_terminal() {
            return Err(self.control_error("cannot resume a finished run"));
        }
        // Copy the flag out before sending: a match scrutinee keeps the
        // watch read guard alive, and `send` takes the write lock.
        let current = *self.control.borrow();
        match current {
            Control::Cancel => Err(self.control_error("cannot resume a cancelled run")),
            Control::Run => Ok(()),
            Control::Pause => self.send_control(Control::Run),
        }
    }

    /// Terminal: in-flight nodes finish, nothing new is dispatched, and
    /// the run can never be resumed.
    pub fn cancel(&self) -> Result<()> {
        if self.status().is_terminal() {
            return Err(self.control_error("cannot cancel a finished run"));
        }
        if *self.control.borrow() == Control::Cancel {
            return Ok(());
        }
        self.send_control(Control::Cancel)
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn send_control(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| self.control_error("run already finished"))
    }

    fn control_error(&self, message: &str) -> WeaveError {
        WeaveError::RunControl {
            run_id: self.run_id.0.clone(),
            message: message.to_string(),
        }
    }
}

/// Validate a definition and spawn its scheduler task.
pub(crate) fn spawn_run(
    definition: WorkflowDefinition,
    graph: DependencyGraph,
    registry: Arc<StepRegistry>,
    config: WorkflowConfig,
    bus: Arc<EventBus>,
) -> RunHandle {
    let run_id = RunId::new();
    let continue_on_failure = definition
        .continue_on_failure
        .unwrap_or(config.continue_on_failure);

    let context = ExecutionContext::new(definition.nodes.iter().map(|n| n.id.clone()));
    let state = Arc::new(Mutex::new(RunState {
        run_id: run_id.clone(),
        status: RunStatus::Pending,
        context,
        started_at: Utc::now(),
        finished_at: None,
    }));

    let (control_tx, control_rx) = watch::channel(Control::Run);
    let (status_tx, status_rx) = watch::channel(RunStatus::Pending);

    let scheduler = Scheduler {
        run_id: run_id.clone(),
        nodes: definition
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect(),
        graph,
        registry,
        config,
        continue_on_failure,
        state: Arc::clone(&state),
        status_tx,
        bus,
    };

    tokio::spawn(scheduler.drive(control_rx));

    RunHandle {
        run_id,
        control: control_tx,
        state,
        status_rx,
    }
}

struct Scheduler {
    run_id: RunId,
    nodes: HashMap<String, NodeDefinition>,
    graph: DependencyGraph,
    registry: Arc<StepRegistry>,
    config: WorkflowConfig,
    continue_on_failure: bool,
    state: Arc<Mutex<RunState>>,
    status_tx: watch::Sender<RunStatus>,
    bus: Arc<EventBus>,
}

impl Scheduler {
    /// The single coordinating task for one run. All context mutation
    /// happens here, so a completing node's write is atomic with the
    /// ready-set recomputation — a node is never scheduled twice or
    /// never.
    async fn drive(self, mut control_rx: watch::Receiver<Control>) {
        info!(run_id = %self.run_id, nodes = self.nodes.len(), "Workflow run started");
        self.set_status(RunStatus::Running);

        let mut tasks: JoinSet<(String, Result<(serde_json::Value, u32)>)> = JoinSet::new();

        loop {
            let control = *control_rx.borrow();

            if control == Control::Run {
                self.dispatch_ready(&mut tasks);
            }

            if tasks.is_empty() {
                match control {
                    Control::Cancel => {
                        info!(run_id = %self.run_id, "Workflow run cancelled");
                        self.finish(RunStatus::Cancelled);
                        return;
                    }
                    Control::Pause => {
                        self.set_status(RunStatus::Paused);
                        debug!(run_id = %self.run_id, "Workflow run paused");
                        if control_rx.changed().await.is_err() {
                            self.finish(RunStatus::Cancelled);
                            return;
                        }
                        if *control_rx.borrow() == Control::Run {
                            self.set_status(RunStatus::Running);
                        }
                        continue;
                    }
                    Control::Run => {
                        let all_terminal = lock_unpoisoned(&self.state).context.all_terminal();
                        if all_terminal {
                            self.finish_from_context();
                            return;
                        }
                        // Nothing in flight, nothing ready, nodes left:
                        // unreachable for a validated acyclic graph with
                        // skip propagation.
                        error!(run_id = %self.run_id, "Scheduler stalled with unfinished nodes");
                        self.finish(RunStatus::Failed);
                        return;
                    }
                }
            } else {
                tokio::select! {
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            // Controller gone; keep draining work.
                            continue;
                        }
                    }
                    Some(joined) = tasks.join_next() => {
                        match joined {
                            Ok((node_id, result)) => self.record_completion(&node_id, result),
                            Err(e) => {
                                error!(run_id = %self.run_id, error = %e, "Node task panicked");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Dispatch ready nodes up to the concurrency bound.
    fn dispatch_ready(&self, tasks: &mut JoinSet<(String, Result<(serde_json::Value, u32)>)>) {
        let capacity = self.config.concurrency.saturating_sub(tasks.len());
        if capacity == 0 {
            return;
        }

        let mut state = lock_unpoisoned(&self.state);
        let ready = self.graph.ready(&state.context);

        for node_id in ready.into_iter().take(capacity) {
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };

            let params = serde_json::Value::Object(node.params.clone());
            let resolved = match crate::reference::resolve(&params, &state.context) {
                Ok(v) => v,
                Err(e) => {
                    // Dependencies succeeded but a sub-field path missed.
                    warn!(run_id = %self.run_id, node_id = %node_id, error = %e, "Parameter resolution failed");
                    state.context.record_failure(&node_id, e.to_string(), 0);
                    self.emit_node(&node_id, NodeStatus::Failed, Some(e.to_string()));
                    self.skip_dependents(&mut state.context, &node_id);
                    continue;
                }
            };

            state.context.set_running(&node_id);
            self.emit_node(&node_id, NodeStatus::Running, None);
            debug!(run_id = %self.run_id, node_id = %node_id, kind = %node.kind, "Dispatching node");

            let registry = Arc::clone(&self.registry);
            let policy = node
                .retry
                .clone()
                .unwrap_or_else(|| self.config.default_retry.clone());
            let timeout = Duration::from_secs(
                node.timeout_secs.unwrap_or(self.config.default_timeout_secs),
            );
            let kind = node.kind.clone();
            let id = node_id.clone();

            tasks.spawn(async move {
                let result =
                    execute_node(&registry, &id, &kind, resolved, &policy, Some(timeout)).await;
                (id, result)
            });
        }
    }

    /// Record a node's terminal state and propagate skips. Runs inside
    /// the coordinating task only.
    fn record_completion(&self, node_id: &str, result: Result<(serde_json::Value, u32)>) {
        let mut state = lock_unpoisoned(&self.state);
        match result {
            Ok((output, attempts)) => {
                let summary = summarize(&output);
                state.context.record_success(node_id, output, attempts);
                debug!(run_id = %self.run_id, node_id, attempts, "Node succeeded");
                self.emit_node(node_id, NodeStatus::Success, Some(summary));
            }
            Err(e) => {
                let attempts = match &e {
                    WeaveError::NodeExecution { attempts, .. } => *attempts,
                    _ => 1,
                };
                warn!(run_id = %self.run_id, node_id, attempts, error = %e, "Node failed");
                state.context.record_failure(node_id, e.to_string(), attempts);
                self.emit_node(node_id, NodeStatus::Failed, Some(e.to_string()));
                self.skip_dependents(&mut state.context, node_id);
            }
        }
    }

    /// A node whose dependency failed is skipped, transitively.
    fn skip_dependents(&self, context: &mut ExecutionContext, node_id: &str) {
        for dependent in self.graph.transitive_dependents(node_id) {
            if context.status(&dependent) == Some(NodeStatus::Pending) {
                context.mark_skipped(&dependent);
                self.emit_node(&dependent, NodeStatus::Skipped, None);
            }
        }
    }

    fn finish_from_context(&self) {
        let failed = lock_unpoisoned(&self.state).context.any_failed();
        let status = if failed && !self.continue_on_failure {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        info!(run_id = %self.run_id, ?status, "Workflow run finished");
        self.finish(status);
    }

    fn set_status(&self, status: RunStatus) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.status = status;
        }
        // Publish before signaling watchers, so a woken `wait` observes
        // the event already in the bus.
        self.bus.publish(RunEvent::RunStateChanged {
            run_id: self.run_id.clone(),
            status,
            timestamp: Utc::now(),
        });
        let _ = self.status_tx.send(status);
    }

    fn finish(&self, status: RunStatus) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.status = status;
            state.finished_at = Some(Utc::now());
        }
        self.bus.publish(RunEvent::RunStateChanged {
            run_id: self.run_id.clone(),
            status,
            timestamp: Utc::now(),
        });
        let _ = self.status_tx.send(status);
    }

    fn emit_node(&self, node_id: &str, status: NodeStatus, summary: Option<String>) {
        self.bus.publish(RunEvent::NodeStateChanged {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            status,
            summary: summary.map(|s| truncate(&s, 200)),
            timestamp: Utc::now(),
        });
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn summarize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => truncate(s, 200),
        other => truncate(&other.to_string(), 200),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
