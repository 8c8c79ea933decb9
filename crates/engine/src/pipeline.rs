//! Pipelined execution on shared long-lived workers.
//!
//! Rules sharing a pipeline id run their build stages, in admission order,
//! on one worker process instead of spawning a process each. A rule is
//! admitted to its pipeline when it starts waiting for dependencies; its
//! stage runs only once every earlier-admitted rule has either run its own
//! stage or left the pipeline (a cache hit needs no stage). The worker
//! spawns lazily when the first stage actually runs, sees `first_stage`
//! exactly once, and shuts down when the last admitted rule finishes.

use anvil_core::{Error, PipelineSpec, PipelineWorker, PipelineWorkerSpawner, Result, RuleId};
use crate::scheduler::StageScheduler;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify};

struct PipelineState {
    worker: Option<Arc<dyn PipelineWorker>>,
    first_dispatched: bool,
    /// Admitted rules in order; the front is the next allowed to run.
    queue: Vec<RuleId>,
    /// Members currently waiting to run their stage; eligible for a
    /// run-ahead when the front member dispatches.
    ready: HashSet<RuleId>,
    /// Stage outcomes produced by a run-ahead, not yet adopted.
    completed: HashMap<RuleId, std::result::Result<(), String>>,
    members: usize,
}

/// Tracks every live pipeline of one build.
#[derive(Default)]
pub struct PipelineCoordinator {
    pipelines: Mutex<HashMap<Arc<str>, PipelineState>>,
    changed: Notify,
}

impl PipelineCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rule` with its pipeline. Idempotent per rule.
    pub async fn admit(&self, rule: &RuleId, spec: &PipelineSpec) {
        let mut pipelines = self.pipelines.lock().await;
        let state = pipelines
            .entry(Arc::clone(&spec.pipeline_id))
            .or_insert_with(|| PipelineState {
                worker: None,
                first_dispatched: false,
                queue: Vec::new(),
                ready: HashSet::new(),
                completed: HashMap::new(),
                members: 0,
            });
        if !state.queue.contains(rule) {
            state.queue.push(rule.clone());
            state.members += 1;
            tracing::debug!(
                rule = %rule,
                pipeline = %spec.pipeline_id,
                position = state.queue.len(),
                "Admitted rule to pipeline"
            );
        }
    }

    /// Run `rule`'s stage, or adopt the outcome if an earlier member's
    /// dispatch already ran it ahead on the shared worker.
    ///
    /// A member waits parked until it reaches the front of its pipeline's
    /// admission queue or its stage completes in a run-ahead; no
    /// execution capacity is held while parked. The front member takes a
    /// permit from `scheduler`, dispatches its own stage, then runs ahead
    /// through every later-admitted member already waiting here, so a live
    /// worker flows through the queued stages without cold restarts.
    pub async fn run_stage(
        &self,
        rule: &RuleId,
        spec: &PipelineSpec,
        scheduler: &StageScheduler,
        weight: Option<u32>,
    ) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            {
                let mut pipelines = self.pipelines.lock().await;
                let state = pipelines.get_mut(&spec.pipeline_id).ok_or_else(|| {
                    Error::configuration(format!(
                        "rule {rule} ran a pipeline stage without being admitted"
                    ))
                })?;
                if let Some(done) = state.completed.remove(rule) {
                    tracing::debug!(rule = %rule, pipeline = %spec.pipeline_id, "Adopting stage run ahead by the pipeline");
                    return done
                        .map_err(|message| Error::step_failed(rule.clone(), "pipeline", message));
                }
                state.ready.insert(rule.clone());
                if state.queue.first() != Some(rule) {
                    drop(pipelines);
                    notified.await;
                    continue;
                }
            }

            // Front of the queue; nothing can overtake it, so capacity
            // can be taken without re-checking the position.
            let _permit = scheduler.execution(weight).await?;
            let (worker, batch, first_stage) = {
                let mut pipelines = self.pipelines.lock().await;
                let state = pipelines.get_mut(&spec.pipeline_id).ok_or_else(|| {
                    Error::configuration(format!(
                        "pipeline {} torn down under rule {rule}",
                        spec.pipeline_id
                    ))
                })?;
                let worker = match &state.worker {
                    Some(worker) => Arc::clone(worker),
                    None => {
                        let worker = spec.spawner.spawn(&spec.pipeline_id).await?;
                        state.worker = Some(Arc::clone(&worker));
                        worker
                    }
                };
                let first_stage = !state.first_dispatched;
                state.first_dispatched = true;
                let batch: Vec<RuleId> = state
                    .queue
                    .iter()
                    .skip(1)
                    .filter(|member| state.ready.contains(*member))
                    .cloned()
                    .collect();
                (worker, batch, first_stage)
            };

            tracing::debug!(rule = %rule, pipeline = %spec.pipeline_id, first_stage, "Running pipeline stage");
            let own = worker.run_stage(rule, first_stage).await;
            if own.is_ok() && !batch.is_empty() {
                self.run_ahead(&worker, spec, batch).await;
            }
            return own;
        }
    }

    /// Run queued members' stages on the already-live worker and publish
    /// their outcomes for adoption. A failed stage ends the run; members
    /// past it dispatch themselves once they reach the front.
    async fn run_ahead(
        &self,
        worker: &Arc<dyn PipelineWorker>,
        spec: &PipelineSpec,
        batch: Vec<RuleId>,
    ) {
        let mut outcomes = Vec::with_capacity(batch.len());
        for member in batch {
            let done = worker.run_stage(&member, false).await;
            let failed = done.is_err();
            tracing::debug!(rule = %member, pipeline = %spec.pipeline_id, ok = !failed, "Pipeline ran stage ahead");
            outcomes.push((member, done.map_err(|e| e.to_string())));
            if failed {
                break;
            }
        }
        let mut pipelines = self.pipelines.lock().await;
        if let Some(state) = pipelines.get_mut(&spec.pipeline_id) {
            for (member, done) in outcomes {
                if state.queue.contains(&member) {
                    state.completed.insert(member, done);
                }
            }
        }
        drop(pipelines);
        self.changed.notify_waiters();
    }

    /// Release `rule` from its pipeline, whether or not its stage ran.
    /// Tears the worker down when the last member leaves.
    pub async fn finish(&self, rule: &RuleId, spec: &PipelineSpec) {
        let worker_to_stop = {
            let mut pipelines = self.pipelines.lock().await;
            let Some(state) = pipelines.get_mut(&spec.pipeline_id) else {
                return;
            };
            let Some(position) = state.queue.iter().position(|queued| queued == rule) else {
                return;
            };
            state.queue.remove(position);
            state.ready.remove(rule);
            state.completed.remove(rule);
            state.members -= 1;
            if state.members == 0 {
                pipelines
                    .remove(&spec.pipeline_id)
                    .and_then(|state| state.worker)
            } else {
                None
            }
        };
        self.changed.notify_waiters();
        if let Some(worker) = worker_to_stop {
            tracing::debug!(pipeline = %spec.pipeline_id, "Shutting down pipeline worker");
            worker.shutdown().await;
        }
    }
}

/// Spawns pipeline workers as child processes speaking a line protocol:
/// the engine writes `stage <rule>` or `stage-first <rule>` and expects a
/// line starting with `ok` back; `shutdown` ends the process.
pub struct ProcessWorkerSpawner {
    program: String,
    args: Vec<String>,
}

impl ProcessWorkerSpawner {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PipelineWorkerSpawner for ProcessWorkerSpawner {
    async fn spawn(&self, pipeline_id: &str) -> Result<Arc<dyn PipelineWorker>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(pipeline_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io_no_path(e, "spawn"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::configuration("pipeline worker has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::configuration("pipeline worker has no stdout"))?;
        tracing::info!(pipeline = %pipeline_id, program = %self.program, "Spawned pipeline worker");
        Ok(Arc::new(ProcessPipelineWorker {
            io: Mutex::new(WorkerIo {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
        }))
    }
}

struct WorkerIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct ProcessPipelineWorker {
    io: Mutex<WorkerIo>,
}

#[async_trait]
impl PipelineWorker for ProcessPipelineWorker {
    async fn run_stage(&self, rule: &RuleId, first_stage: bool) -> Result<()> {
        let mut io = self.io.lock().await;
        let verb = if first_stage { "stage-first" } else { "stage" };
        let request = format!("{verb} {rule}\n");
        io.stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::io_no_path(e, "write"))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| Error::io_no_path(e, "flush"))?;

        let mut response = String::new();
        let read = io
            .stdout
            .read_line(&mut response)
            .await
            .map_err(|e| Error::io_no_path(e, "read"))?;
        if read == 0 {
            return Err(Error::step_failed(
                rule.clone(),
                "pipeline",
                "worker exited before responding",
            ));
        }
        let response = response.trim();
        if response.starts_with("ok") {
            Ok(())
        } else {
            Err(Error::step_failed(rule.clone(), "pipeline", response))
        }
    }

    async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        let _ = io.stdin.write_all(b"shutdown\n").await;
        let _ = io.stdin.flush().await;
        if let Err(e) = io.child.wait().await {
            tracing::warn!("Pipeline worker did not exit cleanly: {e}");
        }
    }
}
