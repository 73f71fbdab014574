use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;

use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{RunTracer, TraceListener};
use stepwise_core::types::{NewRun, Run, RunId};

struct RunEntry {
    run: Run,
    child_ids: Vec<RunId>,
    closed: bool,
}

/// Run table for one top-level invocation.
///
/// Open runs live in the table keyed by id. A closed run stays there until
/// its parent closes and absorbs it; a closed root leaves the table with its
/// whole subtree attached.
pub struct TraceSession {
    runs: Mutex<HashMap<RunId, RunEntry>>,
    listeners: Vec<Arc<dyn TraceListener>>,
}

impl TraceSession {
    pub fn new(listeners: Vec<Arc<dyn TraceListener>>) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            listeners,
        }
    }

    /// Number of runs still held in the table.
    pub fn pending(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunTracer for TraceSession {
    fn open(&self, parent: Option<&RunId>, new: NewRun) -> RunId {
        let id = RunId::new();
        let run = Run {
            id,
            parent_id: parent.copied(),
            name: new.name,
            kind: new.kind,
            input: new.input,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            tags: new.tags,
            metadata: new.metadata,
            children: Vec::new(),
        };

        {
            let mut runs = self.table();
            if let Some(entry) = parent.and_then(|p| runs.get_mut(p)) {
                entry.child_ids.push(id);
            }
            runs.insert(
                id,
                RunEntry {
                    run: run.clone(),
                    child_ids: Vec::new(),
                    closed: false,
                },
            );
        }

        for listener in &self.listeners {
            listener.on_run_start(&run);
        }
        id
    }

    fn chunk(&self, run_id: &RunId, chunk: &Value) {
        for listener in &self.listeners {
            listener.on_run_chunk(run_id, chunk);
        }
    }

    fn close(&self, run_id: &RunId, outcome: &Result<Value>) {
        let finished = {
            let mut runs = self.table();
            let Some(mut entry) = runs.remove(run_id) else {
                return;
            };
            if entry.closed {
                // Second close of the same run.
                runs.insert(*run_id, entry);
                return;
            }

            entry.run.end_time = Some(Utc::now());
            match outcome {
                Ok(output) => entry.run.output = Some(output.clone()),
                Err(e) => entry.run.error = Some(e.to_string()),
            }

            // Children still open at this point were abandoned mid-stream;
            // they close later without a parent to join.
            for child_id in std::mem::take(&mut entry.child_ids) {
                let closed = runs.get(&child_id).map(|c| c.closed).unwrap_or(false);
                if closed {
                    if let Some(child) = runs.remove(&child_id) {
                        entry.run.children.push(child.run);
                    }
                }
            }

            let finished = entry.run.clone();
            let has_parent = entry
                .run
                .parent_id
                .map(|p| runs.contains_key(&p))
                .unwrap_or(false);
            if has_parent {
                entry.closed = true;
                runs.insert(*run_id, entry);
            }
            finished
        };

        for listener in &self.listeners {
            listener.on_run_end(&finished);
        }
    }
}

/// An open run that closes itself exactly once.
///
/// Dropping a guard that was never finished closes the run with a
/// cancellation error, which is how abandoned streams are recorded.
pub struct RunGuard {
    tracer: Arc<dyn RunTracer>,
    id: RunId,
    finished: bool,
}

impl RunGuard {
    pub fn open(tracer: Arc<dyn RunTracer>, parent: Option<&RunId>, run: NewRun) -> Self {
        let id = tracer.open(parent, run);
        Self {
            tracer,
            id,
            finished: false,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn tracer(&self) -> &Arc<dyn RunTracer> {
        &self.tracer
    }

    pub fn chunk(&self, chunk: &Value) {
        self.tracer.chunk(&self.id, chunk);
    }

    pub fn finish(mut self, outcome: &Result<Value>) {
        self.finished = true;
        self.tracer.close(&self.id, outcome);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            let err = StepError::step("Cancelled", "run dropped before completion");
            self.tracer.close(&self.id, &Err(err));
        }
    }
}
