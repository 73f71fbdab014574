use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use stepwise_core::config::LogStreamConfig;
use stepwise_core::traits::TraceListener;
use stepwise_core::types::{Run, RunId, RunKind};

use crate::patch::{PatchOp, RunLogPatch};

/// Which nested runs get a `/logs/N` entry.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub include_names: Vec<String>,
    pub include_tags: Vec<String>,
    pub include_kinds: Vec<RunKind>,
    pub exclude_names: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_kinds: Vec<RunKind>,
}

impl LogFilter {
    pub fn include_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn include_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn include_kinds(mut self, kinds: impl IntoIterator<Item = RunKind>) -> Self {
        self.include_kinds.extend(kinds);
        self
    }

    pub fn exclude_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn exclude_kinds(mut self, kinds: impl IntoIterator<Item = RunKind>) -> Self {
        self.exclude_kinds.extend(kinds);
        self
    }

    /// Empty include lists admit every run; any exclude match rejects it.
    pub fn admits(&self, run: &Run) -> bool {
        let no_includes = self.include_names.is_empty()
            && self.include_tags.is_empty()
            && self.include_kinds.is_empty();

        let included = no_includes
            || self.include_names.iter().any(|n| *n == run.name)
            || self.include_kinds.contains(&run.kind)
            || run.tags.iter().any(|t| self.include_tags.contains(t));

        let excluded = self.exclude_names.iter().any(|n| *n == run.name)
            || self.exclude_kinds.contains(&run.kind)
            || run.tags.iter().any(|t| self.exclude_tags.contains(t));

        included && !excluded
    }
}

impl From<&LogStreamConfig> for LogFilter {
    fn from(config: &LogStreamConfig) -> Self {
        Self {
            include_names: config.include_names.clone(),
            include_tags: config.include_tags.clone(),
            include_kinds: config.include_kinds.clone(),
            exclude_names: config.exclude_names.clone(),
            exclude_tags: config.exclude_tags.clone(),
            exclude_kinds: config.exclude_kinds.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Patch(RunLogPatch),
    /// The root run closed; no further patches follow.
    Done,
}

#[derive(Default)]
struct EmitterState {
    root: Option<RunId>,
    indices: HashMap<RunId, usize>,
}

/// Turns run lifecycle events of one top-level invocation into run-log patches.
pub struct LogStreamListener {
    filter: LogFilter,
    state: Mutex<EmitterState>,
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl LogStreamListener {
    pub fn new(filter: LogFilter) -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            filter,
            state: Mutex::new(EmitterState::default()),
            tx,
        };
        (listener, rx)
    }

    fn emit(&self, ops: Vec<PatchOp>) {
        // The consumer may have stopped reading.
        let _ = self.tx.send(LogEvent::Patch(RunLogPatch::new(ops)));
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EmitterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_entry(run: &Run) -> Value {
    json!({
        "id": run.id.to_string(),
        "name": run.name,
        "type": run.kind.as_str(),
        "tags": run.tags,
        "metadata": run.metadata,
        "start_time": run.start_time.to_rfc3339(),
        "streamed_output": [],
        "final_output": null,
        "end_time": null,
    })
}

// Patches are sent while the state lock is held, so `/logs/N` entries reach
// the channel in index order even when runs start on different threads.
impl TraceListener for LogStreamListener {
    fn on_run_start(&self, run: &Run) {
        let mut state = self.state();
        if state.root.is_none() && run.is_root() {
            state.root = Some(run.id);
            self.emit(vec![PatchOp::replace(
                "",
                json!({
                    "id": run.id.to_string(),
                    "streamed_output": [],
                    "final_output": null,
                    "logs": [],
                }),
            )]);
        } else if self.filter.admits(run) {
            let index = state.indices.len();
            state.indices.insert(run.id, index);
            self.emit(vec![PatchOp::add(format!("/logs/{}", index), log_entry(run))]);
        }
    }

    fn on_run_chunk(&self, run_id: &RunId, chunk: &Value) {
        let state = self.state();
        let path = if state.root.as_ref() == Some(run_id) {
            "/streamed_output/-".to_string()
        } else if let Some(index) = state.indices.get(run_id) {
            format!("/logs/{}/streamed_output/-", index)
        } else {
            return;
        };
        self.emit(vec![PatchOp::add(path, chunk.clone())]);
    }

    fn on_run_end(&self, run: &Run) {
        let state = self.state();
        if state.root == Some(run.id) {
            let output = run.output.clone().unwrap_or(Value::Null);
            self.emit(vec![PatchOp::replace("/final_output", output)]);
            let _ = self.tx.send(LogEvent::Done);
            return;
        }

        let Some(index) = state.indices.get(&run.id).copied() else {
            return;
        };
        let end_time = run
            .end_time
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null);
        let mut ops = vec![
            PatchOp::add(
                format!("/logs/{}/final_output", index),
                run.output.clone().unwrap_or(Value::Null),
            ),
            PatchOp::add(format!("/logs/{}/end_time", index), end_time),
        ];
        if let Some(error) = &run.error {
            ops.push(PatchOp::add(format!("/logs/{}/error", index), json!(error)));
        }
        self.emit(ops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::RunLog;
    use crate::session::TraceSession;
    use serde_json::Map;
    use std::sync::Arc;
    use stepwise_core::traits::RunTracer;
    use stepwise_core::types::NewRun;

    fn new_run(name: &str, kind: RunKind, tags: &[&str]) -> NewRun {
        NewRun {
            name: name.into(),
            kind,
            input: json!("in"),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: Map::new(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LogEvent>) -> (Vec<RunLogPatch>, bool) {
        let mut patches = Vec::new();
        let mut done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LogEvent::Patch(p) => patches.push(p),
                LogEvent::Done => done = true,
            }
        }
        (patches, done)
    }

    #[test]
    fn test_filter_rules() {
        let run = |name: &str, kind, tags: &[&str]| Run {
            id: RunId::new(),
            parent_id: Some(RunId::new()),
            name: name.into(),
            kind,
            input: Value::Null,
            output: None,
            error: None,
            start_time: chrono::Utc::now(),
            end_time: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: Map::new(),
            children: vec![],
        };

        let all = LogFilter::default();
        assert!(all.admits(&run("x", RunKind::Leaf, &[])));

        let by_name = LogFilter::default().include_names(["parser"]);
        assert!(by_name.admits(&run("parser", RunKind::Leaf, &[])));
        assert!(!by_name.admits(&run("model", RunKind::Leaf, &[])));

        let mixed = LogFilter::default()
            .include_kinds([RunKind::Leaf])
            .exclude_tags(["seq:step:2"]);
        assert!(mixed.admits(&run("a", RunKind::Leaf, &["seq:step:1"])));
        assert!(!mixed.admits(&run("b", RunKind::Leaf, &["seq:step:2"])));
        assert!(!mixed.admits(&run("c", RunKind::Map, &[])));
    }

    #[test]
    fn test_patch_sequence_replays() {
        let (listener, mut rx) = LogStreamListener::new(LogFilter::default());
        let session = TraceSession::new(vec![Arc::new(listener)]);

        let root = session.open(None, new_run("seq", RunKind::Sequence, &[]));
        let child = session.open(Some(&root), new_run("emit", RunKind::Leaf, &["seq:step:1"]));
        session.chunk(&child, &json!("fo"));
        session.chunk(&root, &json!("fo"));
        session.chunk(&child, &json!("o"));
        session.chunk(&root, &json!("o"));
        session.close(&child, &Ok(json!("foo")));
        session.close(&root, &Ok(json!("foo")));

        let (patches, done) = drain(&mut rx);
        assert!(done);
        assert_eq!(patches[0].ops[0].path, "");
        assert_eq!(patches[1].ops[0].path, "/logs/0");

        let log = RunLog::from_patches(patches).unwrap();
        assert_eq!(log.state["final_output"], json!("foo"));
        assert_eq!(log.state["streamed_output"], json!(["fo", "o"]));
        assert_eq!(log.state["logs"][0]["name"], json!("emit"));
        assert_eq!(log.state["logs"][0]["streamed_output"], json!(["fo", "o"]));
        assert_eq!(log.state["logs"][0]["final_output"], json!("foo"));
        assert!(log.state["logs"][0]["end_time"].is_string());
    }

    #[test]
    fn test_runs_started_on_many_threads_replay() {
        let (listener, mut rx) = LogStreamListener::new(LogFilter::default());
        let session = TraceSession::new(vec![Arc::new(listener)]);
        let root = session.open(None, new_run("map", RunKind::Map, &[]));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let session = &session;
                let root = &root;
                scope.spawn(move || {
                    for _ in 0..25 {
                        let tag = format!("map:key:{}", worker);
                        let child = session.open(Some(root), new_run("branch", RunKind::Leaf, &[&tag]));
                        session.chunk(&child, &json!("c"));
                        session.close(&child, &Ok(json!(worker)));
                    }
                });
            }
        });
        session.close(&root, &Ok(json!({})));

        let (patches, done) = drain(&mut rx);
        assert!(done);
        let log = RunLog::from_patches(patches).unwrap();
        assert_eq!(log.state["logs"].as_array().map(Vec::len), Some(200));
        for entry in log.state["logs"].as_array().unwrap() {
            assert_eq!(entry["streamed_output"], json!(["c"]));
        }
    }

    #[test]
    fn test_filtered_runs_never_appear() {
        let filter = LogFilter::default().exclude_names(["hidden"]);
        let (listener, mut rx) = LogStreamListener::new(filter);
        let session = TraceSession::new(vec![Arc::new(listener)]);

        let root = session.open(None, new_run("root", RunKind::Sequence, &[]));
        let hidden = session.open(Some(&root), new_run("hidden", RunKind::Leaf, &[]));
        session.chunk(&hidden, &json!("x"));
        session.close(&hidden, &Ok(json!("x")));
        let shown = session.open(Some(&root), new_run("shown", RunKind::Leaf, &[]));
        session.close(&shown, &Ok(json!("y")));
        session.close(&root, &Ok(json!("y")));

        let (patches, _) = drain(&mut rx);
        let log = RunLog::from_patches(patches).unwrap();
        let logs = log.state["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["name"], json!("shown"));
        assert_eq!(log.state["final_output"], json!("y"));
    }

    #[test]
    fn test_failed_child_records_error() {
        let (listener, mut rx) = LogStreamListener::new(LogFilter::default());
        let session = TraceSession::new(vec![Arc::new(listener)]);
        let root = session.open(None, new_run("root", RunKind::Fallback, &[]));
        let child = session.open(Some(&root), new_run("primary", RunKind::Leaf, &[]));
        session.close(
            &child,
            &Err(stepwise_core::error::StepError::step("ValueError", "nope")),
        );
        session.close(&root, &Ok(json!("bar")));

        let (patches, _) = drain(&mut rx);
        let log = RunLog::from_patches(patches).unwrap();
        assert_eq!(log.state["logs"][0]["error"], json!("ValueError: nope"));
        assert_eq!(log.state["logs"][0]["final_output"], Value::Null);
    }
}
