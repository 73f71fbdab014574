use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, trace, warn};

use stepwise_core::traits::TraceListener;
use stepwise_core::types::{Run, RunId};

/// Collects finished top-level runs with their full subtrees.
#[derive(Default)]
pub struct RunCollector {
    runs: Mutex<Vec<Run>>,
}

impl RunCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished root runs in completion order.
    pub fn runs(&self) -> Vec<Run> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TraceListener for RunCollector {
    fn on_run_start(&self, _run: &Run) {}

    fn on_run_end(&self, run: &Run) {
        if run.is_root() {
            self.runs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(run.clone());
        }
    }
}

/// Forwards run lifecycle events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl TraceListener for TracingListener {
    fn on_run_start(&self, run: &Run) {
        debug!(
            run_id = %run.id,
            parent = ?run.parent_id.map(|p| p.to_string()),
            name = %run.name,
            kind = %run.kind,
            "Run started"
        );
    }

    fn on_run_end(&self, run: &Run) {
        let elapsed_ms = run
            .end_time
            .map(|end| (end - run.start_time).num_milliseconds())
            .unwrap_or(0);
        match &run.error {
            Some(error) => warn!(
                run_id = %run.id,
                name = %run.name,
                kind = %run.kind,
                elapsed_ms,
                error = %error,
                "Run failed"
            ),
            None => debug!(
                run_id = %run.id,
                name = %run.name,
                kind = %run.kind,
                elapsed_ms,
                children = run.children.len(),
                "Run finished"
            ),
        }
    }

    fn on_run_chunk(&self, run_id: &RunId, chunk: &Value) {
        trace!(run_id = %run_id, chunk = %chunk, "Run chunk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};
    use stepwise_core::types::RunKind;

    fn run(parent: Option<RunId>) -> Run {
        Run {
            id: RunId::new(),
            parent_id: parent,
            name: "step".into(),
            kind: RunKind::Leaf,
            input: json!(null),
            output: Some(json!(1)),
            error: None,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            tags: vec![],
            metadata: Map::new(),
            children: vec![],
        }
    }

    #[test]
    fn test_collector_keeps_roots_only() {
        let collector = RunCollector::new();
        let root = run(None);
        collector.on_run_end(&run(Some(root.id)));
        collector.on_run_end(&root);
        assert_eq!(collector.runs().len(), 1);
        collector.clear();
        assert!(collector.runs().is_empty());
    }

    #[test]
    fn test_tracing_listener_does_not_panic() {
        let listener = TracingListener;
        let mut failed = run(None);
        failed.error = Some("ValueError: nope".into());
        listener.on_run_start(&failed);
        listener.on_run_chunk(&failed.id, &json!("x"));
        listener.on_run_end(&failed);
    }
}
