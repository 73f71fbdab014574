use futures::StreamExt;
use serde_json::json;

use stepwise::{
    fold_chunks, lambda, ExecutionContext, LogFilter, RunKind, RunLog, RunLogPatch, Runnable,
};
use stepwise_test_utils::CharStreamer;

fn chain() -> Runnable {
    lambda("greet", |x| Ok(json!(format!("hey {}", x.as_str().unwrap_or("")))))
        | Runnable::new(CharStreamer::new("chars"))
}

async fn patches(runnable: &Runnable, filter: LogFilter) -> Vec<RunLogPatch> {
    runnable
        .astream_log(json!("jo"), &ExecutionContext::default(), filter)
        .map(|p| p.expect("patch"))
        .collect()
        .await
}

#[tokio::test]
async fn test_replay_reconstructs_output() {
    let expected = chain().call(json!("jo"), &ExecutionContext::default()).unwrap();
    let all = patches(&chain(), LogFilter::default()).await;

    assert_eq!(all[0].ops[0].path, "");
    let log = RunLog::from_patches(all).unwrap();
    assert_eq!(log.state["final_output"], expected);

    let streamed = log.state["streamed_output"].as_array().cloned().unwrap();
    assert_eq!(streamed.len(), 6);
    assert_eq!(fold_chunks(streamed.into_iter().map(Ok)).unwrap(), expected);

    let logs = log.state["logs"].as_array().cloned().unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["name"], "greet");
    assert_eq!(logs[0]["tags"], json!(["seq:step:1"]));
    assert_eq!(logs[1]["name"], "chars");
    assert_eq!(logs[1]["streamed_output"].as_array().map(Vec::len), Some(6));
    assert_eq!(logs[1]["final_output"], expected);
    assert!(logs[1]["end_time"].is_string());
}

#[tokio::test]
async fn test_exclude_filter_drops_entries() {
    let filter = LogFilter::default().exclude_tags(["seq:step:1"]);
    let log = RunLog::from_patches(patches(&chain(), filter).await).unwrap();
    let logs = log.state["logs"].as_array().cloned().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["name"], "chars");
    assert_eq!(log.state["final_output"], json!("hey jo"));
}

#[tokio::test]
async fn test_split_replay_combines() {
    let all = patches(&chain(), LogFilter::default().include_kinds([RunKind::Leaf])).await;
    let whole = RunLog::from_patches(all.clone()).unwrap();

    let (head, tail) = all.split_at(all.len() / 2);
    let left = RunLog::from_patches(head.to_vec()).unwrap();
    let right = RunLogPatch::new(tail.iter().flat_map(|p| p.ops.clone()).collect());
    let mut combined = left;
    combined.apply(&right).unwrap();
    assert_eq!(combined.state, whole.state);
}
