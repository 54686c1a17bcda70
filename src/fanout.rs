// Bounded Fan-Out
//
// Runs one task per node with a concurrency ceiling. Every task runs to
// completion; failures are collected, never short-circuited.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::backend::NodeOutput;
use crate::error::{Error, ExitKind, Result};

/// Default ceiling on concurrent per-node tasks
pub const DEFAULT_PARALLELISM: usize = if cfg!(unix) { 50 } else { 5 };

/// Outcome of one node's task
#[derive(Debug)]
pub struct NodeResult<T> {
    pub node: u32,
    pub result: Result<T>,
}

/// Run `task` for every node, at most `limit` at a time. Results come back
/// in the order of `nodes`.
pub async fn fan_out<T, F, Fut>(nodes: &[u32], limit: usize, task: F) -> Vec<NodeResult<T>>
where
    T: Send + 'static,
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (index, &node) in nodes.iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let future = task(node);
        set.spawn(async move {
            // Hold the permit until the task finishes
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => future.await,
                Err(_) => Err(Error::Cancelled("fan-out closed".to_string())),
            };
            (index, result)
        });
    }

    let mut slots: Vec<Option<Result<T>>> = nodes.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => warn!(error = %e, "fan-out task did not complete"),
        }
    }

    nodes
        .iter()
        .zip(slots)
        .map(|(&node, slot)| NodeResult {
            node,
            result: slot.unwrap_or_else(|| {
                Err(Error::Exec {
                    target: format!("node {}", node),
                    command: "fan-out task".to_string(),
                    exit: ExitKind::Signal,
                    output: "task panicked or was aborted".to_string(),
                })
            }),
        })
        .collect()
}

/// Fold node results into one outcome; any failure yields `PartialFailure`
/// naming every failed node.
pub fn collect<T>(
    cluster: &str,
    operation: &str,
    results: Vec<NodeResult<T>>,
) -> Result<Vec<(u32, T)>> {
    let mut ok = Vec::with_capacity(results.len());
    let mut failures = std::collections::BTreeMap::new();

    for NodeResult { node, result } in results {
        match result {
            Ok(value) => ok.push((node, value)),
            Err(e) => {
                warn!(cluster, node, operation, error = %e, "node operation failed");
                failures.insert(node, e);
            }
        }
    }

    if failures.is_empty() {
        Ok(ok)
    } else {
        Err(Error::PartialFailure {
            cluster: cluster.to_string(),
            operation: operation.to_string(),
            failures,
        })
    }
}

/// Like `collect` for command runs, but a failure still carries the
/// outputs of every node that succeeded.
pub fn collect_outputs(cluster: &str, results: Vec<NodeResult<NodeOutput>>) -> Result<Vec<NodeOutput>> {
    let mut outputs = Vec::with_capacity(results.len());
    let mut failures = std::collections::BTreeMap::new();

    for NodeResult { node, result } in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => {
                warn!(cluster, node, error = %e, "commands failed on node");
                failures.insert(node, e);
            }
        }
    }

    if failures.is_empty() {
        Ok(outputs)
    } else {
        Err(Error::RunFailure {
            cluster: cluster.to_string(),
            outputs,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_failure_does_not_stop_siblings() {
        let ran = Arc::new(AtomicUsize::new(0));
        let results = fan_out(&[1, 2, 3], 50, |node| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                if node == 2 {
                    Err(Error::invalid("node 2 is broken"))
                } else {
                    Ok(node * 10)
                }
            }
        })
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        let order: Vec<u32> = results.iter().map(|r| r.node).collect();
        assert_eq!(order, vec![1, 2, 3]);

        let err = collect("mydc", "test", results).unwrap_err();
        assert_eq!(err.failed_nodes(), vec![2]);
    }

    #[tokio::test]
    async fn test_results_follow_input_order_not_completion_order() {
        let nodes = [5, 4, 3, 2, 1];
        let results = fan_out(&nodes, 5, |node| async move {
            // Larger numbers finish first
            tokio::time::sleep(Duration::from_millis(u64::from(6 - node) * 5)).await;
            Ok(node)
        })
        .await;
        let collected = collect("mydc", "test", results).unwrap();
        assert_eq!(collected, vec![(5, 5), (4, 4), (3, 3), (2, 2), (1, 1)]);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let count = Arc::new(AtomicUsize::new(0));
        let limit = 4;
        let nodes: Vec<u32> = (1..=40).collect();

        let results = fan_out(&nodes, limit, |node| {
            let count = count.clone();
            async move {
                let watermark = count.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(u64::from(node % 3))).await;
                count.fetch_sub(1, Ordering::SeqCst);
                Ok(watermark)
            }
        })
        .await;

        for (node, watermark) in collect("mydc", "test", results).unwrap() {
            assert!(
                watermark <= limit,
                "node {} observed {} concurrent tasks",
                node,
                watermark
            );
        }
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_node_error() {
        let results = fan_out(&[1, 2], 2, |node| async move {
            if node == 1 {
                panic!("boom");
            }
            Ok(())
        })
        .await;
        let err = collect("mydc", "test", results).unwrap_err();
        assert_eq!(err.failed_nodes(), vec![1]);
    }

    #[tokio::test]
    async fn test_empty_node_list() {
        let results = fan_out(&[], 10, |_| async { Ok(()) }).await;
        assert!(collect("mydc", "noop", results).unwrap().is_empty());
    }
}
