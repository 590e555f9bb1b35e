//! In-memory queue backend
//!
//! All four partitions sit behind a single mutex so every transition is
//! atomic with respect to concurrent callers in the same process.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{
    validate_task, warn_not_assigned, CompletedBatch, EnqueueOutcome, QueueResult, QueueStats,
    TaskQueue, Transition,
};
use crate::models::{
    CrawlTask, Partition, TaskResult, TaskStatus, META_LAST_ERROR, META_LINKS, META_RESULT,
};

/// Ordering key: highest priority first, then submission order
type PendingKey = (Reverse<i64>, u64);

#[derive(Default)]
struct QueueState {
    /// Every known task, by id
    tasks: HashMap<String, CrawlTask>,
    pending: BTreeMap<PendingKey, String>,
    assigned: HashSet<String>,
    /// Completion order, consumed by `completed_since`
    completed: Vec<String>,
    failed: HashSet<String>,
    /// Submission sequence of each task, reused when a claim is released
    order: HashMap<String, u64>,
    next_seq: u64,
}

impl QueueState {
    fn push_pending(&mut self, task_id: &str, priority: i64, seq: u64) {
        self.pending
            .insert((Reverse(priority), seq), task_id.to_string());
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Single-process queue used by the local cluster and tests
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitions currently holding the task (exactly one for known tasks)
    pub async fn memberships(&self, task_id: &str) -> Vec<Partition> {
        let state = self.state.lock().await;
        let mut found = Vec::new();
        if state.pending.values().any(|id| id == task_id) {
            found.push(Partition::Pending);
        }
        if state.assigned.contains(task_id) {
            found.push(Partition::Assigned);
        }
        if state.completed.iter().any(|id| id == task_id) {
            found.push(Partition::Completed);
        }
        if state.failed.contains(task_id) {
            found.push(Partition::Failed);
        }
        found
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, task: CrawlTask) -> QueueResult<EnqueueOutcome> {
        validate_task(&task)?;
        let mut state = self.state.lock().await;

        if state.tasks.contains_key(&task.id) {
            tracing::debug!(task_id = %task.id, "Duplicate task id, skipping enqueue");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let seq = state.next_seq();
        state.order.insert(task.id.clone(), seq);
        state.push_pending(&task.id, task.priority, seq);

        let mut task = task;
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_at = None;
        state.tasks.insert(task.id.clone(), task);

        Ok(EnqueueOutcome::Inserted)
    }

    async fn claim(&self, node_id: &str) -> QueueResult<Option<CrawlTask>> {
        let mut state = self.state.lock().await;

        let Some((_, task_id)) = state.pending.pop_first() else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&task_id) else {
            tracing::warn!(task_id = %task_id, "Dropping pending entry without a task record");
            return Ok(None);
        };
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(node_id.to_string());
        task.assigned_at = Some(Utc::now());
        let claimed = task.clone();

        state.assigned.insert(task_id);
        Ok(Some(claimed))
    }

    async fn transfer(&self, task_id: &str, node_id: &str) -> QueueResult<Transition> {
        let mut state = self.state.lock().await;
        if !state.assigned.contains(task_id) {
            warn_not_assigned("transfer", task_id);
            return Ok(Transition::Ignored);
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.assigned_to = Some(node_id.to_string());
        }
        Ok(Transition::Transferred)
    }

    async fn start(&self, task_id: &str) -> QueueResult<Transition> {
        let mut state = self.state.lock().await;
        if !state.assigned.contains(task_id) {
            warn_not_assigned("start", task_id);
            return Ok(Transition::Ignored);
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
        }
        Ok(Transition::Started)
    }

    async fn complete(&self, task_id: &str, result: TaskResult) -> QueueResult<Transition> {
        let mut state = self.state.lock().await;
        if !state.assigned.remove(task_id) {
            warn_not_assigned("complete", task_id);
            return Ok(Transition::Ignored);
        }
        state.completed.push(task_id.to_string());
        state.order.remove(task_id);

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.metadata
                .insert(META_RESULT.to_string(), result.summary());
            task.metadata
                .insert(META_LINKS.to_string(), serde_json::json!(result.links));
        }
        Ok(Transition::Completed)
    }

    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<Transition> {
        let mut state = self.state.lock().await;
        if !state.assigned.remove(task_id) {
            warn_not_assigned("fail", task_id);
            return Ok(Transition::Ignored);
        }

        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(Transition::Ignored);
        };
        task.retry_count += 1;
        task.metadata
            .insert(META_LAST_ERROR.to_string(), serde_json::json!(error));

        if task.retry_count < task.max_retries {
            task.priority = task.demoted_priority();
            task.status = TaskStatus::Retry;
            task.assigned_to = None;
            task.assigned_at = None;
            let (retry_count, priority) = (task.retry_count, task.priority);

            let seq = state.next_seq();
            state.order.insert(task_id.to_string(), seq);
            state.push_pending(task_id, priority, seq);
            Ok(Transition::Retrying {
                retry_count,
                priority,
            })
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            let retry_count = task.retry_count;
            state.failed.insert(task_id.to_string());
            state.order.remove(task_id);
            Ok(Transition::Failed { retry_count })
        }
    }

    async fn release(&self, task_id: &str) -> QueueResult<Transition> {
        let mut state = self.state.lock().await;
        if !state.assigned.remove(task_id) {
            warn_not_assigned("release", task_id);
            return Ok(Transition::Ignored);
        }

        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(Transition::Ignored);
        };
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_at = None;
        let priority = task.priority;

        let seq = match state.order.get(task_id).copied() {
            Some(seq) => seq,
            None => state.next_seq(),
        };
        state.push_pending(task_id, priority, seq);
        Ok(Transition::Released)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            pending: state.pending.len(),
            assigned: state.assigned.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn get(&self, task_id: &str) -> QueueResult<Option<CrawlTask>> {
        Ok(self.state.lock().await.tasks.get(task_id).cloned())
    }

    async fn assigned_tasks(&self) -> QueueResult<Vec<CrawlTask>> {
        let state = self.state.lock().await;
        Ok(state
            .assigned
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn completed_since(&self, cursor: usize, limit: usize) -> QueueResult<CompletedBatch> {
        let state = self.state.lock().await;
        let ids = state.completed.get(cursor..).unwrap_or_default();
        let ids = &ids[..ids.len().min(limit)];
        Ok(CompletedBatch {
            tasks: ids.iter().filter_map(|id| state.tasks.get(id).cloned()).collect(),
            next_cursor: cursor + ids.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn task(id: &str, priority: i64) -> CrawlTask {
        CrawlTask::new(format!("https://example.com/{id}"), priority, 0).with_id(id)
    }

    fn ok_result() -> TaskResult {
        TaskResult {
            status_code: 200,
            content_length: 512,
            elapsed_ms: 12,
            links: vec!["https://example.com/next".to_string()],
            skipped: None,
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = InMemoryQueue::new();
        for (id, priority) in [("a", 5), ("b", 1), ("c", 3), ("d", 1), ("e", 2)] {
            queue.enqueue(task(id, priority)).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(t) = queue.claim("node-1").await.unwrap() {
            order.push((t.id, t.priority));
        }
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 5),
                ("c".to_string(), 3),
                ("e".to_string(), 2),
                ("b".to_string(), 1),
                ("d".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let queue = InMemoryQueue::new();
        assert_eq!(
            queue.enqueue(task("t1", 1)).await.unwrap(),
            EnqueueOutcome::Inserted
        );
        assert_eq!(
            queue.enqueue(task("t1", 9)).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claim_sets_assignment_fields() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("t1", 1)).await.unwrap();

        let claimed = queue.claim("node-1").await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.assigned_to.as_deref(), Some("node-1"));
        assert!(claimed.assigned_at.is_some());
        assert_eq!(queue.memberships("t1").await, vec![Partition::Assigned]);
        assert!(queue.claim("node-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_stores_result() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("t1", 1)).await.unwrap();
        queue.claim("node-1").await.unwrap();

        let transition = queue.complete("t1", ok_result()).await.unwrap();
        assert_eq!(transition, Transition::Completed);

        let done = queue.get("t1").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.links(), vec!["https://example.com/next".to_string()]);
        assert_eq!(done.metadata[META_RESULT]["status_code"], 200);
        assert_eq!(queue.memberships("t1").await, vec![Partition::Completed]);
    }

    #[tokio::test]
    async fn test_complete_unassigned_is_noop() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("t1", 1)).await.unwrap();

        assert!(queue.complete("t1", ok_result()).await.unwrap().is_ignored());
        assert!(queue.complete("missing", ok_result()).await.unwrap().is_ignored());
        assert_eq!(queue.memberships("t1").await, vec![Partition::Pending]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("t1", 2).with_max_retries(3)).await.unwrap();

        queue.claim("n").await.unwrap();
        assert_eq!(
            queue.fail("t1", "boom 1").await.unwrap(),
            Transition::Retrying {
                retry_count: 1,
                priority: 1
            }
        );
        assert_eq!(queue.get("t1").await.unwrap().unwrap().status, TaskStatus::Retry);

        queue.claim("n").await.unwrap();
        assert_eq!(
            queue.fail("t1", "boom 2").await.unwrap(),
            Transition::Retrying {
                retry_count: 2,
                priority: 0
            }
        );

        queue.claim("n").await.unwrap();
        assert_eq!(
            queue.fail("t1", "boom 3").await.unwrap(),
            Transition::Failed { retry_count: 3 }
        );

        // a fourth fail finds nothing in assigned
        assert!(queue.fail("t1", "boom 4").await.unwrap().is_ignored());

        let failed = queue.get("t1").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.last_error(), Some("boom 3"));
        assert_eq!(queue.memberships("t1").await, vec![Partition::Failed]);
    }

    #[tokio::test]
    async fn test_retry_goes_behind_equal_priority() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("a", 0)).await.unwrap();
        queue.enqueue(task("b", 0)).await.unwrap();

        queue.claim("n").await.unwrap();
        queue.fail("a", "flaky").await.unwrap();

        assert_eq!(queue.claim("n").await.unwrap().unwrap().id, "b");
        assert_eq!(queue.claim("n").await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_release_restores_position() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("a", 1)).await.unwrap();
        queue.enqueue(task("b", 1)).await.unwrap();

        let claimed = queue.claim("n").await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(queue.release("a").await.unwrap(), Transition::Released);

        let released = queue.get("a").await.unwrap().unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.retry_count, 0);
        assert!(released.assigned_to.is_none());

        assert_eq!(queue.claim("n").await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_transfer_and_start() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("t1", 1)).await.unwrap();
        queue.claim("coordinator").await.unwrap();

        assert_eq!(
            queue.transfer("t1", "worker-1").await.unwrap(),
            Transition::Transferred
        );
        assert_eq!(queue.start("t1").await.unwrap(), Transition::Started);

        let running = queue.get("t1").await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.assigned_to.as_deref(), Some("worker-1"));
        assert_eq!(queue.assigned_tasks().await.unwrap().len(), 1);

        queue.release("t1").await.unwrap();
        assert!(queue.start("t1").await.unwrap().is_ignored());
    }

    #[tokio::test]
    async fn test_completed_since_cursor() {
        let queue = InMemoryQueue::new();
        for id in ["a", "b", "c"] {
            queue.enqueue(task(id, 0)).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            queue.claim("n").await.unwrap();
            queue.complete(id, ok_result()).await.unwrap();
        }

        let first = queue.completed_since(0, 2).await.unwrap();
        let ids: Vec<String> = first.tasks.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(first.next_cursor, 2);

        let rest = queue.completed_since(first.next_cursor, 10).await.unwrap();
        assert_eq!(rest.tasks.len(), 1);
        assert_eq!(rest.tasks[0].id, "c");
        assert_eq!(rest.next_cursor, 3);

        let empty = queue.completed_since(3, 10).await.unwrap();
        assert!(empty.tasks.is_empty());
        assert_eq!(empty.next_cursor, 3);
        // past the end
        assert_eq!(queue.completed_since(7, 10).await.unwrap().next_cursor, 7);
    }

    #[tokio::test]
    async fn test_terminal_tasks_drop_their_sequence() {
        let queue = InMemoryQueue::new();
        queue.enqueue(task("done", 0)).await.unwrap();
        queue.enqueue(task("dead", 0).with_max_retries(1)).await.unwrap();
        queue.enqueue(task("waiting", 0)).await.unwrap();

        queue.claim("n").await.unwrap();
        queue.complete("done", ok_result()).await.unwrap();
        queue.claim("n").await.unwrap();
        queue.fail("dead", "HTTP status 500").await.unwrap();

        let state = queue.state.lock().await;
        assert_eq!(state.order.len(), 1);
        assert!(state.order.contains_key("waiting"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..200 {
            queue.enqueue(task(&format!("t{i}"), i % 7)).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(t) = queue.claim(&format!("node-{n}")).await.unwrap() {
                    claimed.push(t.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
        assert_eq!(queue.stats().await.unwrap().assigned, 200);
    }

    proptest! {
        #[test]
        fn prop_claims_follow_priority_then_submission(priorities in proptest::collection::vec(-5i64..5, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let queue = InMemoryQueue::new();
                for (i, p) in priorities.iter().enumerate() {
                    queue.enqueue(task(&format!("t{i}"), *p)).await.unwrap();
                }

                let mut expected: Vec<(usize, i64)> = priorities.iter().copied().enumerate().collect();
                expected.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

                for (i, p) in expected {
                    let claimed = queue.claim("n").await.unwrap().unwrap();
                    assert_eq!(claimed.id, format!("t{i}"));
                    assert_eq!(claimed.priority, p);
                }
                assert!(queue.claim("n").await.unwrap().is_none());
            });
        }

        #[test]
        fn prop_every_task_in_exactly_one_partition(ops in proptest::collection::vec(0u8..4, 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let queue = InMemoryQueue::new();
                for i in 0..5 {
                    queue.enqueue(task(&format!("t{i}"), 0).with_max_retries(2)).await.unwrap();
                }

                let mut held: Vec<String> = Vec::new();
                for op in ops {
                    match op {
                        0 => {
                            if let Some(t) = queue.claim("n").await.unwrap() {
                                held.push(t.id);
                            }
                        }
                        1 => {
                            if let Some(id) = held.pop() {
                                queue.complete(&id, TaskResult::default()).await.unwrap();
                            }
                        }
                        2 => {
                            if let Some(id) = held.pop() {
                                queue.fail(&id, "err").await.unwrap();
                            }
                        }
                        _ => {
                            if let Some(id) = held.pop() {
                                queue.release(&id).await.unwrap();
                            }
                        }
                    }
                }

                for i in 0..5 {
                    let id = format!("t{i}");
                    let parts = queue.memberships(&id).await;
                    assert_eq!(parts.len(), 1, "task {id} in {parts:?}");
                    let t = queue.get(&id).await.unwrap().unwrap();
                    assert_eq!(t.partition(), parts[0]);
                }
                assert_eq!(queue.stats().await.unwrap().total(), 5);
            });
        }
    }
}
