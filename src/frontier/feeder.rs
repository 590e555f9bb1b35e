//! Frontier feeding the distributed queue
//!
//! In distributed mode the policy cannot control execution order directly, so
//! it is approximated with task priorities:
//!
//! | strategy | priority of a task at depth d          |
//! |----------|----------------------------------------|
//! | bfs      | `-d` (shallower always first)          |
//! | dfs      | `d` (deeper always first)              |
//! | priority | the seed's priority, inherited by links |
//! | adaptive | `-d`, plus a boost for high-value URLs |
//!
//! A URL is high-value when it matches a pattern or was found on a page that
//! links to a match. Discovered links come back through
//! [`TaskQueue::completed_since`]; the coordinator calls
//! [`QueueFrontier::pump`] to expand them.
//!
//! URLs are admitted before they are enqueued. When an enqueue fails the
//! unsent URLs are forgotten again, so a retried seed or pump offers them
//! anew.

use tokio::sync::Mutex;

use super::url::{high_value_score, matches_any};
use super::{validate_seeds, Admission, Frontier, FrontierError, Seed, TraversalSettings, TraversalStrategy};
use crate::models::CrawlTask;
use crate::queue::{EnqueueOutcome, SharedQueue};

/// Priority boost per matched pattern for adaptive high-value URLs
pub const HIGH_VALUE_BOOST: i64 = 10;

/// Completed tasks read per pump
const PUMP_BATCH: usize = 256;

struct FeederState {
    frontier: Frontier,
    /// Position in the completed feed
    cursor: usize,
}

/// Admission control in front of a [`TaskQueue`](crate::queue::TaskQueue)
pub struct QueueFrontier {
    queue: SharedQueue,
    strategy: TraversalStrategy,
    patterns: Vec<String>,
    max_retries: u32,
    state: Mutex<FeederState>,
    /// Held for a whole pump so concurrent pumps never read the same cursor
    pumping: Mutex<()>,
}

impl QueueFrontier {
    pub fn new(
        queue: SharedQueue,
        strategy: TraversalStrategy,
        settings: &TraversalSettings,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            strategy,
            patterns: settings.high_value_patterns.clone(),
            max_retries,
            state: Mutex::new(FeederState {
                frontier: Frontier::new(settings.max_depth, settings.max_pages),
                cursor: 0,
            }),
            pumping: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> TraversalStrategy {
        self.strategy
    }

    /// Queue priority of a URL at `depth` whose parent had `inherited`.
    /// `linked_high_value` is set when the parent page links to a
    /// high-value URL.
    pub fn priority_for(&self, url: &str, depth: u32, inherited: i64, linked_high_value: bool) -> i64 {
        let depth = i64::from(depth);
        match self.strategy {
            TraversalStrategy::Bfs => -depth,
            TraversalStrategy::Dfs => depth,
            TraversalStrategy::Priority => inherited,
            TraversalStrategy::Adaptive => {
                let score = high_value_score(url, &self.patterns) + usize::from(linked_high_value);
                -depth + HIGH_VALUE_BOOST * score as i64
            }
        }
    }

    /// Admit seeds at depth 0 and enqueue them. Returns the new task ids;
    /// seeds already admitted in this run are skipped.
    ///
    /// An explicit `priority` overrides the strategy's priority.
    pub async fn seed(
        &self,
        seeds: &[Seed],
        priority: Option<i64>,
    ) -> Result<Vec<String>, FrontierError> {
        let seeds = validate_seeds(seeds)?;

        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock().await;
            for seed in seeds {
                if let Admission::Admitted(url) = state.frontier.admit(&seed.url, 0) {
                    let priority =
                        priority.unwrap_or_else(|| self.priority_for(&url, 0, seed.priority, false));
                    tasks.push(CrawlTask::new(url, priority, 0).with_max_retries(self.max_retries));
                }
            }
        }

        let ids = self.enqueue_all(tasks).await?;
        tracing::info!(strategy = %self.strategy, tasks = ids.len(), "Seeded frontier");
        Ok(ids)
    }

    /// Admit the links of a completed task one level deeper. Returns the
    /// number of tasks enqueued.
    pub async fn expand(&self, parent: &CrawlTask) -> Result<usize, FrontierError> {
        let links = parent.links();
        if links.is_empty() {
            return Ok(0);
        }

        let depth = parent.depth + 1;
        let linked_high_value = links.iter().any(|link| matches_any(link, &self.patterns));
        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock().await;
            for link in links {
                if let Admission::Admitted(url) = state.frontier.admit(&link, depth) {
                    let priority = self.priority_for(&url, depth, parent.priority, linked_high_value);
                    tasks.push(
                        CrawlTask::new(url, priority, depth)
                            .with_max_retries(self.max_retries)
                            .with_parent(parent.id.clone()),
                    );
                }
            }
        }

        let enqueued = self.enqueue_all(tasks).await?.len();
        if enqueued > 0 {
            tracing::debug!(task_id = %parent.id, depth, enqueued, "Expanded links");
        }
        Ok(enqueued)
    }

    /// Enqueue admitted tasks in order, returning the ids of those inserted.
    /// On error the failed task and every task after it are forgotten.
    async fn enqueue_all(&self, tasks: Vec<CrawlTask>) -> Result<Vec<String>, FrontierError> {
        let mut ids = Vec::with_capacity(tasks.len());
        let mut pending = tasks.into_iter();
        while let Some(task) = pending.next() {
            let id = task.id.clone();
            let url = task.url.clone();
            match self.queue.enqueue(task).await {
                Ok(EnqueueOutcome::Inserted) => ids.push(id),
                Ok(_) => {}
                Err(e) => {
                    let mut state = self.state.lock().await;
                    state.frontier.forget(&url);
                    let mut forgotten = 1;
                    for task in pending {
                        state.frontier.forget(&task.url);
                        forgotten += 1;
                    }
                    tracing::warn!(url = %url, forgotten, error = %e, "Enqueue failed, admissions rolled back");
                    return Err(e.into());
                }
            }
        }
        Ok(ids)
    }

    /// Expand every task completed since the last pump
    pub async fn pump(&self) -> Result<usize, FrontierError> {
        let _pumping = self.pumping.lock().await;
        let cursor = self.state.lock().await.cursor;
        let batch = self.queue.completed_since(cursor, PUMP_BATCH).await?;

        let mut enqueued = 0;
        for task in &batch.tasks {
            enqueued += self.expand(task).await?;
        }

        self.state.lock().await.cursor = batch.next_cursor;
        Ok(enqueued)
    }

    /// Pages admitted so far
    pub async fn admitted(&self) -> usize {
        self.state.lock().await.frontier.admitted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskResult;
    use crate::queue::{
        CompletedBatch, InMemoryQueue, QueueError, QueueResult, QueueStats, TaskQueue, Transition,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// In-memory queue that fails chosen enqueue calls and can hide completed
    /// tasks from the feed, as if their records were unreadable
    #[derive(Default)]
    struct FlakyQueue {
        inner: InMemoryQueue,
        enqueues: AtomicUsize,
        fail_on: Option<usize>,
        hidden: std::sync::Mutex<HashSet<String>>,
        cursors: std::sync::Mutex<Vec<usize>>,
    }

    impl FlakyQueue {
        /// Fail the `n`th enqueue (0-based), once
        fn failing_on(n: usize) -> Self {
            Self {
                fail_on: Some(n),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        async fn enqueue(&self, task: CrawlTask) -> QueueResult<EnqueueOutcome> {
            let n = self.enqueues.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(QueueError::Pool("connection reset".to_string()));
            }
            self.inner.enqueue(task).await
        }

        async fn claim(&self, node_id: &str) -> QueueResult<Option<CrawlTask>> {
            self.inner.claim(node_id).await
        }

        async fn transfer(&self, task_id: &str, node_id: &str) -> QueueResult<Transition> {
            self.inner.transfer(task_id, node_id).await
        }

        async fn start(&self, task_id: &str) -> QueueResult<Transition> {
            self.inner.start(task_id).await
        }

        async fn complete(&self, task_id: &str, result: TaskResult) -> QueueResult<Transition> {
            self.inner.complete(task_id, result).await
        }

        async fn fail(&self, task_id: &str, error: &str) -> QueueResult<Transition> {
            self.inner.fail(task_id, error).await
        }

        async fn release(&self, task_id: &str) -> QueueResult<Transition> {
            self.inner.release(task_id).await
        }

        async fn stats(&self) -> QueueResult<QueueStats> {
            self.inner.stats().await
        }

        async fn get(&self, task_id: &str) -> QueueResult<Option<CrawlTask>> {
            self.inner.get(task_id).await
        }

        async fn assigned_tasks(&self) -> QueueResult<Vec<CrawlTask>> {
            self.inner.assigned_tasks().await
        }

        async fn completed_since(&self, cursor: usize, limit: usize) -> QueueResult<CompletedBatch> {
            self.cursors.lock().unwrap().push(cursor);
            let mut batch = self.inner.completed_since(cursor, limit).await?;
            let hidden = self.hidden.lock().unwrap();
            batch.tasks.retain(|t| !hidden.contains(&t.id));
            Ok(batch)
        }
    }

    async fn complete_with_links(queue: &dyn TaskQueue, links: &[&str]) -> CrawlTask {
        let task = queue.claim("n1").await.unwrap().unwrap();
        queue
            .complete(
                &task.id,
                TaskResult {
                    status_code: 200,
                    links: links.iter().map(|l| l.to_string()).collect(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        task
    }

    fn settings(max_depth: u32, max_pages: usize) -> TraversalSettings {
        TraversalSettings {
            max_depth,
            max_pages,
            concurrency: 1,
            delay: Duration::ZERO,
            high_value_patterns: vec!["product".to_string()],
        }
    }

    fn feeder(strategy: TraversalStrategy) -> (Arc<InMemoryQueue>, QueueFrontier) {
        let queue = Arc::new(InMemoryQueue::new());
        let feeder = QueueFrontier::new(queue.clone(), strategy, &settings(2, 10), 3);
        (queue, feeder)
    }

    #[test]
    fn test_priority_per_strategy() {
        let (_, bfs) = feeder(TraversalStrategy::Bfs);
        assert_eq!(bfs.priority_for("https://x.example/", 2, 7, true), -2);

        let (_, dfs) = feeder(TraversalStrategy::Dfs);
        assert_eq!(dfs.priority_for("https://x.example/", 2, 7, true), 2);

        let (_, priority) = feeder(TraversalStrategy::Priority);
        assert_eq!(priority.priority_for("https://x.example/", 2, 7, false), 7);

        let (_, adaptive) = feeder(TraversalStrategy::Adaptive);
        assert_eq!(adaptive.priority_for("https://x.example/product", 1, 0, false), 9);
        assert_eq!(adaptive.priority_for("https://x.example/about", 1, 0, false), -1);
        // found next to a product link
        assert_eq!(adaptive.priority_for("https://x.example/about", 1, 0, true), 9);
        assert_eq!(adaptive.priority_for("https://x.example/product", 1, 0, true), 19);
    }

    #[tokio::test]
    async fn test_duplicate_seeds_enqueue_once() {
        let (queue, feeder) = feeder(TraversalStrategy::Bfs);
        let ids = feeder
            .seed(
                &[Seed::new("https://x.example/"), Seed::new("https://x.example/#dup")],
                None,
            )
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);

        let again = feeder.seed(&[Seed::new("https://x.example/")], None).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_seed_rejected() {
        let (queue, feeder) = feeder(TraversalStrategy::Bfs);
        let result = feeder
            .seed(&[Seed::new("https://ok.example/"), Seed::new("")], None)
            .await;
        assert!(matches!(result, Err(FrontierError::InvalidSeed(_))));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_pump_expands_completed_links() {
        let (queue, feeder) = feeder(TraversalStrategy::Bfs);
        feeder.seed(&[Seed::new("https://x.example/")], None).await.unwrap();

        let task = queue.claim("n1").await.unwrap().unwrap();
        queue
            .complete(
                &task.id,
                TaskResult {
                    status_code: 200,
                    links: vec![
                        "https://x.example/a".to_string(),
                        "https://x.example/".to_string(),
                        "https://x.example/b".to_string(),
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(feeder.pump().await.unwrap(), 2);
        // cursor advanced: nothing new on the second pump
        assert_eq!(feeder.pump().await.unwrap(), 0);

        let child = queue.claim("n1").await.unwrap().unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.priority, -1);
        assert_eq!(child.parent_task_id.as_deref(), Some(task.id.as_str()));
    }

    #[tokio::test]
    async fn test_expand_respects_max_depth() {
        let queue = Arc::new(InMemoryQueue::new());
        let feeder = QueueFrontier::new(queue.clone(), TraversalStrategy::Bfs, &settings(0, 10), 3);

        let mut parent = CrawlTask::new("https://x.example/", 0, 0);
        parent.metadata.insert(
            crate::models::META_LINKS.to_string(),
            serde_json::json!(["https://x.example/a"]),
        );
        assert_eq!(feeder.expand(&parent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_seed_enqueue_can_be_retried() {
        let queue = Arc::new(FlakyQueue::failing_on(0));
        let feeder = QueueFrontier::new(queue.clone(), TraversalStrategy::Bfs, &settings(2, 10), 3);

        let result = feeder.seed(&[Seed::new("https://x.example/")], None).await;
        assert!(matches!(result, Err(FrontierError::Queue(QueueError::Pool(_)))));
        assert_eq!(feeder.admitted().await, 0);

        let ids = feeder.seed(&[Seed::new("https://x.example/")], None).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
        assert_eq!(feeder.admitted().await, 1);
    }

    #[tokio::test]
    async fn test_failed_expand_keeps_unsent_links() {
        // enqueue #0 is the seed, #1 the first link, #2 the second fails
        let queue = Arc::new(FlakyQueue::failing_on(2));
        let feeder = QueueFrontier::new(queue.clone(), TraversalStrategy::Bfs, &settings(2, 10), 3);
        feeder.seed(&[Seed::new("https://x.example/")], None).await.unwrap();
        complete_with_links(
            queue.as_ref(),
            &["https://x.example/a", "https://x.example/b", "https://x.example/c"],
        )
        .await;

        assert!(feeder.pump().await.is_err());
        assert_eq!(feeder.admitted().await, 2);

        // the batch is read again and the links that never reached the queue
        // are admitted this time
        assert_eq!(feeder.pump().await.unwrap(), 2);
        assert_eq!(feeder.admitted().await, 4);
        assert_eq!(queue.stats().await.unwrap().pending, 3);
        assert_eq!(*queue.cursors.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_pump_cursor_counts_unreadable_records() {
        let queue = Arc::new(FlakyQueue::default());
        let feeder = QueueFrontier::new(queue.clone(), TraversalStrategy::Bfs, &settings(2, 10), 3);
        feeder
            .seed(&[Seed::new("https://x.example/"), Seed::new("https://y.example/")], None)
            .await
            .unwrap();

        let first = complete_with_links(queue.as_ref(), &["https://x.example/a"]).await;
        complete_with_links(queue.as_ref(), &["https://y.example/a"]).await;
        queue.hidden.lock().unwrap().insert(first.id.clone());

        assert_eq!(feeder.pump().await.unwrap(), 1);
        assert_eq!(feeder.pump().await.unwrap(), 0);
        // the second pump starts past both entries, not past the one decoded
        assert_eq!(*queue.cursors.lock().unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_adaptive_boosts_links_beside_high_value() {
        let (queue, feeder) = feeder(TraversalStrategy::Adaptive);
        feeder.seed(&[Seed::new("https://x.example/")], None).await.unwrap();
        complete_with_links(queue.as_ref(), &["https://x.example/shop", "https://x.example/product/1"]).await;

        assert_eq!(feeder.pump().await.unwrap(), 2);
        let first = queue.claim("n1").await.unwrap().unwrap();
        let second = queue.claim("n1").await.unwrap().unwrap();
        assert_eq!(first.url, "https://x.example/product/1");
        assert_eq!(first.priority, 19);
        assert_eq!(second.url, "https://x.example/shop");
        assert_eq!(second.priority, 9);
    }
}
