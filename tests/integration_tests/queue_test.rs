//! Queue lifecycle through the shared trait object

use fleetcrawl::config::StorageConfig;
use fleetcrawl::models::{CrawlTask, TaskResult, TaskStatus};
use fleetcrawl::queue::{build_queue, EnqueueOutcome, SharedQueue, Transition};

async fn memory_queue() -> SharedQueue {
    build_queue(&StorageConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_retries_exhaust_into_failed() {
    let queue = memory_queue().await;
    let task = CrawlTask::new("https://example.com/", 5, 0)
        .with_id("t-1")
        .with_max_retries(2);
    queue.enqueue(task).await.unwrap();

    queue.claim("n1").await.unwrap().unwrap();
    assert_eq!(
        queue.fail("t-1", "HTTP status 503").await.unwrap(),
        Transition::Retrying {
            retry_count: 1,
            priority: 4
        }
    );

    queue.claim("n1").await.unwrap().unwrap();
    assert_eq!(
        queue.fail("t-1", "HTTP status 503").await.unwrap(),
        Transition::Failed { retry_count: 2 }
    );

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 1);
    assert!(stats.is_drained());

    let stored = queue.get("t-1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.last_error(), Some("HTTP status 503"));

    // terminal tasks ignore further transitions
    assert!(queue.complete("t-1", TaskResult::default()).await.unwrap().is_ignored());
}

#[tokio::test]
async fn test_release_keeps_fifo_position() {
    let queue = memory_queue().await;
    for id in ["a", "b", "c"] {
        queue
            .enqueue(CrawlTask::new(format!("https://example.com/{id}"), 1, 0).with_id(id))
            .await
            .unwrap();
    }

    let first = queue.claim("n1").await.unwrap().unwrap();
    assert_eq!(first.id, "a");
    assert_eq!(queue.release("a").await.unwrap(), Transition::Released);

    let order: Vec<String> = [
        queue.claim("n1").await.unwrap().unwrap().id,
        queue.claim("n1").await.unwrap().unwrap().id,
        queue.claim("n1").await.unwrap().unwrap().id,
    ]
    .into();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(queue.get("a").await.unwrap().unwrap().retry_count, 0);
}

#[tokio::test]
async fn test_duplicate_ids_ignored() {
    let queue = memory_queue().await;
    let task = CrawlTask::new("https://example.com/", 0, 0).with_id("dup");
    assert_eq!(queue.enqueue(task.clone()).await.unwrap(), EnqueueOutcome::Inserted);
    assert_eq!(queue.enqueue(task).await.unwrap(), EnqueueOutcome::Duplicate);
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_completed_feed_in_completion_order() {
    let queue = memory_queue().await;
    for (id, priority) in [("low", 1), ("high", 9)] {
        queue
            .enqueue(CrawlTask::new(format!("https://example.com/{id}"), priority, 0).with_id(id))
            .await
            .unwrap();
    }

    let high = queue.claim("n1").await.unwrap().unwrap();
    let low = queue.claim("n1").await.unwrap().unwrap();
    queue.complete(&low.id, TaskResult::default()).await.unwrap();
    queue.complete(&high.id, TaskResult::default()).await.unwrap();

    let feed = queue.completed_since(0, 10).await.unwrap();
    let ids: Vec<&str> = feed.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["low", "high"]);
    assert_eq!(feed.next_cursor, 2);

    assert_eq!(queue.completed_since(1, 10).await.unwrap().tasks.len(), 1);
    assert!(queue.completed_since(2, 10).await.unwrap().tasks.is_empty());
}
