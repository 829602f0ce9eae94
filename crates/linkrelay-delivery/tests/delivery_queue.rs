//! Ordering, pacing, and failure isolation of the delivery queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use linkrelay_delivery::{DeliveryQueue, QueueConfig, QueueError};
use tokio::time::{Instant, sleep};

// =========================================================================
// Helpers
// =========================================================================

#[derive(Debug, Clone, Copy)]
struct Span {
    id: u32,
    start: Instant,
    end: Instant,
}

type Spans = Arc<Mutex<Vec<Span>>>;

fn timed_task(
    spans: &Spans,
    id: u32,
    work: Duration,
) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, String>> + Send>> + Send + 'static
{
    let spans = Arc::clone(spans);
    move || {
        Box::pin(async move {
            let start = Instant::now();
            sleep(work).await;
            spans.lock().unwrap().push(Span {
                id,
                start,
                end: Instant::now(),
            });
            Ok(id)
        })
    }
}

fn exploding() -> Result<u32, String> {
    panic!("task exploded")
}

// =========================================================================
// Ordering and pacing
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_tasks_run_in_order_with_pacing_between() {
    let queue = DeliveryQueue::spawn(QueueConfig::default());
    let spans: Spans = Arc::default();

    let t1 = queue.enqueue(timed_task(&spans, 1, Duration::from_millis(200)));
    let t2 = queue.enqueue(timed_task(&spans, 2, Duration::from_millis(50)));
    let t3 = queue.enqueue(timed_task(&spans, 3, Duration::from_millis(10)));
    let (r1, r2, r3) = tokio::join!(t3, t1, t2);

    assert_eq!((r1.unwrap(), r2.unwrap(), r3.unwrap()), (3, 1, 2));
    let spans = spans.lock().unwrap().clone();
    let order: Vec<u32> = spans.iter().map(|s| s.id).collect();
    assert_eq!(order, vec![1, 2, 3]);
    for pair in spans.windows(2) {
        assert!(pair[0].end <= pair[1].start);
        assert!(pair[1].start - pair[0].end >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_queue_starts_next_task_without_waiting() {
    let queue = DeliveryQueue::spawn(QueueConfig::default());
    queue
        .enqueue(|| async { Ok::<_, String>(()) })
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;

    let enqueued_at = Instant::now();
    let started_at = queue
        .enqueue(|| async { Ok::<_, String>(Instant::now()) })
        .await
        .unwrap();

    assert!(started_at - enqueued_at < Duration::from_millis(500));
}

// =========================================================================
// Failure isolation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_task_reports_to_caller_and_queue_continues() {
    let queue = DeliveryQueue::spawn(QueueConfig::default());

    let failing = queue.enqueue(|| async { Err::<u32, _>("send rejected".to_string()) });
    let next = queue.enqueue(|| async { Ok::<_, String>(7) });

    let err = failing.await.unwrap_err();
    assert!(matches!(&err, QueueError::Task(msg) if msg == "send rejected"));
    assert_eq!(next.await.unwrap(), 7);

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_does_not_kill_worker() {
    let queue = DeliveryQueue::spawn(QueueConfig::default());

    let boom = queue.enqueue(|| async { exploding() });
    let after = queue.enqueue(|| async { Ok::<_, String>(1) });

    assert!(matches!(boom.await, Err(QueueError::Panicked)));
    assert_eq!(after.await.unwrap(), 1);
}
