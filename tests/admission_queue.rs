use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ditto_credits::{AdmissionQueue, QueueStatus};
use tokio::sync::{mpsc, oneshot};

#[tokio::test]
async fn waiting_tasks_start_in_submission_order() {
    let queue = AdmissionQueue::new(1);
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();

    let mut releases = Vec::new();
    let mut handles = Vec::new();
    for id in 1..=5 {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let started = started_tx.clone();
        releases.push(release_tx);
        handles.push(queue.submit(move || async move {
            let _ = started.send(id);
            let _ = release_rx.await;
            id
        }));
    }

    assert_eq!(started_rx.recv().await, Some(1));
    assert_eq!(
        queue.status(),
        QueueStatus {
            active_count: 1,
            queued_count: 4,
            max_concurrent: 1,
        }
    );

    let mut releases = releases.into_iter();
    for expected in 2..=5 {
        releases
            .next()
            .expect("release handle")
            .send(())
            .expect("task still waiting");
        assert_eq!(started_rx.recv().await, Some(expected));
        assert_eq!(queue.status().active_count, 1);
        assert_eq!(queue.status().queued_count, 5 - expected);
    }
    releases
        .next()
        .expect("last release handle")
        .send(())
        .expect("last task still waiting");

    for (idx, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(idx + 1));
    }
    assert_eq!(queue.status().active_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_count_never_exceeds_the_cap() {
    let queue = AdmissionQueue::new(3);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let running = running.clone();
        let peak = peak.clone();
        handles.push(queue.submit(move || async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    let status = queue.status();
    assert_eq!(status.active_count, 3);
    assert_eq!(status.queued_count, 7);

    for handle in handles {
        assert!(queue.status().active_count <= 3);
        handle.await.expect("task");
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(queue.status().active_count, 0);
    assert_eq!(queue.status().queued_count, 0);
}

#[tokio::test]
async fn dropped_handles_do_not_cancel_tasks() {
    let queue = AdmissionQueue::new(1);
    let (done_tx, done_rx) = oneshot::channel::<&'static str>();

    drop(queue.submit(move || async move {
        let _ = done_tx.send("ran");
    }));

    assert_eq!(done_rx.await, Ok("ran"));
}
