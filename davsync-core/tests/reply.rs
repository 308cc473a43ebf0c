use std::time::Duration;

use davsync_core::{DavError, Progress, Reply, ReplyEvent, ReplyMeta};

#[tokio::test]
async fn delivers_progress_before_completion() {
    let (sender, mut reply) = Reply::channel();
    sender.progress(10, 100);
    sender.progress(100, 100);
    sender.finish(Ok(ReplyMeta {
        last_modified: None,
        size: Some(100),
    }));

    let mut seen = Vec::new();
    let outcome = loop {
        match reply.next_event().await.expect("reply still open") {
            ReplyEvent::Progress(progress) => seen.push(progress),
            ReplyEvent::Finished(result) => break result,
        }
    };

    assert_eq!(
        seen,
        vec![
            Progress {
                transferred: 10,
                total: 100
            },
            Progress {
                transferred: 100,
                total: 100
            },
        ]
    );
    assert_eq!(outcome.unwrap().size, Some(100));
    assert!(reply.is_finished());
    assert!(reply.next_event().await.is_none());
}

#[tokio::test]
async fn dropped_sender_reports_disconnect() {
    let (sender, reply) = Reply::channel();
    drop(sender);

    let err = reply.finished().await.unwrap_err();
    assert!(matches!(err, DavError::Disconnected));
}

#[tokio::test]
async fn abort_finishes_reply_even_without_producer_answer() {
    let (sender, reply) = Reply::channel();
    let handle = reply.abort_handle();
    let waiter = tokio::spawn(reply.finished());

    handle.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("reply should finish after abort")
        .unwrap();

    assert!(matches!(result, Err(DavError::Canceled)));
    assert!(sender.is_aborted());
}

#[tokio::test]
async fn abort_is_idempotent() {
    let (sender, reply) = Reply::channel();
    reply.abort();
    reply.abort();
    assert!(reply.is_aborted());
    sender.aborted().await;
}

#[tokio::test]
async fn failed_reply_is_already_finished() {
    let reply = Reply::failed(DavError::status(500, "Internal Server Error"));
    let err = reply.finished().await.unwrap_err();
    assert!(err.is_retryable());
}
