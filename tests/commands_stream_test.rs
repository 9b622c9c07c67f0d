//! Stream command layer, driven with mock collaborators.
//!
//! Every test uses its own camera ids because the command registry is
//! process-wide.

use crabview::commands::stream::{
    get_camera_stream_status, list_camera_streams, open_stream, reconnect_camera_stream,
    register_stream, stop_camera_stream,
};
use crabview::testing::MockStack;
use crabview::{ControllerOptions, SessionState, StreamTarget};

#[tokio::test(start_paused = true)]
async fn test_open_status_and_stop() {
    let stack = MockStack::new();
    let controller = open_stream(
        StreamTarget::new("cmd-cam-1", "site-1"),
        stack.dependencies(),
        ControllerOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(controller.state(), SessionState::AwaitingOffer);

    let status = get_camera_stream_status("cmd-cam-1".to_string())
        .await
        .unwrap()
        .expect("stream should be registered");
    assert_eq!(status.session_id.as_deref(), Some("sess1"));
    assert_eq!(status.client_id, controller.client_id());

    let listed = list_camera_streams().await.unwrap();
    assert!(listed.iter().any(|s| s.target.camera_id == "cmd-cam-1"));

    stop_camera_stream("cmd-cam-1".to_string()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(stack.counters.all_released());
    assert!(get_camera_stream_status("cmd-cam-1".to_string())
        .await
        .unwrap()
        .is_none());

    // Unknown cameras stop cleanly.
    stop_camera_stream("cmd-cam-1".to_string()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_open_while_active_is_refused() {
    let stack = MockStack::new();
    let target = StreamTarget::new("cmd-cam-2", "site-1");
    open_stream(target.clone(), stack.dependencies(), ControllerOptions::default())
        .await
        .unwrap();

    let second = open_stream(target, stack.dependencies(), ControllerOptions::default()).await;
    let err = second.err().expect("duplicate stream must be refused");
    assert!(err.contains("already streaming"), "{}", err);
    assert_eq!(stack.registry.start_calls(), 1);

    stop_camera_stream("cmd-cam-2".to_string()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_stream_is_reused_on_retry() {
    let stack = MockStack::new();
    stack.registry.fail_starts(true);
    let target = StreamTarget::new("cmd-cam-3", "site-1");

    let first = open_stream(target.clone(), stack.dependencies(), ControllerOptions::default()).await;
    assert!(first.is_err());
    let status = get_camera_stream_status("cmd-cam-3".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, SessionState::Error);

    stack.registry.fail_starts(false);
    let controller = open_stream(target, stack.dependencies(), ControllerOptions::default())
        .await
        .unwrap();
    assert_eq!(controller.client_id(), status.client_id);
    assert_eq!(controller.state(), SessionState::AwaitingOffer);

    let reconnected = reconnect_camera_stream("cmd-cam-3".to_string()).await.unwrap();
    assert_eq!(reconnected.state, SessionState::AwaitingOffer);
    assert_eq!(reconnected.retry_attempt, 0);

    stop_camera_stream("cmd-cam-3".to_string()).await.unwrap();
    assert!(stack.counters.all_released());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_registration_creates_once() {
    let stack = MockStack::new();
    let target = StreamTarget::new("cmd-cam-4", "site-1");

    let (a, b) = tokio::join!(
        register_stream(target.clone(), stack.dependencies(), ControllerOptions::default()),
        register_stream(target.clone(), stack.dependencies(), ControllerOptions::default()),
    );
    let (first, first_created) = a.unwrap();
    let (second, second_created) = b.unwrap();
    assert!(first_created ^ second_created, "exactly one caller inserts");
    assert_eq!(first.client_id(), second.client_id());
    assert_eq!(first.state(), SessionState::Idle);

    // A settled controller is handed back, never re-created.
    let (again, created) =
        register_stream(target, stack.dependencies(), ControllerOptions::default())
            .await
            .unwrap();
    assert!(!created);
    assert_eq!(again.client_id(), first.client_id());
    assert_eq!(stack.registry.start_calls(), 0);

    stop_camera_stream("cmd-cam-4".to_string()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_registration_after_failed_start_is_not_fresh() {
    let stack = MockStack::new();
    stack.registry.fail_starts(true);
    let target = StreamTarget::new("cmd-cam-5", "site-1");

    let (controller, created) =
        register_stream(target.clone(), stack.dependencies(), ControllerOptions::default())
            .await
            .unwrap();
    assert!(created);
    assert!(controller.start().await.is_err());

    let (_, created) = register_stream(target, stack.dependencies(), ControllerOptions::default())
        .await
        .unwrap();
    assert!(!created);

    stop_camera_stream("cmd-cam-5".to_string()).await.unwrap();
}

#[tokio::test]
async fn test_reconnect_unknown_camera() {
    let result = reconnect_camera_stream("cmd-cam-missing".to_string()).await;
    assert!(result.is_err());
}
