//! Scenario tests for the stream session controller.
//!
//! All collaborators are the in-memory mocks from `crabview::testing`, and
//! tokio's clock is paused so backoff delays elapse instantly but in order.

use std::time::Duration;

use crabview::invariant_ppt::contract_test;
use crabview::testing::MockStack;
use crabview::webrtc::peer::{IceCandidate, PeerConnectionState};
use crabview::webrtc::signaling::SignalingMessage;
use crabview::{
    ConnectionState, ControllerOptions, SessionState, SessionStatus, StreamError,
    StreamSessionController, StreamTarget,
};
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

fn controller(stack: &MockStack) -> StreamSessionController {
    StreamSessionController::new(
        StreamTarget::new("cam-1", "site-1"),
        stack.dependencies(),
        ControllerOptions::default(),
    )
}

async fn wait_for_state(controller: &StreamSessionController, state: SessionState) -> SessionStatus {
    let mut status = controller.subscribe();
    let reached = timeout(Duration::from_secs(120), status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("controller task ended")
        .clone();
    reached
}

/// Let every runnable task drain before continuing.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 50000 typ host", n, n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

async fn connect(stack: &MockStack, controller: &StreamSessionController) {
    assert_ok!(controller.start().await);
    wait_for_state(controller, SessionState::AwaitingOffer).await;
    stack.offer("sess1", "worker-1");
    wait_for_state(controller, SessionState::Negotiating).await;
    stack.negotiators.emit_state(PeerConnectionState::Connected);
    wait_for_state(controller, SessionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn start_negotiate_and_connect() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    assert_eq!(controller.state(), SessionState::Idle);

    connect(&stack, &controller).await;

    let status = controller.status();
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(status.session_id.as_deref(), Some("sess1"));
    assert_eq!(status.connection_state, ConnectionState::Connected);
    assert!(status.stream_active);
    assert_eq!(stack.registry.start_calls(), 1);
    assert!(stack.connector.sent().contains(&SignalingMessage::Answer {
        session_id: "sess1".to_string(),
        sdp: "answer:v=0 offer from worker-1".to_string(),
        to_id: "worker-1".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn start_resolves_once_awaiting_offer() {
    let stack = MockStack::new();
    let controller = controller(&stack);

    controller.start().await.unwrap();
    assert_eq!(controller.state(), SessionState::AwaitingOffer);
    assert_eq!(controller.connection_state(), ConnectionState::Connecting);
    assert!(!controller.stream_active());
}

#[tokio::test(start_paused = true)]
async fn local_candidates_go_to_offering_worker() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.negotiators.emit_local_candidate(candidate(7));
    settle().await;

    let forwarded = stack.connector.sent().into_iter().any(|m| {
        matches!(
            m,
            SignalingMessage::IceCandidate { ref session_id, ref from_id, ref to_id, .. }
                if session_id == "sess1"
                    && from_id.as_deref() == Some(controller.client_id())
                    && to_id.as_deref() == Some("worker-1")
        )
    });
    assert!(forwarded, "local candidate was not relayed to worker-1");
}

#[tokio::test(start_paused = true)]
async fn early_remote_candidates_are_buffered_until_offer() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();

    stack.connector.deliver(SignalingMessage::ice_candidate(
        "sess1",
        candidate(1),
        Some("worker-1".to_string()),
        None,
    ));
    settle().await;
    assert_eq!(controller.state(), SessionState::AwaitingOffer);
    assert!(stack.negotiators.applied_candidates().is_empty());

    stack.offer("sess1", "worker-1");
    wait_for_state(&controller, SessionState::Negotiating).await;
    assert_eq!(stack.negotiators.applied_candidates(), vec![candidate(1)]);
}

#[tokio::test(start_paused = true)]
async fn foreign_session_messages_are_dropped() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();

    stack.offer("sess-someone-else", "worker-9");
    stack.connector.deliver(SignalingMessage::StreamStop {
        session_id: "sess-someone-else".to_string(),
    });
    settle().await;

    assert_eq!(controller.state(), SessionState::AwaitingOffer);
    assert!(stack.negotiators.offers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn peer_failure_retries_with_same_session() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;
    let issued_at = controller.status().session_started_at;
    assert!(issued_at.is_some());

    let failed_at = Instant::now();
    stack.negotiators.emit_state(PeerConnectionState::Failed);

    let status = wait_for_state(&controller, SessionState::Reconnecting).await;
    assert_eq!(status.retry_attempt, 1);
    assert_eq!(status.session_id.as_deref(), Some("sess1"));
    assert!(status.last_error.is_some());
    assert_eq!(stack.counters.live_negotiators(), 0);

    let status = wait_for_state(&controller, SessionState::AwaitingOffer).await;
    let waited = failed_at.elapsed();
    assert!(waited >= Duration::from_secs(1), "retried after {:?}", waited);
    assert!(waited < Duration::from_secs(2), "retried after {:?}", waited);
    assert_eq!(status.session_id.as_deref(), Some("sess1"));
    assert_eq!(status.session_started_at, issued_at);
    assert_eq!(stack.registry.start_calls(), 1);
    assert_eq!(stack.connector.open_calls(), 2);
    assert_eq!(stack.counters.open_transports(), 1);
    assert_eq!(stack.counters.live_negotiators(), 1);

    // A successful reconnect clears the retry budget.
    stack.offer("sess1", "worker-1");
    wait_for_state(&controller, SessionState::Negotiating).await;
    stack.negotiators.emit_state(PeerConnectionState::Connected);
    let status = wait_for_state(&controller, SessionState::Connected).await;
    assert_eq!(status.retry_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_while_reconnecting_cancels_timer() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.negotiators.emit_state(PeerConnectionState::Disconnected);
    wait_for_state(&controller, SessionState::Reconnecting).await;

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(stack.counters.all_released());
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
    // The relay channel outlives the negotiator, so the worker is told.
    assert!(stack.connector.sent().contains(&SignalingMessage::StreamStop {
        session_id: "sess1".to_string(),
    }));

    // Well past the would-be retry: nothing reopens.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(stack.connector.open_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_after_ceiling() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.connector.fail_next_opens(u32::MAX);
    let failed_at = Instant::now();
    stack.negotiators.emit_state(PeerConnectionState::Failed);

    let status = wait_for_state(&controller, SessionState::Error).await;
    // Peer loss plus two refused retries after 1s + 2s of backoff
    let elapsed = failed_at.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "gave up after {:?}", elapsed);
    assert_eq!(
        status.last_error.as_deref(),
        Some(StreamError::RetryExhausted { attempts: 3 }.to_string().as_str())
    );
    assert_eq!(status.session_id, None);
    assert_eq!(stack.connector.open_calls(), 3);
    assert!(stack.counters.all_released());
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(controller.state(), SessionState::Error);
    assert_eq!(stack.connector.open_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_from_error_starts_fresh_session() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.connector.fail_next_opens(u32::MAX);
    stack.negotiators.emit_state(PeerConnectionState::Failed);
    wait_for_state(&controller, SessionState::Error).await;

    stack.connector.fail_next_opens(0);
    controller.reconnect().await.unwrap();

    let status = controller.status();
    assert_eq!(status.state, SessionState::AwaitingOffer);
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(status.session_id.as_deref(), Some("sess2"));
    assert_eq!(stack.registry.start_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_failure_is_not_retried() {
    let stack = MockStack::new();
    stack.registry.fail_starts(true);
    let controller = controller(&stack);

    let result = controller.start().await;
    assert!(matches!(result, Err(StreamError::SessionStart(_))), "{:?}", result);
    assert_eq!(controller.state(), SessionState::Error);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(stack.registry.start_calls(), 1);
    assert_eq!(stack.connector.open_calls(), 0);
    assert_eq!(controller.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn relay_refusal_on_start_ends_the_session() {
    let stack = MockStack::new();
    stack.connector.fail_next_opens(1);
    let controller = controller(&stack);

    let result = controller.start().await;
    assert!(matches!(result, Err(StreamError::SessionStart(_))));
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
    assert!(stack.counters.all_released());
}

#[tokio::test(start_paused = true)]
async fn start_while_active_is_rejected() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();

    let second = controller.start().await;
    assert_eq!(second, Err(StreamError::InvalidState(SessionState::AwaitingOffer)));
    assert_eq!(stack.registry.start_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_requests_new_session() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();
    controller.stop().await;

    controller.start().await.unwrap();
    assert_eq!(controller.status().session_id.as_deref(), Some("sess2"));
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_reuses_session_and_ignores_old_channel() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    controller.reconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::AwaitingOffer);
    assert_eq!(controller.status().session_id.as_deref(), Some("sess1"));
    assert_eq!(stack.registry.start_calls(), 1);
    assert_eq!(stack.connector.link_count(), 2);
    assert_eq!(stack.counters.open_transports(), 1);

    // A frame still in flight on the superseded channel
    stack.connector.deliver_on(
        0,
        SignalingMessage::Offer {
            session_id: "sess1".to_string(),
            sdp: "v=0 stale".to_string(),
            from_id: "worker-1".to_string(),
        },
    );
    settle().await;
    assert_eq!(controller.state(), SessionState::AwaitingOffer);
    assert_eq!(stack.negotiators.offers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_stream_stop_ends_session() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.connector.deliver(SignalingMessage::StreamStop {
        session_id: "sess1".to_string(),
    });
    wait_for_state(&controller, SessionState::Stopped).await;

    let echoed = stack
        .connector
        .sent()
        .into_iter()
        .any(|m| matches!(m, SignalingMessage::StreamStop { .. }));
    assert!(!echoed, "worker-initiated stop must not be echoed back");
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
    assert!(stack.counters.all_released());
}

#[tokio::test(start_paused = true)]
async fn transport_loss_reconnects_with_same_session() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    stack.connector.drop_connection("relay restarted");
    let status = wait_for_state(&controller, SessionState::Reconnecting).await;
    assert!(status.last_error.unwrap_or_default().contains("relay restarted"));

    wait_for_state(&controller, SessionState::AwaitingOffer).await;
    assert_eq!(stack.registry.start_calls(), 1);
    assert_eq!(stack.connector.link_count(), 2);
    assert_eq!(stack.counters.open_transports(), 1);
}

// Real clock: the start time is wall-clock and must precede the slow relay.
#[tokio::test]
async fn session_start_time_is_registry_issuance() {
    let stack = MockStack::new();
    stack.connector.delay_opens(Duration::from_millis(200));
    let controller = controller(&stack);

    let before = chrono::Utc::now();
    assert_ok!(controller.start().await);
    let ready_at = chrono::Utc::now();

    let issued = controller
        .status()
        .session_started_at
        .expect("no session start time");
    assert!(issued >= before);
    let lag = ready_at - issued;
    assert!(
        lag >= chrono::Duration::milliseconds(150),
        "stamped {:?} before the attempt was ready",
        lag
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_offer_triggers_reconnect() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();

    stack.negotiators.reject_offers(true);
    stack.offer("sess1", "worker-1");

    let status = wait_for_state(&controller, SessionState::Reconnecting).await;
    assert_eq!(status.retry_attempt, 1);
    assert_eq!(stack.counters.live_negotiators(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_offer_during_negotiation_is_discarded() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    controller.start().await.unwrap();

    stack.offer("sess1", "worker-1");
    wait_for_state(&controller, SessionState::Negotiating).await;
    stack.offer("sess1", "worker-2");
    settle().await;

    assert_eq!(controller.state(), SessionState::Negotiating);
    assert_eq!(
        stack.negotiators.offers(),
        vec![("worker-1".to_string(), "v=0 offer from worker-1".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_pending_start_cancels_it() {
    let stack = MockStack::new();
    stack.registry.delay_starts(Duration::from_secs(5));
    let controller = controller(&stack);

    let starter = controller.clone();
    let pending = tokio::spawn(async move { starter.start().await });
    settle().await;
    assert_eq!(controller.state(), SessionState::Connecting);

    controller.stop().await;
    assert_eq!(pending.await.unwrap(), Err(StreamError::Cancelled));
    assert_eq!(controller.state(), SessionState::Stopped);

    // The abandoned attempt completes later and its session is ended.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
    assert!(stack.counters.all_released());
}

#[tokio::test(start_paused = true)]
async fn stop_from_any_state_releases_everything() {
    for target in [
        SessionState::Idle,
        SessionState::AwaitingOffer,
        SessionState::Negotiating,
        SessionState::Connected,
        SessionState::Reconnecting,
        SessionState::Error,
    ] {
        let stack = MockStack::new();
        let controller = controller(&stack);

        match target {
            SessionState::Idle => {}
            SessionState::AwaitingOffer => controller.start().await.unwrap(),
            SessionState::Negotiating => {
                controller.start().await.unwrap();
                stack.offer("sess1", "worker-1");
            }
            SessionState::Connected => connect(&stack, &controller).await,
            SessionState::Reconnecting => {
                connect(&stack, &controller).await;
                stack.negotiators.emit_state(PeerConnectionState::Failed);
            }
            SessionState::Error => {
                stack.registry.fail_starts(true);
                let _ = controller.start().await;
            }
            _ => unreachable!(),
        }
        wait_for_state(&controller, target).await;

        controller.stop().await;
        assert_eq!(controller.state(), SessionState::Stopped, "from {}", target);
        assert_eq!(stack.counters.open_transports(), 0, "from {}", target);
        assert_eq!(stack.counters.live_negotiators(), 0, "from {}", target);

        // stop() is idempotent
        controller.stop().await;
        assert_eq!(controller.state(), SessionState::Stopped);
        assert!(stack.registry.stopped().len() <= 1, "from {}", target);
    }
}

#[tokio::test(start_paused = true)]
async fn dropping_last_handle_tears_down() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;

    let observer = controller.subscribe();
    drop(controller);
    settle().await;

    assert_eq!(observer.borrow().state, SessionState::Stopped);
    assert!(stack.counters.all_released());
    assert_eq!(stack.registry.stopped(), vec!["sess1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn independent_cameras_do_not_interfere() {
    let stack = MockStack::new();
    let first = controller(&stack);
    let second = StreamSessionController::new(
        StreamTarget::new("cam-2", "site-1"),
        stack.dependencies(),
        ControllerOptions::default(),
    );

    first.start().await.unwrap();
    second.start().await.unwrap();
    assert_ne!(first.client_id(), second.client_id());
    assert_ne!(first.status().session_id, second.status().session_id);

    first.stop().await;
    assert_eq!(second.state(), SessionState::AwaitingOffer);
    second.stop().await;
    assert!(stack.counters.all_released());
}

#[tokio::test(start_paused = true)]
async fn teardown_invariants_are_checked() {
    let stack = MockStack::new();
    let controller = controller(&stack);
    connect(&stack, &controller).await;
    controller.stop().await;

    contract_test(
        "stream controller lifecycle",
        &[
            "A connect attempt never lands on live resources",
            "Teardown leaves no live session resources",
        ],
    );
}
