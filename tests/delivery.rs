use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volley::config::DeliveryConfig;
use volley::delivery::{
    DeliveryEngine, DeliveryOutcome, DeliveryState, DeliveryStatus, DeliveryTarget,
    verify_signature,
};
use volley::http::{HttpResponse, MockHttpClient, ReqwestHttpClient};
use volley::manager::{InMemoryStorage, ReconcileCriteria, Storage};
use volley::request::{RequestId, RequestInput};

const URL: &str = "https://receiver.example.com/webhook";

fn engine(
    storage: Arc<InMemoryStorage>,
    http: Arc<MockHttpClient>,
    max_attempts: u32,
) -> Arc<DeliveryEngine<InMemoryStorage, MockHttpClient>> {
    let config = DeliveryConfig {
        max_attempts,
        retry_delays: vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
        ],
        ..DeliveryConfig::default()
    };
    Arc::new(DeliveryEngine::new(
        storage,
        http,
        config,
        CancellationToken::new(),
    ))
}

async fn completed_request(storage: &InMemoryStorage, target: DeliveryTarget) -> RequestId {
    let pending = storage
        .create_request(RequestInput::new("payload").with_target(target))
        .await
        .unwrap();
    let id = pending.data.id;
    pending
        .start(storage)
        .await
        .unwrap()
        .complete(storage)
        .await
        .unwrap();
    id
}

fn gaps(http: &MockHttpClient) -> Vec<Duration> {
    let calls = http.get_calls();
    calls.windows(2).map(|w| w[1].at - w[0].at).collect()
}

#[test_log::test(tokio::test(start_paused = true))]
async fn server_errors_are_retried_until_success() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 500, 3);
    http.add_statuses(URL, 200, 1);
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;

    let outcome = engine(storage.clone(), http.clone(), 5)
        .deliver(id)
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Sent);

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().status, DeliveryStatus::Sent);
    assert_eq!(request.delivery().attempts, 4);

    let attempts = storage.list_delivery_attempts(id).await.unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![4, 3, 2, 1]);
    assert_eq!(attempts[0].status_code, Some(200));
    assert!(attempts[1..].iter().all(|a| a.status_code == Some(500)));
    assert_eq!(attempts[1].error_message.as_deref(), Some("HTTP 500"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn back_off_follows_schedule_and_repeats_last_delay() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 503, 5);
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;

    let outcome = engine(storage.clone(), http.clone(), 5)
        .deliver(id)
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Failed);

    assert_eq!(
        gaps(&http),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
            Duration::from_secs(15),
        ]
    );

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().status, DeliveryStatus::Failed);
    assert_eq!(request.delivery().attempts, 5);
    assert_eq!(storage.list_delivery_attempts(id).await.unwrap().len(), 5);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn client_errors_are_terminal_without_sleeping() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 404, 1);
    http.add_statuses(URL, 200, 1);
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;

    let started = Instant::now();
    let outcome = engine(storage.clone(), http.clone(), 3)
        .deliver(id)
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::Failed);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(http.call_count(), 1);

    let attempts = storage.list_delivery_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status_code, Some(404));

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().status, DeliveryStatus::Failed);
    assert_eq!(request.delivery().attempts, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn budget_holds_across_repeated_invocations() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 500, 10);
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;
    let engine = engine(storage.clone(), http.clone(), 3);

    assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Failed);
    assert_eq!(http.call_count(), 3);

    // Neither the sweep selection nor direct calls reopen the budget.
    let criteria = ReconcileCriteria {
        max_attempts: 3,
        stalled_before: chrono::Utc::now() + chrono::Duration::hours(1),
        limit: 100,
    };
    for _ in 0..5 {
        assert!(storage.find_reconcilable(&criteria).await.unwrap().is_empty());
        assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Failed);
        assert_eq!(engine.retry(id).await.unwrap(), DeliveryOutcome::Failed);
    }

    assert_eq!(http.call_count(), 3);
    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().attempts, 3);
    assert_eq!(storage.list_delivery_attempts(id).await.unwrap().len(), 3);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn resumed_delivery_continues_numbering_and_schedule() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 500, 1);
    http.add_statuses(URL, 200, 1);
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;
    storage
        .force_delivery_state(
            id,
            DeliveryState {
                status: DeliveryStatus::Failed,
                attempts: 2,
                last_attempt_at: Some(chrono::Utc::now()),
            },
        )
        .unwrap();

    let outcome = engine(storage.clone(), http.clone(), 5)
        .deliver(id)
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Sent);

    // Attempt 3 failed, so the wait before attempt 4 is delay[2].
    assert_eq!(gaps(&http), vec![Duration::from_secs(15)]);
    let numbers: Vec<u32> = storage
        .list_delivery_attempts(id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(numbers, vec![4, 3]);
}

#[test_log::test(tokio::test)]
async fn manual_retry_during_sweep_is_deferred() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;
    storage
        .force_delivery_state(
            id,
            DeliveryState {
                status: DeliveryStatus::Failed,
                attempts: 1,
                last_attempt_at: Some(chrono::Utc::now()),
            },
        )
        .unwrap();

    let trigger = http.add_response_with_trigger(URL, Ok(HttpResponse::new(200, "ok")));
    let engine = engine(storage.clone(), http.clone(), 3);

    let sweep = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deliver(id).await })
    };
    while http.in_flight_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(engine.retry(id).await.unwrap(), DeliveryOutcome::Deferred);
    assert_eq!(http.call_count(), 1);

    trigger.send(()).unwrap();
    assert_eq!(sweep.await.unwrap().unwrap(), DeliveryOutcome::Sent);

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().attempts, 2);
    assert_eq!(storage.list_delivery_attempts(id).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn independent_engines_never_exceed_budget() {
    // Two engines with separate in-process guards, as two processes would have.
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    let id = completed_request(&storage, DeliveryTarget::new(URL)).await;
    storage
        .force_delivery_state(
            id,
            DeliveryState {
                status: DeliveryStatus::Failed,
                attempts: 2,
                last_attempt_at: Some(chrono::Utc::now()),
            },
        )
        .unwrap();

    let trigger = http.add_response_with_trigger(URL, Ok(HttpResponse::new(500, "")));
    http.add_statuses(URL, 200, 1);

    let first = engine(storage.clone(), http.clone(), 3);
    let second = engine(storage.clone(), http.clone(), 3);

    let slow = tokio::spawn(async move { first.deliver(id).await });
    while http.in_flight_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(second.deliver(id).await.unwrap(), DeliveryOutcome::Sent);

    trigger.send(()).unwrap();
    assert_eq!(slow.await.unwrap().unwrap(), DeliveryOutcome::Deferred);

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().attempts, 3);
    assert_eq!(request.delivery().status, DeliveryStatus::Sent);
    assert_eq!(storage.list_delivery_attempts(id).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn receiver_can_verify_signature_of_received_bytes() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_statuses(URL, 200, 1);
    let id = completed_request(&storage, DeliveryTarget::new(URL).with_secret("s3cr3t")).await;

    engine(storage.clone(), http.clone(), 3)
        .deliver(id)
        .await
        .unwrap();

    let call = &http.get_calls()[0];
    let signature = call.signature.as_deref().unwrap();
    verify_signature(&call.body, signature, "s3cr3t").unwrap();
    assert!(verify_signature(&call.body, signature, "other").is_err());

    let mut tampered = call.body.to_vec();
    tampered.push(b' ');
    assert!(verify_signature(&tampered, signature, "s3cr3t").is_err());

    let body: serde_json::Value = serde_json::from_slice(&call.body).unwrap();
    assert_eq!(body["request_id"], serde_json::json!(id));
    assert_eq!(body["status"], "completed");
}

/// Answer every connection with `response`, then close it.
async fn local_receiver(response: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut received = Vec::new();
                let mut chunk = [0u8; 4096];
                while let Ok(n) = socket.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..n]);
                    if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&received[..end]).to_ascii_lowercase();
                        let length = head
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if received.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/webhook")
}

#[test_log::test(tokio::test)]
async fn accepted_delivery_with_broken_body_is_not_resent() {
    let url = local_receiver("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nok").await;
    let storage = Arc::new(InMemoryStorage::new());
    let id = completed_request(&storage, DeliveryTarget::new(url)).await;

    let engine = DeliveryEngine::new(
        storage.clone(),
        Arc::new(ReqwestHttpClient::new()),
        DeliveryConfig {
            max_attempts: 3,
            retry_delays: vec![Duration::from_millis(10)],
            ..DeliveryConfig::default()
        },
        CancellationToken::new(),
    );
    assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Sent);

    let attempts = storage.list_delivery_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status_code, Some(200));
    assert!(
        attempts[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Response body unreadable")
    );

    let request = storage.get_request(id).await.unwrap();
    assert_eq!(request.delivery().status, DeliveryStatus::Sent);
}
