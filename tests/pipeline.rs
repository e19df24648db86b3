// End-to-end tests: agent sender -> HTTP -> collector router -> storage,
// over a real loopback socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use metrics_service::agent::{
    create_all_collectors, DeliveryMode, HttpSender, MetricScheduler, MetricSender,
    SchedulerSettings, SendError,
};
use metrics_service::server::{build_router, AppState, SecurityConfig};
use metrics_service::storage::{MemoryStorage, Storage};
use metrics_service::{Metric, RetryPolicy, Retryer};

const FAST_RETRY: RetryPolicy =
    RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(10));

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_collector(storage: Arc<MemoryStorage>, security: SecurityConfig) -> SocketAddr {
    let state = AppState {
        storage,
        retryer: Retryer::transient(RetryPolicy::default()),
        sync_save: false,
    };
    spawn(build_router(state, security)).await
}

fn key_pair() -> (RsaPrivateKey, RsaPublicKey) {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    (private_key, public_key)
}

#[tokio::test]
async fn signed_encrypted_batch_reaches_storage() {
    let (private_key, public_key) = key_pair();
    let storage = Arc::new(MemoryStorage::new());
    let addr = spawn_collector(
        storage.clone(),
        SecurityConfig {
            hash_key: b"secret".to_vec(),
            private_key: Some(private_key),
        },
    )
    .await;

    let sender = HttpSender::new(&addr.to_string(), "secret", Some(public_key)).unwrap();

    // large enough to need several RSA blocks even after gzip
    let mut batch: Vec<Metric> = (0..200)
        .map(|i| Metric::gauge(format!("Gauge{}", i), i as f64 * 1.5))
        .collect();
    batch.push(Metric::counter("PollCount", 3));
    sender.send_batch(&batch).await.unwrap();
    sender
        .send_batch(&[Metric::counter("PollCount", 2)])
        .await
        .unwrap();

    assert_eq!(storage.get("counter", "PollCount").await.unwrap(), "5");
    assert_eq!(storage.get("gauge", "Gauge199").await.unwrap(), "298.5");
    assert_eq!(storage.get_metrics().await.unwrap().len(), 201);
}

#[tokio::test]
async fn single_metric_updates_use_the_same_pipeline() {
    let (private_key, public_key) = key_pair();
    let storage = Arc::new(MemoryStorage::new());
    let addr = spawn_collector(
        storage.clone(),
        SecurityConfig {
            hash_key: Vec::new(),
            private_key: Some(private_key),
        },
    )
    .await;

    let sender = HttpSender::new(&format!("http://{}", addr), "", Some(public_key)).unwrap();
    sender.send_one(&Metric::gauge("Alloc", 42.0)).await.unwrap();
    sender.send_one(&Metric::gauge("Alloc", 7.25)).await.unwrap();

    assert_eq!(storage.get("gauge", "Alloc").await.unwrap(), "7.25");
}

#[tokio::test]
async fn mismatched_key_is_rejected_without_retry() {
    let storage = Arc::new(MemoryStorage::new());
    let addr = spawn_collector(
        storage.clone(),
        SecurityConfig {
            hash_key: b"secret".to_vec(),
            private_key: None,
        },
    )
    .await;

    let sender = HttpSender::new(&addr.to_string(), "guess", None)
        .unwrap()
        .with_retry_policy(FAST_RETRY);
    let err = sender
        .send_one(&Metric::counter("PollCount", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::Status(reqwest::StatusCode::BAD_REQUEST)));
    assert!(storage.get_metrics().await.unwrap().is_empty());
}

#[tokio::test]
async fn unavailable_server_is_retried_until_it_recovers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/updates",
        post({
            let calls = Arc::clone(&calls);
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let addr = spawn(router).await;

    let sender = HttpSender::new(&addr.to_string(), "", None)
        .unwrap()
        .with_retry_policy(FAST_RETRY);
    sender
        .send_batch(&[Metric::gauge("Alloc", 1.0)])
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_server_error_exhausts_every_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/updates",
        post({
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let addr = spawn(router).await;

    let sender = HttpSender::new(&addr.to_string(), "", None)
        .unwrap()
        .with_retry_policy(FAST_RETRY);
    let err = sender
        .send_batch(&[Metric::gauge("Alloc", 1.0)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SendError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn scheduler_feeds_the_collector() {
    for mode in [DeliveryMode::Batch, DeliveryMode::WorkerPool] {
        let storage = Arc::new(MemoryStorage::new());
        let addr = spawn_collector(
            storage.clone(),
            SecurityConfig {
                hash_key: b"secret".to_vec(),
                private_key: None,
            },
        )
        .await;

        let sender = HttpSender::new(&addr.to_string(), "secret", None).unwrap();
        let scheduler = MetricScheduler::new(
            SchedulerSettings {
                poll_interval: Duration::from_millis(50),
                report_interval: Duration::from_millis(200),
                mode,
                rate_limit: 2,
            },
            create_all_collectors(),
            Arc::new(sender),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            stopper.cancel();
        });
        scheduler.run(cancel).await;

        let polls: i64 = storage
            .get("counter", "PollCount")
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert!(polls > 0, "{:?}: no polls delivered", mode);
        assert!(storage.get("gauge", "RandomValue").await.is_ok());
        assert!(storage.get("gauge", "TotalMemory").await.is_ok());
    }
}
