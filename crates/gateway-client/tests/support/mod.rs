#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use gateway_client::{
    GatewayClient, GatewayConfig, KeyValueStorage, MemoryStorage, StreamConfig, UserProfile,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

pub type Calls = Arc<Mutex<Vec<String>>>;

pub struct Stub {
    pub base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Stub {
    pub async fn spawn(app: Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            shutdown: Some(shutdown_tx),
        })
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn record_call(calls: &Calls, name: &str) {
    calls.lock().await.push(name.to_string());
}

pub async fn call_count(calls: &Calls, name: &str) -> usize {
    calls
        .lock()
        .await
        .iter()
        .filter(|call| call.as_str() == name)
        .count()
}

pub fn fast_config(base_url: &str) -> Result<GatewayConfig> {
    Ok(GatewayConfig::new(base_url)?
        .with_retry_backoff(Duration::from_millis(10))
        .with_stream(StreamConfig {
            frame_interval: Duration::from_millis(1),
            reveal_duration: Duration::from_millis(5),
        }))
}

pub struct TestClient {
    pub client: GatewayClient,
    pub durable: Arc<MemoryStorage>,
    pub ephemeral: Arc<MemoryStorage>,
}

pub fn test_client(base_url: &str) -> Result<TestClient> {
    let durable = Arc::new(MemoryStorage::new());
    let ephemeral = Arc::new(MemoryStorage::new());
    let client = GatewayClient::with_storage(
        fast_config(base_url)?,
        durable.clone() as Arc<dyn KeyValueStorage>,
        ephemeral.clone() as Arc<dyn KeyValueStorage>,
    )?;
    Ok(TestClient {
        client,
        durable,
        ephemeral,
    })
}

pub fn profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        name: format!("User {id}"),
        daily_quota: 100,
        ..UserProfile::default()
    }
}
