use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::{Backplane, BackplaneEnvelope, BackplaneError, BackplaneResult};

/// Timeout for Redis connection setup
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Envelopes queued while Redis is slow or down; beyond this they are dropped
pub const PUBLISH_QUEUE_CAPACITY: usize = 10_000;

const SUBSCRIBE_QUEUE_CAPACITY: usize = 1024;

/// Redis Pub/Sub backplane on a single topic.
///
/// Publishing only enqueues; a background task drains the queue in order,
/// reconnecting with backoff, so a Redis outage never stalls a socket task.
pub struct RedisBackplane {
    client: redis::Client,
    topic: String,
    publish_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl RedisBackplane {
    /// Create the backplane and start its publisher task
    pub fn start(
        redis_url: &str,
        topic: impl Into<String>,
        cancel: CancellationToken,
    ) -> BackplaneResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BackplaneError::Unavailable(format!("invalid Redis URL: {}", e)))?;
        let topic = topic.into();
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);

        tokio::spawn(run_publisher(
            client.clone(),
            topic.clone(),
            publish_rx,
            cancel.clone(),
        ));

        tracing::info!(%topic, "Redis backplane started");
        Ok(Self {
            client,
            topic,
            publish_tx,
            cancel,
        })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, envelope: BackplaneEnvelope) -> BackplaneResult<()> {
        let payload = serde_json::to_string(&envelope)?;
        self.publish_tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BackplaneError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BackplaneError::Closed,
        })
    }

    async fn subscribe(&self) -> BackplaneResult<mpsc::Receiver<BackplaneEnvelope>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE_CAPACITY);
        tokio::spawn(run_subscriber(
            self.client.clone(),
            self.topic.clone(),
            tx,
            self.cancel.clone(),
        ));
        Ok(rx)
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// Exponential backoff with a little jitter so processes don't reconnect in lockstep
fn backoff_delay(backoff_secs: u64) -> Duration {
    let jitter_ms = rand::rng().random_range(0..=250);
    Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms)
}

fn next_backoff(backoff_secs: u64) -> u64 {
    (backoff_secs * 2).min(MAX_BACKOFF_SECS)
}

/// Sleep for the backoff delay. Returns false if cancelled meanwhile
async fn wait_backoff(cancel: &CancellationToken, backoff_secs: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff_delay(backoff_secs)) => true,
    }
}

async fn run_publisher(
    client: redis::Client,
    topic: String,
    mut publish_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    // A payload whose publish failed is retried first after reconnecting
    let mut pending: Option<String> = None;

    loop {
        let mut conn = match timeout(REDIS_TIMEOUT, client.get_multiplexed_async_connection()).await
        {
            Ok(Ok(conn)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                conn
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, backoff_secs, "Backplane publisher failed to connect");
                if !wait_backoff(&cancel, backoff_secs).await {
                    return;
                }
                backoff_secs = next_backoff(backoff_secs);
                continue;
            }
            Err(_) => {
                tracing::error!(backoff_secs, "Backplane publisher timed out connecting");
                if !wait_backoff(&cancel, backoff_secs).await {
                    return;
                }
                backoff_secs = next_backoff(backoff_secs);
                continue;
            }
        };

        tracing::info!(%topic, "Backplane publisher (re)connected");

        loop {
            let payload = match pending.take() {
                Some(payload) => payload,
                None => {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("Backplane publisher cancelled");
                            return;
                        }
                        next = publish_rx.recv() => next,
                    };
                    match next {
                        Some(payload) => payload,
                        None => {
                            tracing::info!("Backplane publish queue closed, publisher exiting");
                            return;
                        }
                    }
                }
            };

            match conn.publish::<_, _, i64>(&topic, &payload).await {
                Ok(receivers) => {
                    tracing::trace!(receivers, "Envelope published");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Backplane publish failed, reconnecting");
                    pending = Some(payload);
                    break;
                }
            }
        }

        if !wait_backoff(&cancel, backoff_secs).await {
            return;
        }
        backoff_secs = next_backoff(backoff_secs);
    }
}

enum SubscriberExit {
    /// Was subscribed, then the stream ended
    Disconnected,
    ConnectFailed(String),
    /// Nobody is listening anymore
    Closed,
}

async fn run_subscriber(
    client: redis::Client,
    topic: String,
    tx: mpsc::Sender<BackplaneEnvelope>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        let exit = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Backplane subscriber cancelled");
                return;
            }
            exit = subscribe_once(&client, &topic, &tx) => exit,
        };

        match exit {
            SubscriberExit::Closed => return,
            SubscriberExit::Disconnected => {
                tracing::error!("Backplane subscription lost, reconnecting");
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            SubscriberExit::ConnectFailed(e) => {
                tracing::error!(error = %e, backoff_secs, "Backplane subscriber failed to connect");
            }
        }

        if !wait_backoff(&cancel, backoff_secs).await {
            return;
        }
        backoff_secs = next_backoff(backoff_secs);
    }
}

async fn subscribe_once(
    client: &redis::Client,
    topic: &str,
    tx: &mpsc::Sender<BackplaneEnvelope>,
) -> SubscriberExit {
    let mut pubsub = match timeout(REDIS_TIMEOUT, client.get_async_pubsub()).await {
        Ok(Ok(pubsub)) => pubsub,
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => {
            return SubscriberExit::ConnectFailed("timed out opening Pub/Sub connection".into())
        }
    };

    match timeout(REDIS_TIMEOUT, pubsub.subscribe(topic)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => return SubscriberExit::ConnectFailed(format!("timed out subscribing to {}", topic)),
    }

    tracing::info!(%topic, "Backplane subscriber connected");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid backplane payload");
                continue;
            }
        };

        match serde_json::from_str::<BackplaneEnvelope>(&payload) {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    return SubscriberExit::Closed;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode backplane envelope");
            }
        }
    }

    SubscriberExit::Disconnected
}
