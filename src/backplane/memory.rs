use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{Backplane, BackplaneEnvelope, BackplaneResult};

const BUS_CAPACITY: usize = 1024;

/// In-process bus. Clones share one topic, so several relay instances in the
/// same process behave like separate processes behind a shared backplane.
#[derive(Clone)]
pub struct MemoryBackplane {
    bus: broadcast::Sender<BackplaneEnvelope>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { bus }
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, envelope: BackplaneEnvelope) -> BackplaneResult<()> {
        // No subscribers yet is fine
        let _ = self.bus.send(envelope);
        Ok(())
    }

    async fn subscribe(&self) -> BackplaneResult<mpsc::Receiver<BackplaneEnvelope>> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory backplane subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
