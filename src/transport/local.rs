//! In-process broadcast bus
//!
//! Every `LocalTransport` created from the same `LocalBus` sees every message
//! published on a channel it subscribed to, including its own.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};

use super::{Transport, SUBSCRIPTION_BUFFER};
use crate::common::{Error, Result};

#[derive(Debug, Clone)]
struct Envelope {
    channel: String,
    payload: Bytes,
}

/// Shared medium for a set of in-process nodes
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new endpoint to the bus
    pub fn endpoint(&self) -> LocalTransport {
        LocalTransport {
            tx: self.tx.clone(),
            offline: AtomicBool::new(false),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(SUBSCRIPTION_BUFFER)
    }
}

/// One node's attachment to a `LocalBus`
#[derive(Debug)]
pub struct LocalTransport {
    tx: broadcast::Sender<Envelope>,
    offline: AtomicBool,
}

impl LocalTransport {
    /// Make every subsequent broadcast fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn broadcast(&self, channel: &str, payload: Bytes) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("endpoint is offline".into()));
        }
        // no subscribers is not a failure for a best-effort broadcast
        let _ = self.tx.send(Envelope {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>> {
        let mut bus_rx = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(envelope) if envelope.channel == channel => {
                        if tx.send(envelope.payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Local bus subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
