//! Firing the asynchronous trigger that starts a new pass.
//!
//! The processor decides *when* to dispatch; a [`Dispatcher`] decides *how*.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::NonceGate;
use crate::error::QueueError;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Request a new pass for `identifier`. Must not wait for that pass.
    async fn dispatch(&self, identifier: &str) -> Result<(), QueueError>;
}

/// Blanket implementation so `Arc<dyn Dispatcher>` can be used directly.
#[async_trait]
impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    async fn dispatch(&self, identifier: &str) -> Result<(), QueueError> {
        (**self).dispatch(identifier).await
    }
}

/// POSTs to `{base_url}/trigger/{identifier}?nonce=…` from a detached task.
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
    gate: NonceGate,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>, gate: NonceGate, timeout: Duration) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::Dispatch(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate,
        })
    }

    pub fn trigger_url(&self, identifier: &str) -> String {
        format!("{}/trigger/{}", self.base_url, identifier)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, identifier: &str) -> Result<(), QueueError> {
        let url = self.trigger_url(identifier);
        let request = self
            .client
            .post(&url)
            .query(&[("nonce", self.gate.issue(identifier))])
            .build()
            .map_err(|e| QueueError::Dispatch(format!("bad trigger request for {url}: {e}")))?;

        let client = self.client.clone();
        let queue = identifier.to_string();
        tokio::spawn(async move {
            match client.execute(request).await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(queue = %queue, status = %resp.status(), "trigger accepted");
                }
                Ok(resp) => {
                    warn!(queue = %queue, status = %resp.status(), "trigger rejected");
                }
                Err(e) if e.is_timeout() => {
                    // Fire-and-forget: the pass keeps running server-side.
                    debug!(queue = %queue, "trigger request timed out");
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "trigger request failed");
                }
            }
        });
        Ok(())
    }
}

/// Hands the identifier to an in-process runner over a channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, identifier: &str) -> Result<(), QueueError> {
        self.tx
            .send(identifier.to_string())
            .map_err(|_| QueueError::Dispatch("trigger channel closed".into()))
    }
}
