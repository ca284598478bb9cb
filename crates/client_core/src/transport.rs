use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::protocol::{ClientRequest, ServerEnvelope, ServerReply};
use tokio::{sync::broadcast, time};
use tracing::debug;

/// Duplex connection to the messaging service. Replies and pushed events are
/// already decoded.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: ClientRequest) -> Result<ServerReply>;

    /// At-least-once stream of server events.
    fn subscribe_events(&self) -> broadcast::Receiver<ServerEnvelope>;

    async fn shutdown(&self) {}
}

pub struct MissingTransport {
    events: broadcast::Sender<ServerEnvelope>,
}

impl MissingTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MissingTransport {
    async fn request(&self, _request: ClientRequest) -> Result<ServerReply> {
        Err(anyhow!("transport is unavailable"))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServerEnvelope> {
        self.events.subscribe()
    }
}

/// Sends a request with a per-attempt deadline, retrying transport failures.
/// Server rejections are replies and are never retried.
pub(crate) async fn request_with_retry(
    transport: &dyn Transport,
    request: ClientRequest,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
) -> Result<ServerReply> {
    let name = request.name();
    let mut last_error = anyhow!("{name} was never attempted");
    for attempt in 1..=attempts.max(1) {
        match time::timeout(timeout, transport.request(request.clone())).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(err)) => last_error = err.context(format!("{name} failed")),
            Err(_) => last_error = anyhow!("{name} timed out after {timeout:?}"),
        }
        if attempt < attempts {
            debug!(attempt, request = name, "transport: retrying: {last_error:#}");
            time::sleep(retry_delay).await;
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shared::domain::ChannelId;

    use super::*;

    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn request(&self, _request: ClientRequest) -> Result<ServerReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("connection reset"));
            }
            Ok(ServerReply::Ack)
        }

        fn subscribe_events(&self) -> broadcast::Receiver<ServerEnvelope> {
            broadcast::channel(1).1
        }
    }

    fn leave() -> ClientRequest {
        ClientRequest::LeaveChannel {
            channel_id: ChannelId::new("CH1"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures_up_to_the_limit() {
        let flaky = Flaky {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            hang: false,
        };
        let reply = request_with_retry(
            &flaky,
            leave(),
            Duration::from_secs(1),
            3,
            Duration::from_millis(10),
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(reply, ServerReply::Ack);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_request_times_out() {
        let hung = Flaky {
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            hang: true,
        };
        let err = request_with_retry(
            &hung,
            leave(),
            Duration::from_millis(500),
            1,
            Duration::ZERO,
        )
        .await
        .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_transport_always_fails() {
        assert!(MissingTransport::new().request(leave()).await.is_err());
    }
}
