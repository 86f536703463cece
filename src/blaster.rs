//! Outbox fan-out: republish every accepted outbox event to a static list of
//! external relays so the owner's posts propagate beyond this server.
//!
//! Fan-out is fed through a queue so the client's EVENT round trip never
//! waits on upstream publishes. One consumer task drains the queue, which
//! keeps per-target delivery in arrival order. There is no persistent queue;
//! events lost mid-flight remain in the outbox store and can be re-blasted.

use std::time::Duration;

use nostr::Event;
use nostr_sdk::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cap on a single publish to a single target.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-lived publisher over a pooled set of relay connections.
pub struct Blaster {
    targets: Vec<String>,
    client: Client,
}

impl Blaster {
    /// Build the connection pool for the blast targets. Dials are lazy and
    /// re-attempted by the pool, so unreachable targets only cost a warning
    /// per publish.
    pub async fn new(targets: Vec<String>) -> Self {
        let client = Client::default();
        for url in &targets {
            if let Err(e) = client.add_relay(url.clone()).await {
                warn!("adding blast target {url} failed: {e}");
            }
        }
        if !targets.is_empty() {
            client.connect().await;
        }
        Self { targets, client }
    }

    /// Spawn the consumer task and hand back the job queue.
    pub fn spawn(self, shutdown: CancellationToken) -> mpsc::UnboundedSender<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx, shutdown));
        tx
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Event>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                ev = rx.recv() => match ev {
                    Some(ev) => self.blast(&ev).await,
                    None => return,
                },
            }
        }
    }

    /// Publish one event to every target; per-target failures are logged and
    /// do not affect the rest.
    pub async fn blast(&self, event: &Event) {
        for url in &self.targets {
            match tokio::time::timeout(
                PUBLISH_TIMEOUT,
                self.client.send_event_to([url.clone()], event),
            )
            .await
            {
                Ok(Ok(_)) => debug!("published {} to {url}", event.id),
                Ok(Err(e)) => warn!("publishing {} to {url} failed: {e}", event.id),
                Err(_) => warn!("publishing {} to {url} timed out", event.id),
            }
        }
        info!("blasted {} to {} relays", event.id, self.targets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys};

    #[tokio::test]
    async fn queue_survives_empty_target_list() {
        let blaster = Blaster::new(vec![]).await;
        let shutdown = CancellationToken::new();
        let tx = blaster.spawn(shutdown.clone());
        let ev = EventBuilder::text_note("fan out")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        tx.send(ev).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unreachable_target_does_not_error() {
        let blaster = Blaster::new(vec!["ws://127.0.0.1:1".into()]).await;
        let ev = EventBuilder::text_note("nobody home")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        // Must return (within the per-target timeout) rather than fail.
        blaster.blast(&ev).await;
    }
}
