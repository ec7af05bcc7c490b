use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Periodically runs a heartbeat action until it reports that nobody is
/// listening any more or shutdown is requested.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run the sender. `beat` returns false once its receiver is gone.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut beat: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !beat().await {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stops_when_beat_returns_false() {
        let count = Arc::new(AtomicUsize::new(0));
        let sender = HeartbeatSender::new(Duration::from_millis(5));

        let c = count.clone();
        sender
            .run(CancellationToken::new(), move || {
                let c = c.clone();
                async move { c.fetch_add(1, Ordering::SeqCst) < 2 }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let token = CancellationToken::new();
        token.cancel();
        let sender = HeartbeatSender::new(Duration::from_secs(60));
        // Would block for a minute if cancellation were ignored after the first tick.
        tokio::time::timeout(
            Duration::from_secs(5),
            sender.run(token, || async { true }),
        )
        .await
        .expect("sender should stop on shutdown");
    }
}
