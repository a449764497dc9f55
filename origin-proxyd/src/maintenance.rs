use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::lb::{LbError, LoadBalancer};

/// Periodically drop stale origins and sessions until cancelled.
pub async fn run(lb: Arc<dyn LoadBalancer>, interval_secs: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match lb.prune(&cancel).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("Maintenance removed {} stale entries", removed);
                    }
                    Ok(_) => {}
                    Err(LbError::Cancelled) => break,
                    Err(e) => {
                        tracing::error!("Failed to run maintenance: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    tracing::info!("Maintenance loop shutting down");
}
