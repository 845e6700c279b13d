//! Backoff-driven reconnection for the event channel.
//!
//! When the WebSocket drops unexpectedly the session calls [`reconnect`]
//! with a bounded attempt count. Each attempt waits first, so the server
//! gets a moment to come back, and every wait respects the session's
//! [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ComfyError;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Attempts before giving up. Zero disables reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 1,
        }
    }
}

/// Calculate the next backoff delay, clamped to `max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Retry `connect` with backoff.
///
/// Returns `Some` once an attempt succeeds, or `None` when the attempts
/// are exhausted or `cancel` fires.
pub async fn reconnect<T, F, Fut>(
    mut connect: F,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ComfyError>>,
{
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        tracing::info!(
            attempt,
            max_attempts = config.max_attempts,
            "Reconnecting to ComfyUI event channel",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reconnect cancelled");
                return None;
            }
            result = connect() => match result {
                Ok(conn) => {
                    tracing::info!(attempt, "Reconnected to ComfyUI");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn next_delay_doubles_and_clamps() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(
            next_delay(Duration::from_secs(1), &config),
            Duration::from_secs(2)
        );
        assert_eq!(
            next_delay(Duration::from_secs(8), &config),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = ReconnectConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Option<()> = reconnect(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ComfyError::ConnectionLost("refused".into())) }
            },
            &config,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = reconnect(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ComfyError::ConnectionLost("refused".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            &ReconnectConfig {
                max_attempts: 5,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Some(1));
    }

    #[tokio::test]
    async fn cancellation_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<()> = reconnect(
            || async { Ok(()) },
            &ReconnectConfig::default(),
            &cancel,
        )
        .await;
        assert!(result.is_none());
    }
}
