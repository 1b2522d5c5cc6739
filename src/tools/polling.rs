use super::ToolError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How many times to ask for an async job's result and how long to wait between asks.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

#[derive(Debug)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
    Failed(String),
}

/// Calls `check` until it reports a result or the attempts run out.
/// The first check happens after one interval.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, mut check: F) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, ToolError>>,
{
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        match check().await? {
            PollStatus::Ready(value) => return Ok(value),
            PollStatus::Failed(reason) => return Err(ToolError::TaskFailed(reason)),
            PollStatus::Pending => {
                debug!("Task still pending after attempt {}/{}", attempt, policy.attempts);
            }
        }
    }
    Err(ToolError::PollExhausted(policy.attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FAST: PollPolicy = PollPolicy::new(3, Duration::ZERO);

    #[tokio::test]
    async fn test_returns_when_ready() {
        let calls = AtomicU32::new(0);
        let value = poll_until(FAST, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n == 2 {
                PollStatus::Ready("https://cdn.example/result.png")
            } else {
                PollStatus::Pending
            })
        })
        .await
        .unwrap();
        assert_eq!(value, "https://cdn.example/result.png");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = poll_until::<(), _, _>(FAST, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(PollStatus::Pending)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::PollExhausted(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_polling() {
        let err = poll_until::<(), _, _>(FAST, || async {
            Ok(PollStatus::Failed("bad image".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::TaskFailed(ref r) if r == "bad image"));
    }
}
