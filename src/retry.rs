use std::future::Future;
use std::time::Duration;

/// Bounded polling policy: at most `max_attempts` checks, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub interval: Duration,
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, interval: Duration) -> Self {
		Self { max_attempts, interval }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted {
	pub attempts: u32,
}

/// Runs `check` until it yields `Some`, sleeping `policy.interval` between
/// attempts. No sleep happens after the final attempt.
pub async fn retry_until<T, F, Fut>(policy: RetryPolicy, mut check: F) -> Result<T, RetryExhausted>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Option<T>>,
{
	let attempts = policy.max_attempts.max(1);
	for attempt in 1..=attempts {
		if let Some(value) = check(attempt).await {
			return Ok(value);
		}
		if attempt < attempts {
			tokio::time::sleep(policy.interval).await;
		}
	}
	Err(RetryExhausted { attempts })
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn test_retry_until_succeeds_on_third_attempt() {
		let calls = AtomicU32::new(0);
		let policy = RetryPolicy::new(5, Duration::from_millis(1));
		let out = retry_until(policy, |attempt| {
			calls.fetch_add(1, Ordering::SeqCst);
			async move { (attempt == 3).then_some(attempt) }
		})
		.await;
		assert_eq!(out, Ok(3));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_retry_until_reports_exhaustion() {
		let policy = RetryPolicy::new(4, Duration::from_millis(1));
		let out: Result<(), _> = retry_until(policy, |_| async { None }).await;
		assert_eq!(out, Err(RetryExhausted { attempts: 4 }));
	}

	#[tokio::test]
	async fn test_zero_attempts_still_checks_once() {
		let policy = RetryPolicy::new(0, Duration::from_millis(1));
		let out = retry_until(policy, |_| async { Some(7) }).await;
		assert_eq!(out, Ok(7));
	}
}
