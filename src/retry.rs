//! Bounded retry with a fixed wait, used for RPC calls to the Request
//! Manager and Job Runner.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Runs `f` up to `tries` times, waiting `wait` between attempts.
///
/// Returns the first `Ok`, or the error of the last attempt. `tries`
/// of zero is treated as one.
pub async fn retry<F, Fut, T, E>(tries: u32, wait: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let tries = tries.max(1);
    let mut last_err = None;
    for attempt in 1..=tries {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!(attempt, tries, "attempt failed: {e}");
                last_err = Some(e);
                if attempt < tries {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
    // tries >= 1, so at least one attempt ran and set last_err
    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_returns_first_ok() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = retry(3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = retry(5, Duration::ZERO, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_tries() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry(3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(res, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_tries_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), String> = retry(0, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
