//! Bounded capability calls.
//!
//! Every call into the robot capability layer is wrapped in a timeout so a
//! hung transport can never stall a periodic task or hold the session lock
//! indefinitely.  An elapsed timeout is reported as [`BridgeError::Timeout`].

use std::future::Future;
use std::time::Duration;

use legbridge_types::BridgeError;

/// Await `call`, giving up after `timeout`.
///
/// # Errors
///
/// The call's own error, or [`BridgeError::Timeout`] naming `operation`.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout {
            operation: operation.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let err = bounded("stand", Duration::from_millis(500), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<(), BridgeError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Timeout {
                operation: "stand".into(),
                timeout_ms: 500
            }
        );
    }

    #[tokio::test]
    async fn fast_call_passes_result_through() {
        let value = bounded("get_status", Duration::from_millis(500), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded("sit", Duration::from_millis(500), async {
            Err::<(), _>(BridgeError::NotConnected)
        })
        .await
        .unwrap_err();
        assert_eq!(err, BridgeError::NotConnected);
    }
}
