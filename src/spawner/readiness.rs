//! The TCP-connect readiness probe used by every spawn (§4.6 step 5).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::constants::{READINESS_CONNECT_TIMEOUT, READINESS_RETRY_INTERVAL};
use crate::error::HubError;

/// Polls `ip:port` until it accepts a TCP connection or `timeout` elapses.
pub async fn wait_for_server(ip: &str, port: u16, timeout: Duration) -> Result<(), HubError> {
    let deadline = Instant::now() + timeout;
    let addr = format!("{ip}:{port}");

    loop {
        let attempt = tokio::time::timeout(READINESS_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;
        if let Ok(Ok(_)) = attempt {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(HubError::SpawnFailed(format!(
                "server at {addr} did not become ready within {timeout:?}"
            )));
        }

        tokio::time::sleep(READINESS_RETRY_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn succeeds_once_a_listener_is_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        wait_for_server("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_nothing_is_listening() {
        let result = wait_for_server("127.0.0.1", 1, Duration::from_millis(600)).await;
        assert!(result.is_err());
    }
}
