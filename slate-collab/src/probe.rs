//! Picks between the relay stream and snapshot polling at session start.

use std::time::Duration;

/// How the session reaches the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteMode {
    /// Probe the stream once and fall back to polling if it is unreachable.
    #[default]
    Auto,
    Push,
    Polling,
    /// Local broadcast only.
    Offline,
}

/// Whether a WebSocket handshake with `url` completes within `timeout`.
pub async fn probe_stream(url: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((mut ws, _))) => {
            let _ = ws.close(None).await;
            log::info!("Relay stream at {url} is available");
            true
        }
        Ok(Err(e)) => {
            log::info!("Relay stream at {url} unavailable: {e}");
            false
        }
        Err(_) => {
            log::info!("Relay stream probe at {url} timed out after {timeout:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_fails_without_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe_stream(&format!("ws://{addr}"), Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_listener() {
        // Accepts TCP but never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        assert!(!probe_stream(&format!("ws://{addr}"), Duration::from_millis(100)).await);
    }

    #[test]
    fn test_default_mode_is_auto() {
        assert_eq!(RemoteMode::default(), RemoteMode::Auto);
    }
}
