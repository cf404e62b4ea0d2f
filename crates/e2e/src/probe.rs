//! Reachability check for the application under test

use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

/// Polls a URL until it answers HTTP
#[derive(Debug, Clone)]
pub struct AppProbe {
    attempts: usize,
    interval: Duration,
    request_timeout: Duration,
}

impl Default for AppProbe {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl AppProbe {
    pub fn new(attempts: usize, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
            ..Default::default()
        }
    }

    /// Wait until `url` answers with anything below 500.
    pub async fn wait_until_reachable(&self, url: &url::Url) -> E2eResult<()> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?;

        for attempt in 1..=self.attempts {
            match client.get(url.as_str()).send().await {
                Ok(resp) if !resp.status().is_server_error() => {
                    info!("Application reachable at {}", url);
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Probe of {} returned {}", url, resp.status());
                }
                Err(e) => {
                    if attempt == 1 {
                        info!("Waiting for application at {}...", url);
                    }
                    // Connection refused is expected while the dev server starts
                    if !e.is_connect() {
                        warn!("Probe error: {}", e);
                    }
                }
            }

            if attempt < self.attempts {
                sleep(self.interval).await;
            }
        }

        Err(E2eError::AppUnreachable {
            url: url.to_string(),
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_app_passes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let url = url::Url::parse(&format!("http://{}/", addr)).unwrap();
        AppProbe::new(3, Duration::from_millis(10))
            .wait_until_reachable(&url)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn absent_app_is_reported() {
        // Bind then release a port so nothing is listening on it.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = url::Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();

        let err = AppProbe::new(2, Duration::from_millis(10))
            .wait_until_reachable(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::AppUnreachable { attempts: 2, .. }));
    }
}
