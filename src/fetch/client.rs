use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use url::Url;

use crate::error::{GclError, Result};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECONDS: u64 = 2;

/// HTTP client used to download remote and template includes.
pub struct RemoteClient {
    client: Client,
    retry_delay: Duration,
}

impl RemoteClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gitlab-ci-local/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GclError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry_delay: Duration::from_secs(RETRY_DELAY_SECONDS),
        })
    }

    /// Overrides the pause between retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Downloads `url`, retrying on network errors, rate limits and server errors.
    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let mut retry_count = 0;
        loop {
            let response = match self.client.get(url.clone()).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({e}), retrying in {}s ({}/{MAX_RETRIES})...",
                        self.retry_delay.as_secs(),
                        retry_count + 1,
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if (status == 429 || status.is_server_error()) && retry_count < MAX_RETRIES {
                warn!(
                    "{url} answered {status}. Waiting {}s before retry {}/{MAX_RETRIES}...",
                    self.retry_delay.as_secs(),
                    retry_count + 1,
                );
                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                return Err(GclError::RemoteInclude {
                    url: url.to_string(),
                    reason: format!("status {status}"),
                });
            }

            let body = response.bytes().await?;
            debug!("Downloaded {} bytes from {url}", body.len());
            return Ok(body.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ci/templates/build.yml")
            .with_status(200)
            .with_body("build:\n  script: [make]\n")
            .create_async()
            .await;

        let client = RemoteClient::new().unwrap();
        let url = Url::parse(&format!("{}/ci/templates/build.yml", server.url())).unwrap();
        let body = client.fetch(&url).await.unwrap();

        assert_eq!(body, b"build:\n  script: [make]\n");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.yml")
            .with_status(404)
            .create_async()
            .await;

        let client = RemoteClient::new().unwrap();
        let url = Url::parse(&format!("{}/missing.yml", server.url())).unwrap();
        let err = client.fetch(&url).await.unwrap_err();

        assert!(matches!(err, GclError::RemoteInclude { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky.yml")
            .with_status(503)
            .expect((MAX_RETRIES + 1) as usize)
            .create_async()
            .await;

        let client = RemoteClient::new()
            .unwrap()
            .with_retry_delay(Duration::ZERO);
        let url = Url::parse(&format!("{}/flaky.yml", server.url())).unwrap();

        assert!(client.fetch(&url).await.is_err());
        mock.assert_async().await;
    }
}
