//! HTTPS relay transport: store-and-forward through relay servers.
//!
//! The most firewall-friendly path: plain `PUT`/`GET` requests on port 443
//! that pass through corporate proxies. Relays are tried in configured order.

use std::time::Duration;

use crate::{ProxySettings, TransferMetadata, TransportConfig, TransportEndpoint, TransportError};

const NAME: &str = "https-relay";

/// Header carrying the file name of a relayed transfer.
pub const HEADER_FILE_NAME: &str = "x-sluice-file-name";
/// Header carrying the caller-computed checksum.
pub const HEADER_CHECKSUM: &str = "x-sluice-checksum";
/// Header carrying `index/total` for chunked transfers.
pub const HEADER_CHUNK: &str = "x-sluice-chunk";

/// Transport that relays payloads through HTTPS servers.
pub struct HttpsRelayEndpoint {
    client: Option<reqwest::Client>,
    relays: Vec<String>,
    timeout: Duration,
    max_payload_size: usize,
    priority: i32,
}

impl HttpsRelayEndpoint {
    pub fn new() -> Self {
        Self {
            client: None,
            relays: Vec::new(),
            timeout: TransportConfig::default().timeout,
            max_payload_size: TransportConfig::default().max_payload_size,
            priority: 60,
        }
    }

    /// Override the static priority (default: 60).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn client(&self) -> Result<&reqwest::Client, TransportError> {
        let client = self.client.as_ref().ok_or_else(|| TransportError::NotConfigured {
            endpoint: NAME.into(),
            reason: "setup has not run".into(),
        })?;
        if self.relays.is_empty() {
            return Err(TransportError::NotConfigured {
                endpoint: NAME.into(),
                reason: "no relay servers".into(),
            });
        }
        Ok(client)
    }

    fn map_send_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::timeout(NAME, self.timeout)
        } else {
            TransportError::request(NAME, &err)
        }
    }
}

impl Default for HttpsRelayEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// `{relay}/transfers/{id}` with exactly one slash between the parts.
pub fn transfer_url(relay: &str, transfer_id: &str) -> String {
    format!("{}/transfers/{}", relay.trim_end_matches('/'), transfer_id)
}

fn build_client(
    timeout: Duration,
    proxy: Option<&ProxySettings>,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)));

    if let Some(settings) = proxy {
        let mut proxy = reqwest::Proxy::all(&settings.url)
            .map_err(|e| TransportError::Config(format!("proxy {}: {e}", settings.url)))?;
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| TransportError::Config(format!("http client: {e}")))
}

async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("");
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    let body = if body.is_empty() {
        reason.to_string()
    } else {
        format!("{reason} {}", body.chars().take(200).collect::<String>())
    };
    TransportError::HttpStatus {
        endpoint: NAME.into(),
        status: status.as_u16(),
        body: body.trim().to_string(),
    }
}

#[async_trait::async_trait]
impl TransportEndpoint for HttpsRelayEndpoint {
    async fn setup(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        self.client = Some(build_client(config.timeout, config.proxy.as_ref())?);
        self.relays = config.relay_servers.clone();
        self.timeout = config.timeout;
        self.max_payload_size = config.max_payload_size;
        Ok(())
    }

    async fn send(&self, payload: &[u8], meta: &TransferMetadata) -> Result<(), TransportError> {
        let client = self.client()?;
        let mut last_err = None;

        for relay in &self.relays {
            let url = transfer_url(relay, &meta.transfer_id);
            let mut request = client
                .put(&url)
                .header(HEADER_FILE_NAME, meta.file_name.as_str())
                .header(HEADER_CHECKSUM, meta.checksum.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(payload.to_vec());
            if let (Some(index), Some(total)) = (meta.chunk_index, meta.total_chunks) {
                request = request.header(HEADER_CHUNK, format!("{index}/{total}"));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("https-relay: stored {} via {relay}", meta.transfer_id);
                    return Ok(());
                }
                Ok(response) => {
                    let err = status_error(response).await;
                    tracing::warn!("https-relay: {relay} rejected upload: {err}");
                    last_err = Some(err);
                }
                Err(e) => {
                    let err = self.map_send_error(e);
                    tracing::warn!("https-relay: {relay} unreachable: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::Other("no relay attempted".into())))
    }

    async fn receive(&self, meta: &TransferMetadata) -> Result<Vec<u8>, TransportError> {
        let client = self.client()?;
        let mut last_err = None;

        for relay in &self.relays {
            let url = transfer_url(relay, &meta.transfer_id);
            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = self.map_send_error(e);
                    tracing::warn!("https-relay: {relay} unreachable: {err}");
                    last_err = Some(err);
                    continue;
                }
            };
            if !response.status().is_success() {
                let err = status_error(response).await;
                tracing::warn!("https-relay: {relay} refused download: {err}");
                last_err = Some(err);
                continue;
            }
            if let Some(len) = response.content_length() {
                if len as usize > self.max_payload_size {
                    return Err(TransportError::MessageTooLarge {
                        size: len as usize,
                        max: self.max_payload_size,
                    });
                }
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::request(NAME, &e))?;
            if body.len() > self.max_payload_size {
                return Err(TransportError::MessageTooLarge {
                    size: body.len(),
                    max: self.max_payload_size,
                });
            }
            return Ok(body.to_vec());
        }

        Err(last_err.unwrap_or_else(|| TransportError::Other("no relay attempted".into())))
    }

    async fn is_available(&self) -> bool {
        let Ok(client) = self.client() else {
            return false;
        };
        for relay in &self.relays {
            // Any HTTP answer means the relay is reachable through the network.
            if client.head(relay.as_str()).send().await.is_ok() {
                return true;
            }
        }
        false
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
