use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use drift_core::DeviceId;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("no address known for device {0}")]
    UnknownDevice(DeviceId),
    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: u32, actual: usize },
}

/// The peer block request RPC. Returned bytes must hash to the requested
/// hash; verification is the caller's job so that a mismatch can be
/// retried against another peer. `from_temporary` asks the peer to serve
/// from its in-progress temp file.
#[async_trait]
pub trait BlockSource: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        device: &DeviceId,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
        from_temporary: bool,
    ) -> Result<Vec<u8>, RequestError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub request_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            request_concurrency: 32,
        }
    }
}

/// HTTP implementation of [`BlockSource`] with a per-process concurrency
/// cap and a device → base URL table.
pub struct HttpBlockSource {
    http: Client,
    limit: Arc<Semaphore>,
    peers: RwLock<HashMap<DeviceId, Url>>,
}

impl HttpBlockSource {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            limit: Arc::new(Semaphore::new(config.request_concurrency.max(1))),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_peer(&self, device: DeviceId, base: Url) {
        self.peers
            .write()
            .expect("peer table lock poisoned")
            .insert(device, base);
    }

    fn base_for(&self, device: &DeviceId) -> Result<Url, RequestError> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .get(device)
            .cloned()
            .ok_or_else(|| RequestError::UnknownDevice(device.clone()))
    }
}

impl Default for HttpBlockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn request(
        &self,
        device: &DeviceId,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
        from_temporary: bool,
    ) -> Result<Vec<u8>, RequestError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::ConcurrencyClosed)?;

        let mut url = self.base_for(device)?.join("rest/block")?;
        url.query_pairs_mut()
            .append_pair("folder", folder)
            .append_pair("name", name)
            .append_pair("offset", &offset.to_string())
            .append_pair("size", &size.to_string())
            .append_pair("hash", &hex(hash))
            .append_pair("temp", if from_temporary { "1" } else { "0" });

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        if body.len() != size as usize {
            return Err(RequestError::ShortResponse {
                expected: size,
                actual: body.len(),
            });
        }
        Ok(body.to_vec())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn source_for(server: &MockServer) -> (HttpBlockSource, DeviceId) {
        let source = HttpBlockSource::new();
        let device = DeviceId::new("peer-1");
        source.add_peer(device.clone(), Url::parse(&server.uri()).unwrap());
        (source, device)
    }

    #[tokio::test]
    async fn fetches_a_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/block"))
            .and(query_param("folder", "default"))
            .and(query_param("name", "a.txt"))
            .and(query_param("offset", "0"))
            .and(query_param("size", "5"))
            .and(query_param("temp", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let (source, device) = source_for(&server).await;
        let body = source
            .request(&device, "default", "a.txt", 0, 5, &[0xab; 32], false)
            .await
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn flags_temporary_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/block"))
            .and(query_param("temp", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x"))
            .mount(&server)
            .await;

        let (source, device) = source_for(&server).await;
        source
            .request(&device, "default", "a.txt", 0, 1, &[0; 32], true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn short_response_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/block"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"xy"))
            .mount(&server)
            .await;

        let (source, device) = source_for(&server).await;
        let err = source
            .request(&device, "default", "a.txt", 0, 5, &[0; 32], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::ShortResponse {
                expected: 5,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn unknown_device_is_an_error() {
        let source = HttpBlockSource::new();
        let err = source
            .request(&DeviceId::new("nobody"), "default", "a", 0, 1, &[0; 32], false)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::UnknownDevice(_)));
    }

    #[test]
    fn hex_encodes() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
