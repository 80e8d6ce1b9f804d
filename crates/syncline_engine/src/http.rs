//! HTTP transport implementation.
//!
//! This module provides an HTTP-based channel for the sync worker.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, ureq, etc.).

use crate::error::{SyncError, SyncResult};
use crate::transport::RemoteChannel;
use parking_lot::RwLock;
use syncline_protocol::{decode_reply, encode_request, BatchReply, OutgoingMessage};

/// Path of the batch endpoint, relative to the base URL.
pub const BATCH_ENDPOINT: &str = "/sync/batch";

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. The client
/// is responsible for honouring its own socket timeouts; the worker
/// additionally bounds every exchange with the dispatch timeout.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based remote channel.
///
/// Uses CBOR encoding for request/response bodies.
pub struct HttpChannel<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpChannel<C> {
    /// Creates a new HTTP channel.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn record(&self, error: Option<String>) {
        *self.last_error.write() = error;
    }
}

impl<C: HttpClient> RemoteChannel for HttpChannel<C> {
    fn send(&self, batch: &[OutgoingMessage]) -> SyncResult<BatchReply> {
        if !self.client.is_healthy() {
            return Err(SyncError::transport_retryable("http client unhealthy"));
        }

        let body = encode_request(batch)?;
        let url = format!("{}{}", self.base_url, BATCH_ENDPOINT);
        let response = self.client.post(&url, body).map_err(|e| {
            self.record(Some(e.clone()));
            SyncError::transport_retryable(e)
        })?;

        let reply = decode_reply(&response).map_err(|e| {
            self.record(Some(e.to_string()));
            SyncError::Protocol(e)
        })?;

        self.record(None);
        Ok(reply)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use syncline_protocol::{encode_reply, EntityType, ResponseMessage};

    const TASK: EntityType = EntityType::new(1);

    struct TestClient {
        response: RwLock<Option<Vec<u8>>>,
        healthy: AtomicBool,
        last_url: RwLock<Option<String>>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: RwLock::new(None),
                healthy: AtomicBool::new(true),
                last_url: RwLock::new(None),
            }
        }
    }

    impl HttpClient for &TestClient {
        fn post(&self, url: &str, _body: Vec<u8>) -> Result<Vec<u8>, String> {
            *self.last_url.write() = Some(url.to_string());
            self.response
                .read()
                .clone()
                .ok_or_else(|| "connection refused".into())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn brief() -> Vec<OutgoingMessage> {
        vec![OutgoingMessage::BriefMe {
            entity_type: TASK,
            last_synced: 0,
        }]
    }

    #[test]
    fn posts_to_batch_endpoint() {
        let client = TestClient::new();
        let reply = BatchReply::complete(vec![ResponseMessage::Watermark {
            entity_type: TASK,
            timestamp: 9,
        }]);
        *client.response.write() = Some(encode_reply(&reply).unwrap());

        let channel = HttpChannel::new("https://sync.example.com", &client);
        assert_eq!(channel.send(&brief()).unwrap(), reply);
        assert_eq!(
            client.last_url.read().as_deref(),
            Some("https://sync.example.com/sync/batch")
        );
        assert!(channel.last_error().is_none());
    }

    #[test]
    fn network_failure_is_transport_error() {
        let client = TestClient::new();
        let channel = HttpChannel::new("https://sync.example.com", &client);
        let err = channel.send(&brief()).unwrap_err();
        assert!(err.is_transport());
        assert!(err.is_retryable());
        assert_eq!(channel.last_error().as_deref(), Some("connection refused"));
    }

    #[test]
    fn malformed_reply_is_transport_error() {
        let client = TestClient::new();
        *client.response.write() = Some(vec![0xde, 0xad]);
        let channel = HttpChannel::new("https://sync.example.com", &client);
        let err = channel.send(&brief()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn unhealthy_client_is_not_called() {
        let client = TestClient::new();
        client.healthy.store(false, Ordering::SeqCst);
        let channel = HttpChannel::new("https://sync.example.com", &client);
        assert!(channel.send(&brief()).unwrap_err().is_transport());
        assert!(client.last_url.read().is_none());
    }
}
