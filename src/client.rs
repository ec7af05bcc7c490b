use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ErrorBody, SubmitRequest};
use crate::descriptor::JobSpec;
use crate::scheduler::{JobStatus, Submission, WorkerAdvertisement, WorkerInfo};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    /// The server could not be reached or the exchange broke off.
    #[error("Server unavailable: {0}")]
    Unavailable(String),

    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// True when the request itself was rejected, as opposed to the backend
    /// being down or overloaded.
    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if (400..500).contains(status))
    }
}

/// Minimal HTTP/1 JSON client for the scheduler API.
///
/// Each call opens its own connection; CLI invocations make one or two
/// requests so pooling buys nothing.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// `host:port` of the server.
    authority: String,
    timeout: Duration,
}

impl ApiClient {
    /// Accepts `host:port` with or without an `http://` prefix.
    pub fn new(addr: &str) -> Self {
        let authority = addr
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self {
            authority,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub async fn submit(&self, jobs: Vec<JobSpec>) -> Result<Submission, ClientError> {
        let body = SubmitRequest { jobs };
        self.call(Method::POST, "/api/jobs", Some(&body)).await
    }

    pub async fn status(&self, id: Uuid) -> Result<JobStatus, ClientError> {
        self.call::<(), _>(Method::GET, &format!("/api/jobs/{}", id), None)
            .await
    }

    pub async fn list(&self) -> Result<Vec<JobStatus>, ClientError> {
        self.call::<(), _>(Method::GET, "/api/jobs", None).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<JobStatus, ClientError> {
        self.call::<(), _>(Method::POST, &format!("/api/jobs/{}/cancel", id), None)
            .await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, ClientError> {
        self.call::<(), _>(Method::GET, "/api/workers", None).await
    }

    pub async fn heartbeat(&self, advertisement: &WorkerAdvertisement) -> Result<(), ClientError> {
        self.send(Method::POST, "/api/workers/heartbeat", Some(advertisement))
            .await
            .map(|_| ())
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let bytes = self.send(method, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes, ClientError> {
        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.authority)
                .await
                .map_err(|e| ClientError::Unavailable(format!("{}: {}", self.authority, e)))?;

            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ClientError::Unavailable(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "API connection closed with error");
                }
            });

            let request = Request::builder()
                .method(method)
                .uri(path)
                .header("host", &self.authority)
                .header("content-type", "application/json")
                .header("user-agent", concat!("condor-lite/", env!("CARGO_PKG_VERSION")))
                .body(Full::new(payload))
                .map_err(|e| ClientError::Unavailable(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ClientError::Unavailable(e.to_string()))?;

            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Unavailable(e.to_string()))?
                .to_bytes();
            Ok::<_, ClientError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Unavailable(format!("{}: request timed out", self.authority)))??;

        if status.is_success() {
            return Ok(bytes);
        }
        Err(api_error(status, &bytes))
    }
}

fn api_error(status: StatusCode, bytes: &[u8]) -> ClientError {
    let message = match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => body.error,
        Err(_) => String::from_utf8_lossy(bytes).trim().to_string(),
    };
    ClientError::Api {
        status: status.as_u16(),
        message,
    }
}
