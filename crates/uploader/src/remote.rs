//! Request execution with status classification, timeout and retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chunkup_protocol::messages::QueryPairs;
use chunkup_protocol::{IdentityQuery, ProtocolError, VerifyResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::UploaderConfig;
use crate::events::{EventBus, UploadEvent};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// How a response status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    PermanentFailure,
    Retryable,
}

/// Timeout, retry budget and status classification for every request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub success_status: Vec<u16>,
    pub fail_status: Vec<u16>,
}

impl RetryPolicy {
    pub fn from_config(config: &UploaderConfig) -> Self {
        Self {
            max_retries: config.max_chunk_retries,
            interval: config.chunk_retry_interval,
            timeout: config.timeout,
            success_status: config.success_status.clone(),
            fail_status: config.fail_status.clone(),
        }
    }

    pub fn classify(&self, status: u16) -> StatusClass {
        if self.success_status.contains(&status) {
            StatusClass::Success
        } else if self.fail_status.contains(&status) {
            StatusClass::PermanentFailure
        } else {
            StatusClass::Retryable
        }
    }
}

/// Failure of one logical request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Cancelled by pause or cancel; never reported as a session failure.
    #[error("request aborted")]
    Aborted,

    #[error("{url} answered {status}: {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },

    #[error("{url} failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        url: String,
        status: Option<u16>,
        attempts: u32,
        reason: String,
    },

    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RequestError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RequestError::Aborted)
    }
}

/// Sends verify, chunk and merge requests through an [`HttpTransport`].
#[derive(Clone)]
pub struct RemoteCoordinator {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    bus: EventBus,
}

impl RemoteCoordinator {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy, bus: EventBus) -> Self {
        Self {
            transport,
            policy,
            bus,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `request` until it succeeds, is rejected, runs out of retries or
    /// `cancel` fires.
    ///
    /// Transport errors and timeouts count as retryable. Every retry is
    /// announced on the bus before the retry delay starts.
    pub async fn execute(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, RequestError> {
        let url = request.display_url();
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RequestError::Aborted),
                r = tokio::time::timeout(self.policy.timeout, self.transport.send(request.clone())) => r,
            };

            let (status, reason) = match outcome {
                Ok(Ok(resp)) => match self.policy.classify(resp.status) {
                    StatusClass::Success => return Ok(resp),
                    StatusClass::PermanentFailure => {
                        return Err(RequestError::Rejected {
                            url,
                            status: resp.status,
                            body: String::from_utf8_lossy(&resp.body).into_owned(),
                        });
                    }
                    StatusClass::Retryable => {
                        (Some(resp.status), format!("unexpected status {}", resp.status))
                    }
                },
                Ok(Err(e)) => (None, e.to_string()),
                Err(_) => (None, format!("timed out after {:?}", self.policy.timeout)),
            };

            if attempt >= self.policy.max_retries {
                return Err(RequestError::Exhausted {
                    url,
                    status,
                    attempts: attempt + 1,
                    reason,
                });
            }
            if cancel.is_cancelled() {
                return Err(RequestError::Aborted);
            }

            attempt += 1;
            warn!(url = %url, ?status, attempt, reason = %reason, "retrying request");
            self.bus.publish(&UploadEvent::Retry {
                status,
                url: url.clone(),
                attempt,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RequestError::Aborted),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }

    /// Asks the server which chunks of `query.identifier` it already has.
    pub async fn verify(
        &self,
        url: &str,
        query: &IdentityQuery,
        cancel: &CancellationToken,
    ) -> Result<VerifyResponse, RequestError> {
        let resp = self
            .execute(HttpRequest::get(url, query.to_query()), cancel)
            .await?;
        let verify = VerifyResponse::parse(&resp.body)?;
        debug!(
            need_upload = verify.need_upload,
            uploaded = verify.uploaded_chunks.len(),
            "verify answered"
        );
        Ok(verify)
    }

    /// Posts one chunk as a raw body.
    pub async fn upload_chunk(
        &self,
        url: &str,
        query: QueryPairs,
        headers: &BTreeMap<String, String>,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), RequestError> {
        let mut request = HttpRequest::post(url, query, payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.execute(request, cancel).await.map(|_| ())
    }

    /// Asks the server to concatenate the stored chunks.
    pub async fn merge(
        &self,
        url: &str,
        query: &IdentityQuery,
        cancel: &CancellationToken,
    ) -> Result<(), RequestError> {
        self.execute(HttpRequest::get(url, query.to_query()), cancel)
            .await
            .map(|_| ())
    }
}
