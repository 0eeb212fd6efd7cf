//! JSON HTTP client that runs every request through a [`ResilientExecutor`].

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use super::executor::{CallError, ExecutorError, ResilientExecutor};
use super::retry::parse_retry_after;

/// Longest error body kept in a [`CallError::Status`] message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client with retry and circuit breaking.
#[derive(Debug, Clone)]
pub struct ResilientHttpClient {
    client: Client,
    executor: ResilientExecutor,
    request_timeout: Duration,
}

impl ResilientHttpClient {
    /// Create a client whose transport times out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Connection`] if the TLS backend cannot be built.
    pub fn new(executor: ResilientExecutor, request_timeout: Duration) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CallError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, executor, request_timeout))
    }

    /// Wrap an existing `reqwest` client configured with `request_timeout`.
    #[must_use]
    pub const fn with_client(
        client: Client,
        executor: ResilientExecutor,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            executor,
            request_timeout,
        }
    }

    /// Executor guarding this client.
    #[must_use]
    pub const fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// GET `url` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// Returns the executor's error once retries are exhausted, the request is
    /// rejected, or the circuit is open.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ExecutorError> {
        self.executor
            .execute(|| async move {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;
                let response = check_status(response).await?;
                response
                    .json::<T>()
                    .await
                    .map_err(|e| CallError::Decode(e.to_string()))
            })
            .await
    }

    fn transport_error(&self, error: reqwest::Error) -> CallError {
        if error.is_timeout() {
            CallError::Timeout(self.request_timeout)
        } else {
            CallError::Connection(error.to_string())
        }
    }
}

async fn check_status(response: Response) -> Result<Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| message.is_char_boundary(i))
            .unwrap_or(0);
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("unknown").to_string();
    }

    Err(CallError::Status {
        status: status.as_u16(),
        retry_after,
        message,
    })
}
