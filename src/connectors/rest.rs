use std::time::Duration;

use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::schema::ExchangeId;

/// Shared REST helper for connector bootstrap endpoints.
///
/// Wraps a reqwest client with:
/// - A hard per-request deadline (propagated shutdown semantics:
///   nothing outlives the timeout, there are no detached retries)
/// - Uniform mapping of HTTP failures onto the error taxonomy,
///   including 429 with its Retry-After header
pub struct RestClient {
    exchange: ExchangeId,
    http: reqwest::Client,
    timeout: Duration,
}

impl RestClient {
    pub fn new(exchange: ExchangeId) -> Self {
        static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

        Self {
            exchange,
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_secs(10),
        }
    }

    /// GET `url` and parse the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = tokio::time::timeout(self.timeout, self.http.get(url).send())
            .await
            .map_err(|_| IngestError::transport(self.exchange, format!("timeout on {url}")))?
            .map_err(|e| IngestError::transport(self.exchange, e))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(IngestError::RateLimited {
                exchange: self.exchange,
                retry_after,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::transport(
                self.exchange,
                format!("{url} returned {status}: {body:.200}"),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| IngestError::protocol(self.exchange, e))
    }

    /// POST with an empty body, parsing the response as JSON. Used by
    /// venues whose WS endpoint is handed out via a token request.
    pub async fn post_json(&self, url: &str) -> Result<Value> {
        let response = tokio::time::timeout(self.timeout, self.http.post(url).send())
            .await
            .map_err(|_| IngestError::transport(self.exchange, format!("timeout on {url}")))?
            .map_err(|e| IngestError::transport(self.exchange, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::transport(
                self.exchange,
                format!("{url} returned {status}"),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| IngestError::protocol(self.exchange, e))
    }

    /// GET with a venue result-envelope check: fails when `code_field`
    /// of the response is present and differs from `ok_code`.
    ///
    /// Most venues wrap payloads as {"code": 0, "data": ...}; a 200
    /// with a non-zero code is still an error.
    pub async fn get_json_checked(
        &self,
        url: &str,
        code_field: &str,
        ok_code: &str,
    ) -> Result<Value> {
        let body = self.get_json(url).await?;
        if let Some(code) = body.get(code_field) {
            let code_str = match code {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if code_str != ok_code {
                let msg = body
                    .get("msg")
                    .or_else(|| body.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("");
                return Err(IngestError::protocol(
                    self.exchange,
                    format!("{url} returned code {code_str}: {msg}"),
                ));
            }
        }
        Ok(body)
    }
}
