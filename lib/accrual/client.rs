use std::error::Error as StdError;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, StatusCode};
use serde::Deserialize;

use super::{AccrualClient, AccrualError, AccrualOutcome, AccrualStatus};
use crate::ledger::Points;
use crate::server::monitoring::ENGINE_METRICS;

pub type AccrualRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

#[derive(Debug, Clone)]
pub struct AccrualClientConfig {
    pub base_url: String,
    /// Per-request budget covering connect, headers and body.
    pub timeout: Duration,
    /// Pause applied on 429 when `Retry-After` is missing or unparseable.
    pub rate_limit_fallback: Duration,
    /// Client-side request budget; `None` leaves pacing entirely to the server's 429s.
    pub requests_per_second: Option<NonZeroU32>,
}

impl Default for AccrualClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8085".to_string(),
            timeout: Duration::from_secs(5),
            rate_limit_fallback: Duration::from_secs(60),
            requests_per_second: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccrualResponse {
    #[allow(dead_code)]
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

/// reqwest-backed accrual client.
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
    rate_limit_fallback: Duration,
    limiter: Option<AccrualRateLimiter>,
}

impl HttpAccrualClient {
    pub fn new(config: AccrualClientConfig) -> Result<Self, AccrualError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AccrualError::InvalidBaseUrl(config.base_url));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AccrualError::Build(err.to_string()))?;

        Ok(Self {
            client,
            base_url,
            rate_limit_fallback: config.rate_limit_fallback,
            limiter: config
                .requests_per_second
                .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps)))),
        })
    }

    async fn request(&self, number: &str) -> AccrualOutcome {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let url = format!("{}/api/orders/{}", self.base_url, number);
        let response = match self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log_reqwest_diagnostics(number, &err);
                return AccrualOutcome::TransientFailure(AccrualError::Transport(err.to_string()));
            }
        };

        match response.status() {
            StatusCode::OK => match response.json::<AccrualResponse>().await {
                Ok(body) => AccrualOutcome::Success {
                    status: AccrualStatus::parse(&body.status),
                    awarded: body.accrual.and_then(Points::from_decimal),
                },
                Err(err) => {
                    log_reqwest_diagnostics(number, &err);
                    AccrualOutcome::TransientFailure(AccrualError::Decode(err.to_string()))
                }
            },
            StatusCode::NO_CONTENT => AccrualOutcome::NotRegistered,
            StatusCode::TOO_MANY_REQUESTS => {
                let header_value = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok());
                AccrualOutcome::RateLimited {
                    retry_after: parse_retry_after(header_value, self.rate_limit_fallback),
                }
            }
            other => AccrualOutcome::TransientFailure(AccrualError::UnexpectedStatus(
                other.as_u16(),
            )),
        }
    }
}

impl AccrualClient for HttpAccrualClient {
    fn fetch_status<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        Box::pin(async move {
            let outcome = self.request(number).await;
            if let Some(metrics) = ENGINE_METRICS.get() {
                metrics.record_accrual_outcome(outcome.label());
            }
            outcome
        })
    }
}

/// Reads `Retry-After` as whole seconds, falling back when absent or not a number.
pub fn parse_retry_after(value: Option<&str>, fallback: Duration) -> Duration {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn log_reqwest_diagnostics(number: &str, err: &reqwest::Error) {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(next) = source {
        chain.push(next.to_string());
        source = next.source();
    }

    tracing::debug!(
        event = "accrual_request_error_diagnostics",
        order_number = number,
        reqwest_status = ?err.status().map(|status| status.as_u16()),
        reqwest_is_timeout = err.is_timeout(),
        reqwest_is_connect = err.is_connect(),
        reqwest_is_decode = err.is_decode(),
        reqwest_error_chain = %chain.join(" | caused_by: "),
        "captured reqwest diagnostics while fetching accrual status"
    );
}
