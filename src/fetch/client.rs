//! Hardened HTTP client
//!
//! Wraps `reqwest` with the defences the upstream adapters rely on:
//! pre-flight URL validation, DNS resolution with per-record range checks,
//! peer verification after connect, a manual redirect walk that strips
//! credential-shaped headers on origin changes, a streamed response-size
//! cap, and retry with exponential backoff honouring `Retry-After`. Every
//! error message is redacted before it leaves this module.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::guard;
use super::redact::{is_sensitive_header, redact_text, sanitize_for_log};
use crate::error::FetchError;

/// Hard cap for a single `Retry-After` wait.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

/// Base delay for exponential backoff.
const BACKOFF_BASE_MS: u64 = 500;

/// Per-request safety limits.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// Total wall-clock budget for the request including retries
    pub timeout: Duration,
    /// Maximum number of response bytes read before aborting
    pub max_response_bytes: u64,
    /// Maximum redirect hops
    pub max_redirects: u32,
    /// Maximum retry attempts after the first try
    pub max_retries: u32,
    /// Header names the caller declares sensitive (stripped on origin change)
    pub sensitive_headers: Vec<String>,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_response_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
            max_retries: 4,
            sensitive_headers: Vec::new(),
        }
    }
}

impl RequestPolicy {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        // A missing timeout falls back to the default rather than "forever"
        if let Some(t) = timeout {
            if !t.is_zero() {
                self.timeout = t;
            }
        }
        self
    }
}

/// A completed, bounded response.
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client with SSRF and resource-use defences.
pub struct SecureClient {
    client: reqwest::Client,
    policy: RequestPolicy,
}

impl SecureClient {
    /// Build a client. Redirects are handled manually so each hop can be
    /// validated and sensitive headers stripped.
    pub fn new(user_agent: &str, policy: RequestPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .build()
            .map_err(|e| FetchError::Transport(redact_text(&e.to_string())))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    /// GET with retry, redirect and size guards.
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<FetchedResponse, FetchError> {
        self.execute(Method::GET, url, headers).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let deadline = Instant::now() + self.policy.timeout;
        let mut retry_after: Option<Duration> = None;
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt, retry_after.take());
                let remaining = deadline.saturating_duration_since(Instant::now());
                if delay >= remaining {
                    break;
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }

            match self
                .perform(method.clone(), url, headers.clone(), deadline)
                .await
            {
                Ok(response) => {
                    let status = StatusCode::from_u16(response.status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    if status.is_success() {
                        return Ok(response);
                    }
                    if is_retryable_status(response.status) {
                        retry_after = parse_retry_after(response.headers.get(RETRY_AFTER));
                        warn!(
                            status = response.status,
                            attempt,
                            url = %sanitize_for_log(url),
                            "retryable upstream status"
                        );
                        last_error = Some(FetchError::Status(response.status));
                        continue;
                    }
                    return Err(FetchError::Status(response.status));
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        attempt,
                        error = %err,
                        url = %sanitize_for_log(url),
                        "request attempt failed"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }

            if Instant::now() >= deadline {
                return Err(FetchError::Timeout);
            }
        }

        Err(last_error.unwrap_or(FetchError::MaxRetriesExceeded))
    }

    /// One attempt: walk the redirect chain and read the final body.
    async fn perform(
        &self,
        mut method: Method,
        url: &str,
        mut headers: HeaderMap,
        deadline: Instant,
    ) -> Result<FetchedResponse, FetchError> {
        let mut current = guard::validate_url(url)?;
        let mut hops = 0u32;

        loop {
            self.check_resolution(&current).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FetchError::Timeout);
            }

            let response = self
                .client
                .request(method.clone(), current.clone())
                .headers(headers.clone())
                .timeout(remaining)
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            // Peer check before any status/body is interpreted
            guard::verify_peer(response.remote_addr())?;

            let status = response.status();
            if status.is_redirection() {
                hops += 1;
                if hops > self.policy.max_redirects {
                    return Err(FetchError::RedirectRejected(format!(
                        "more than {} hops",
                        self.policy.max_redirects
                    )));
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FetchError::RedirectRejected("redirect without Location".into())
                    })?;
                let next = current.join(location).map_err(|e| {
                    FetchError::RedirectRejected(format!("unparseable target ({e})"))
                })?;
                let next = guard::validate_url(next.as_str())
                    .map_err(|e| FetchError::RedirectRejected(redact_text(&e.to_string())))?;

                if is_cross_origin(&current, &next) {
                    headers = strip_sensitive(&headers, &self.policy.sensitive_headers);
                }
                // 303, and historical 301/302 behaviour, demote to GET
                if status == StatusCode::SEE_OTHER
                    || (method != Method::GET
                        && (status == StatusCode::MOVED_PERMANENTLY
                            || status == StatusCode::FOUND))
                {
                    method = Method::GET;
                }
                current = next;
                continue;
            }

            let resp_headers = response.headers().clone();
            let body = self.read_bounded(response).await?;
            return Ok(FetchedResponse {
                status: status.as_u16(),
                headers: resp_headers,
                body,
            });
        }
    }

    /// Resolve and range-check every address for a hostname target.
    async fn check_resolution(&self, url: &Url) -> Result<(), FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::UrlRejected("missing host".into()))?
            .trim_end_matches('.')
            .to_string();
        // Literal addresses (IPv6 comes bracketed) were validated in
        // validate_url
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<std::net::IpAddr>().is_ok() {
            return Ok(());
        }
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| FetchError::Transport(format!("DNS resolution failed for {host}: {e}")))?
            .collect();
        guard::ensure_addrs_safe(&host, &addrs)
    }

    /// Stream the body with a hard byte cap.
    async fn read_bounded(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        let limit = self.policy.max_response_bytes;
        if let Some(len) = response.content_length() {
            if len > limit {
                return Err(FetchError::ResponseTooLarge { limit });
            }
        }
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_reqwest_error)? {
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(FetchError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(redact_text(&err.to_string()))
    }
}

/// Statuses worth another attempt.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Origin comparison for the header-stripping rule: any change of scheme,
/// host or effective port counts.
fn is_cross_origin(from: &Url, to: &Url) -> bool {
    from.scheme() != to.scheme()
        || from.host_str() != to.host_str()
        || from.port_or_known_default() != to.port_or_known_default()
}

/// Remove configured and heuristically sensitive headers.
fn strip_sensitive(headers: &HeaderMap, configured: &[String]) -> HeaderMap {
    let configured: Vec<String> = configured.iter().map(|h| h.to_lowercase()).collect();
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_lowercase();
        if configured.contains(&lower) || is_sensitive_header(name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Exponential backoff with jitter; `Retry-After` takes precedence, capped
/// at 60 s per attempt.
fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after {
        return after.min(RETRY_AFTER_CAP);
    }
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_BASE_MS / 2);
    Duration::from_millis(exp + jitter).min(RETRY_AFTER_CAP)
}

/// Parse `Retry-After` as delta-seconds or HTTP-date.
fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let raw = value?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

/// Build a header map from name/value pairs, skipping invalid names.
pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(n, v);
        }
    }
    map
}
