//! HTTP plumbing shared by the source adapters: status and body mapping onto
//! `SourceError`.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::SourceError;

/// Build the client used for every source and notifier.
pub fn client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("bugwatch/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Send a request and decode a JSON body, returning the headers alongside.
pub async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<(T, HeaderMap), SourceError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(transport_error)?;

    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        return Err(status_error(status, &headers, &text, chrono::Utc::now()));
    }
    Ok((decode(&body)?, headers))
}

/// A body that ends early is worth retrying; a complete body of the wrong
/// shape is not.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(body).map_err(|e| {
        if e.is_eof() {
            SourceError::Truncated(e.to_string())
        } else {
            SourceError::Schema(e.to_string())
        }
    })
}

pub fn transport_error(e: reqwest::Error) -> SourceError {
    if e.is_builder() {
        return SourceError::Rejected {
            status: 0,
            body: e.to_string(),
        };
    }
    if e.is_decode() {
        return SourceError::Truncated(e.to_string());
    }
    SourceError::Transport(e.to_string())
}

pub fn status_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> SourceError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS || is_quota_exhausted(headers) {
        return SourceError::RateLimited {
            retry_after: retry_after(headers, now),
        };
    }
    match code {
        401 | 403 => SourceError::Auth(code),
        500..=599 => SourceError::Server(code),
        _ => SourceError::Rejected {
            status: code,
            body: body.chars().take(200).collect(),
        },
    }
}

// GitHub answers an exhausted quota with 403 plus `x-ratelimit-remaining: 0`.
fn is_quota_exhausted(headers: &HeaderMap) -> bool {
    header_str(headers, "x-ratelimit-remaining").map(str::trim) == Some("0")
}

/// `Retry-After` in seconds, else the `x-ratelimit-reset` epoch.
pub fn retry_after(headers: &HeaderMap, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_str(headers, "x-ratelimit-reset")?.trim().parse::<i64>().ok()?;
    let wait = reset - now.timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        let e = status_error(StatusCode::TOO_MANY_REQUESTS, &headers, "", now());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert!(e.is_transient());
    }

    #[test]
    fn test_github_quota_is_rate_limit_not_auth() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        let reset = (now().timestamp() + 42).to_string();
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&reset).unwrap());
        let e = status_error(StatusCode::FORBIDDEN, &headers, "", now());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_status_mapping() {
        let headers = HeaderMap::new();
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, &headers, "", now()),
            SourceError::Auth(401)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &headers, "", now()),
            SourceError::Server(502)
        ));
        let e = status_error(StatusCode::BAD_REQUEST, &headers, "bad jql", now());
        assert!(matches!(e, SourceError::Rejected { status: 400, ref body } if body == "bad jql"));
        assert!(!e.is_transient());
    }

    #[test]
    fn test_decode_truncated_vs_schema() {
        #[derive(Debug, serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            results: Vec<u64>,
        }
        assert!(matches!(decode::<Body>(br#"{"results": [1, 2"#), Err(SourceError::Truncated(_))));
        assert!(matches!(decode::<Body>(br#"{"rows": []}"#), Err(SourceError::Schema(_))));
        assert!(decode::<Body>(br#"{"results": [1, 2]}"#).is_ok());
    }
}
