//! HTTP plumbing for the duckchat status and chat endpoints.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{ProxyError, Result};
use crate::token::ChallengeSource;
use crate::types::ChatRequest;

pub const DEFAULT_BASE_URL: &str = "https://duckduckgo.com";
const STATUS_PATH: &str = "/duckchat/v1/status";
const CHAT_PATH: &str = "/duckchat/v1/chat";

/// Response header carrying the challenge script.
pub const CHALLENGE_HEADER: &str = "x-vqd-hash-1";

pub const USER_AGENT_STRING: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36 Edg/137.0.0.0";
pub const SEC_CH_UA: &str = r#""Google Chrome";v="137", "Chromium";v="137", "Not/A)Brand";v="24""#;
pub const ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9";

/// Headers sent on every upstream request. The values are checked by the
/// upstream anti-abuse layer and must stay byte-for-byte as they are.
pub fn canonical_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let pairs: [(&'static str, &'static str); 11] = [
        ("accept-language", ACCEPT_LANGUAGE),
        ("content-type", "application/json"),
        ("origin", "https://duckduckgo.com"),
        ("referer", "https://duckduckgo.com/"),
        ("sec-ch-ua", SEC_CH_UA),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
        ("user-agent", USER_AGENT_STRING),
    ];
    for (name, value) in pairs {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

fn status_headers() -> HeaderMap {
    let mut headers = canonical_headers();
    headers.insert("accept", HeaderValue::from_static("*/*"));
    headers.insert("x-vqd-accept", HeaderValue::from_static("1"));
    headers
}

fn chat_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = canonical_headers();
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    let token = HeaderValue::from_str(token)
        .map_err(|e| ProxyError::Translation(format!("token is not a valid header value: {}", e)))?;
    headers.insert(CHALLENGE_HEADER, token);
    Ok(headers)
}

/// Client for the two duckchat endpoints, optionally routed through a proxy.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, proxy_url: Option<&str>) -> Result<Self> {
        let jar = reqwest::cookie::Jar::default();
        let mut builder = reqwest::Client::builder().cookie_provider(jar.into());

        if let Some(proxy_url) = proxy_url.filter(|url| !url.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                ProxyError::Config(format!("invalid proxy url {}: {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
            tracing::info!("Routing upstream traffic through {}", proxy_url);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the status endpoint for a fresh challenge.
    pub async fn fetch_challenge(&self) -> Result<String> {
        tracing::debug!("Fetching challenge from status endpoint");

        let response = self
            .client
            .get(format!("{}{}", self.base_url, STATUS_PATH))
            .headers(status_headers())
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!("Status endpoint returned {}", response.status());
        }

        let challenge = response
            .headers()
            .get(CHALLENGE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        // the body is never read; dropping the response releases the connection
        drop(response);

        if challenge.is_empty() {
            return Err(ProxyError::NoChallenge);
        }
        Ok(challenge)
    }

    /// Post the conversation. The body is left unread for the relay; a
    /// non-200 reply is drained into `UpstreamNon200`.
    pub async fn post_conversation(
        &self,
        request: &ChatRequest,
        token: &str,
    ) -> Result<reqwest::Response> {
        tracing::debug!("Sending chat request with model: {}", request.model);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, CHAT_PATH))
            .headers(chat_headers(token)?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Chat endpoint returned {}: {}", status, body);
            return Err(ProxyError::UpstreamNon200 { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChallengeSource for UpstreamClient {
    async fn fetch_challenge(&self) -> Result<String> {
        UpstreamClient::fetch_challenge(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_set_is_complete() {
        let headers = canonical_headers();
        assert_eq!(headers.len(), 11);
        assert_eq!(headers["user-agent"], USER_AGENT_STRING);
        assert_eq!(headers["sec-ch-ua-platform"], "\"Windows\"");
        assert_eq!(headers["accept-language"], "zh-CN,zh;q=0.9");
    }

    #[test]
    fn user_agent_matches_client_hint_version() {
        assert!(USER_AGENT_STRING.contains("Chrome/137."));
        assert!(SEC_CH_UA.contains("v=\"137\""));
    }

    #[test]
    fn chat_headers_carry_token() {
        let headers = chat_headers("abc=").unwrap();
        assert_eq!(headers["accept"], "text/event-stream");
        assert_eq!(headers[CHALLENGE_HEADER], "abc=");
        assert!(chat_headers("bad\ntoken").is_err());
    }

    #[test]
    fn status_headers_request_a_challenge() {
        let headers = status_headers();
        assert_eq!(headers["accept"], "*/*");
        assert_eq!(headers["x-vqd-accept"], "1");
    }

    #[test]
    fn base_url_is_normalised() {
        let client = UpstreamClient::new("http://127.0.0.1:9/", None).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9");
    }
}
