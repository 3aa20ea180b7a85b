//! OpenAI-compatible proxy in front of DuckDuckGo AI chat.
//!
//! A request flows through the [`token::TokenCache`] (which fetches a
//! challenge with [`upstream::UpstreamClient`] and solves it through the
//! [`js_runtime::JsOracle`]), is posted upstream, and the SSE reply is turned
//! into OpenAI chunks by [`relay::relay`].

pub mod challenge;
pub mod config;
pub mod error;
pub mod js_runtime;
pub mod openai;
pub mod relay;
pub mod server;
pub mod tls;
pub mod token;
pub mod types;
pub mod upstream;

use std::sync::Arc;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::{run_server, serve};

use challenge::ChallengeSolver;
use js_runtime::JsOracle;
use token::TokenCache;
use types::ChatRequest;
use upstream::UpstreamClient;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Shared by every request handler.
pub struct AppState {
    pub upstream: UpstreamClient,
    pub tokens: TokenCache,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(
        upstream: UpstreamClient,
        oracle: Arc<dyn JsOracle>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            upstream,
            tokens: TokenCache::new(ChallengeSolver::new(oracle)),
            api_key,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream_base, config.proxy_url.as_deref())?;
        Ok(Self::new(upstream, Arc::new(config.oracle()), config.api_key()))
    }

    /// Obtain a token and post the conversation, returning the unread
    /// event stream.
    pub async fn open_chat(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let token = self.tokens.get(&self.upstream).await?;
        let posted = self.upstream.post_conversation(request, &token.token).await;
        let rejected = matches!(
            &posted,
            Err(ProxyError::UpstreamNon200 { status, .. })
                if *status == reqwest::StatusCode::IM_A_TEAPOT
        );
        if rejected {
            tracing::warn!("Upstream rejected the token, it will be refreshed on the next request");
            self.tokens.invalidate(&token.token).await;
        }
        posted
    }

    pub async fn shutdown(&self) {
        self.tokens.solver().oracle().shutdown().await;
    }
}
