use std::path::PathBuf;

use clap::Args;

use crate::error::ProxyError;
use crate::js_runtime::{ChromeOracle, OraclePage};
use crate::upstream::DEFAULT_BASE_URL;

/// Runtime settings. Every option can also be given through the environment.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0", global = true)]
    pub host: String,

    /// Port to listen on [default: 8080]
    #[arg(short, long, env = "SERVER_PORT", global = true)]
    pub port: Option<u16>,

    /// Port used when SERVER_PORT is unset
    #[arg(long, env = "PORT", hide = true, global = true)]
    pub fallback_port: Option<u16>,

    /// PEM certificate chain; serves HTTPS together with --tls-key
    #[arg(long, env = "TLS_CERT", global = true)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long, env = "TLS_KEY", global = true)]
    pub tls_key: Option<PathBuf>,

    /// Bearer token clients must present; the API is open when unset
    #[arg(long, env = "AUTHORIZATION", global = true)]
    pub api_key: Option<String>,

    /// Proxy for upstream traffic, e.g. http://127.0.0.1:7890
    #[arg(long, env = "PROXY_URL", global = true)]
    pub proxy_url: Option<String>,

    /// DevTools WebSocket of an already running browser; a browser is
    /// launched locally when unset
    #[arg(long, env = "DEVTOOLS_URL", global = true)]
    pub devtools_url: Option<String>,

    /// Browser executable for the local launch
    #[arg(long, env = "CHROME_PATH", global = true)]
    pub chrome_path: Option<PathBuf>,

    /// Page the challenge script runs on
    #[arg(long, env = "ORACLE_PAGE", value_enum, default_value = "duckduckgo", global = true)]
    pub oracle_page: OraclePage,

    /// Upstream origin
    #[arg(long, env = "DUCKCHAT_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    pub upstream_base: String,
}

pub const DEFAULT_PORT: u16 = 8080;

impl Config {
    pub fn port(&self) -> u16 {
        self.port.or(self.fallback_port).unwrap_or(DEFAULT_PORT)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// Certificate and key paths when HTTPS is configured.
    pub fn tls_files(&self) -> Result<Option<(PathBuf, PathBuf)>, ProxyError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.clone(), key.clone()))),
            (None, None) => Ok(None),
            _ => Err(ProxyError::Config(
                "TLS_CERT and TLS_KEY must be set together".to_string(),
            )),
        }
    }

    pub fn oracle(&self) -> ChromeOracle {
        ChromeOracle::from_settings(
            self.devtools_url.clone(),
            self.chrome_path.clone(),
            self.oracle_page,
        )
    }

    /// The configured key, ignoring blank values.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults() {
        let config = Harness::parse_from(["duckchat-proxy"]).config;
        assert_eq!(config.port(), DEFAULT_PORT);
        assert!(config.tls_files().unwrap().is_none());
        assert_eq!(config.oracle_page, OraclePage::DuckDuckGo);
        assert_eq!(config.upstream_base, "https://duckduckgo.com");
    }

    #[test]
    fn flags_override_defaults() {
        let config = Harness::parse_from([
            "duckchat-proxy",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--oracle-page",
            "blank",
            "--api-key",
            "  ",
        ])
        .config;
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.oracle_page, OraclePage::Blank);
        assert_eq!(config.api_key(), None);
    }

    #[test]
    fn server_port_wins_over_platform_port() {
        let config = Harness::parse_from(["duckchat-proxy", "--fallback-port", "7000"]).config;
        assert_eq!(config.port(), 7000);

        let config = Harness::parse_from([
            "duckchat-proxy",
            "--port",
            "9000",
            "--fallback-port",
            "7000",
        ])
        .config;
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn tls_needs_both_files() {
        let config = Harness::parse_from(["duckchat-proxy", "--tls-cert", "cert.pem"]).config;
        assert!(matches!(config.tls_files(), Err(ProxyError::Config(_))));

        let config = Harness::parse_from([
            "duckchat-proxy",
            "--tls-cert",
            "cert.pem",
            "--tls-key",
            "key.pem",
        ])
        .config;
        let (cert, key) = config.tls_files().unwrap().unwrap();
        assert_eq!(cert, PathBuf::from("cert.pem"));
        assert_eq!(key, PathBuf::from("key.pem"));
    }
}
