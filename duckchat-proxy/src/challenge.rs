//! Turns the status endpoint's challenge into an `x-vqd-hash-1` token.
//!
//! The challenge is base64 encoded JavaScript. Running it yields a
//! fingerprint object; its `client_hashes` are replaced by
//! base64(SHA-256(..)), `meta.origin` is pinned, and the result is
//! base64 encoded JSON.

use std::sync::Arc;

use aws_lc_rs::digest::{SHA256, digest};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};
use crate::js_runtime::JsOracle;

pub const FINGERPRINT_ORIGIN: &str = "https://duckduckgo.com";

/// Fewer entries than this means the challenge format is not recognised.
const MIN_CLIENT_HASHES: usize = 2;

pub fn sha256_base64(input: &str) -> String {
    BASE64.encode(digest(&SHA256, input.as_bytes()).as_ref())
}

/// The JSON tree produced by a challenge. Kept dynamic because upstream
/// keeps adding fields that must be passed back untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint(Value);

impl Fingerprint {
    pub fn new(raw: Value) -> Result<Self> {
        if raw.is_null() {
            return Err(ProxyError::EmptyResult);
        }
        Ok(Self(raw))
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_array_mut(&mut self, key: &str) -> Option<&mut Vec<Value>> {
        self.0.get_mut(key).and_then(Value::as_array_mut)
    }

    pub fn get_object_mut(&mut self, key: &str) -> Option<&mut Map<String, Value>> {
        self.0.get_mut(key).and_then(Value::as_object_mut)
    }

    /// The script signals failure through a non-empty `error` string.
    pub fn reported_error(&self) -> Option<ProxyError> {
        let message = self.get_string("error").filter(|m| !m.is_empty())?;
        let stack = match self.0.get("stack") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Some(ProxyError::JsReportedError {
            message: message.to_string(),
            stack,
        })
    }

    pub fn hash_client_hashes(&mut self) {
        let Some(hashes) = self
            .get_array_mut("client_hashes")
            .filter(|h| h.len() >= MIN_CLIENT_HASHES)
        else {
            tracing::warn!(
                "client_hashes missing or shorter than {}, skipping post-processing",
                MIN_CLIENT_HASHES
            );
            return;
        };

        for (index, entry) in hashes.iter_mut().enumerate() {
            match entry {
                Value::String(raw) => *raw = sha256_base64(raw),
                other => tracing::warn!(
                    "client_hashes[{}] is not a string ({}), leaving it as is",
                    index,
                    other
                ),
            }
        }
    }

    pub fn stamp_origin(&mut self) {
        if let Some(meta) = self.get_object_mut("meta") {
            meta.insert("origin".to_string(), Value::String(FINGERPRINT_ORIGIN.to_string()));
        }
    }

    /// base64 of the JSON text.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(&self.0).map_err(|e| {
            ProxyError::Translation(format!("failed to serialize fingerprint: {}", e))
        })?;
        Ok(BASE64.encode(json))
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Decode the challenge into script source.
pub fn decode_challenge(challenge_b64: &str) -> Result<String> {
    let bytes = BASE64
        .decode(challenge_b64.trim())
        .map_err(|e| ProxyError::BadChallenge(e.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|e| ProxyError::BadChallenge(format!("decoded script is not UTF-8: {}", e)))
}

/// Post-process a raw fingerprint into the token string.
pub fn process_fingerprint(raw: Value) -> Result<String> {
    let mut fingerprint = Fingerprint::new(raw)?;
    if let Some(err) = fingerprint.reported_error() {
        return Err(err);
    }
    fingerprint.hash_client_hashes();
    fingerprint.stamp_origin();
    fingerprint.encode()
}

/// Solves challenges by running them through a [`JsOracle`].
#[derive(Clone)]
pub struct ChallengeSolver {
    oracle: Arc<dyn JsOracle>,
}

impl ChallengeSolver {
    pub fn new(oracle: Arc<dyn JsOracle>) -> Self {
        Self { oracle }
    }

    pub fn oracle(&self) -> &Arc<dyn JsOracle> {
        &self.oracle
    }

    pub async fn solve(&self, challenge_b64: &str) -> Result<String> {
        let code = decode_challenge(challenge_b64)?;
        tracing::debug!("Decoded challenge: {}", code.chars().take(100).collect::<String>());

        let raw = self.oracle.evaluate(&code).await?;
        let token = process_fingerprint(raw)?;

        tracing::debug!("Solved challenge, token length: {}", token.len());
        Ok(token)
    }
}
