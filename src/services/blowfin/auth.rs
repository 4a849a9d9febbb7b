// src/services/blowfin/auth.rs

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

/// API credentials for one BlowFin account.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .finish_non_exhaustive()
    }
}

fn mask(s: &str) -> String {
    let head: String = s.chars().take(4).collect();
    format!("{head}…")
}

/// Everything that goes into the `ACCESS-*` headers of one request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl Credentials {
    /// Sign `method path` with a fresh timestamp and nonce. `path` includes
    /// the query string; `body` is empty for GETs.
    pub fn sign(&self, method: &str, path: &str, body: &str) -> SignedRequest {
        let timestamp = current_timestamp();
        let nonce = generate_nonce();
        let signature = sign_rest(&self.api_secret, method, path, &timestamp, &nonce, body);
        SignedRequest { timestamp, nonce, signature }
    }
}

/// Millisecond timestamp
pub fn current_timestamp() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Random nonce for replay protection
pub fn generate_nonce() -> String {
    Uuid::new_v4().to_string()
}

/// Sign REST requests (HMAC SHA-256 + Base64)
pub fn sign_rest(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    nonce: &str,
    body: &str,
) -> String {
    let prehash = format!("{}{}{}{}{}", path, method, timestamp, nonce, body);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key bits of any size");
    mac.update(prehash.as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
