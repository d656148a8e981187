use http::header::HeaderMap;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

use crate::models::session::{DeviceClass, DeviceInfo};

/// The number of random bytes behind an auth token.
const AUTH_TOKEN_SIZE: usize = 32;
/// The number of hex characters kept as the session id.
const SESSION_ID_LEN: usize = 32;

/// Generates a new opaque auth token (hex-encoded random bytes).
pub fn generate_auth_token() -> String {
    let mut token = [0u8; AUTH_TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);
    hex::encode(token)
}

/// Derives the session id from an auth token.
///
/// The id is the first 32 hex characters of the token's SHA-256 digest, so
/// any holder of the token can re-derive it but the stored id never reveals
/// the token itself.
pub fn derive_session_id(auth_token: &str) -> String {
    let digest = Sha256::digest(auth_token.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(SESSION_ID_LEN);
    id
}

/// Extracts the real client IP from request headers, falling back to the
/// socket peer address.
///
/// Priority: first hop of `X-Forwarded-For`, then `X-Real-IP`, then the
/// connection's peer address, then `"unknown"`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Extractor form of [`client_ip`] for handlers.
pub struct ClientIp(pub String);

impl<S> axum::extract::FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        Ok(ClientIp(client_ip(&parts.headers, peer)))
    }
}

/// Maps a raw user-agent string into browser/OS/device-class buckets.
///
/// Pattern order matters: Edge advertises "Chrome", Chrome advertises
/// "Safari", Android advertises "Linux", and tablets advertise "Mobile",
/// so the more specific pattern is always tested first.
pub fn parse_user_agent(user_agent: &str) -> DeviceInfo {
    let ua = user_agent.to_ascii_lowercase();

    let browser = if ua.contains("edg/") || ua.contains("edge") {
        "Edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("chrome") {
        "Chrome"
    } else if ua.contains("firefox") {
        "Firefox"
    } else if ua.contains("safari") {
        "Safari"
    } else {
        "Unknown"
    };

    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iOS"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Unknown"
    };

    let device_class = if ua.contains("ipad") || ua.contains("tablet") {
        DeviceClass::Tablet
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    };

    DeviceInfo {
        browser: browser.to_string(),
        os: os.to_string(),
        device_class,
        user_agent: user_agent.to_string(),
    }
}
