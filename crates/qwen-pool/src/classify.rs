//! Failure classification for provider responses
//!
//! The provider reports errors as a JSON document with a `code` field, either
//! at the top level or nested under `error` / `data`:
//!
//! ```json
//! {"code": "RateLimited", "detail": "...", "num": 4}
//! ```
//!
//! Classification prefers that structured code. Providers and proxies in
//! front of them do not always emit it, so each kind keeps one documented
//! textual fallback:
//! - verification: an HTML page mentioning `Verification`
//! - invalid credential: HTTP 401, or `Unauthorized` / `Token has expired` in the body
//! - rate limit: `RateLimited` anywhere in the body
//!
//! Kinds are checked in that order and the first match wins.

use provider::{ErrorClassification, UpstreamFailure};
use serde_json::Value;

use qwen_auth::DEFAULT_RATE_LIMIT_HOURS;

const VERIFICATION_CODES: &[&str] = &["VerificationRequired", "Verification", "CaptchaRequired"];
const INVALID_CODES: &[&str] = &["Unauthorized", "TokenExpired", "InvalidToken", "Forbidden"];
const RATE_LIMIT_CODE: &str = "RateLimited";

const INVALID_PATTERNS: &[&str] = &["Unauthorized", "Token has expired"];

/// Error code from the provider's structured error document, if any.
fn error_code(doc: &Value) -> Option<&str> {
    [doc.get("code"), doc.pointer("/error/code"), doc.pointer("/data/code")]
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with('<') && head.to_ascii_lowercase().contains("<html")
}

/// Cooldown hint in hours from a rate-limit document (`num`, number or
/// numeric string). Missing, zero or unparsable hints fall back to `default_hours`.
pub fn parse_rate_limit_hours(doc: &Value, default_hours: u64) -> u64 {
    let num = [doc.get("num"), doc.pointer("/error/num"), doc.pointer("/data/num")]
        .into_iter()
        .flatten()
        .next();
    let hours = match num {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f.ceil() as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    hours.filter(|h| *h > 0).unwrap_or(default_hours)
}

/// Classify an upstream error by HTTP status and response body.
pub fn classify_status(status: Option<u16>, body: &str, default_hours: u64) -> ErrorClassification {
    let doc: Option<Value> = serde_json::from_str(body).ok();
    let code = doc.as_ref().and_then(error_code);

    if code.is_some_and(|c| VERIFICATION_CODES.contains(&c))
        || (looks_like_html(body) && body.contains("Verification"))
    {
        return ErrorClassification::VerificationRequired;
    }

    if code.is_some_and(|c| INVALID_CODES.contains(&c))
        || status == Some(401)
        || INVALID_PATTERNS.iter().any(|p| body.contains(p))
    {
        return ErrorClassification::InvalidCredential;
    }

    if code == Some(RATE_LIMIT_CODE) || body.contains(RATE_LIMIT_CODE) {
        let retry_after_hours = doc
            .as_ref()
            .map(|d| parse_rate_limit_hours(d, default_hours))
            .unwrap_or(default_hours);
        return ErrorClassification::RateLimited { retry_after_hours };
    }

    ErrorClassification::Other
}

/// Classify a provider failure with the default cooldown.
pub fn classify_failure(failure: &UpstreamFailure) -> ErrorClassification {
    classify_status(failure.status, &failure.body, DEFAULT_RATE_LIMIT_HOURS)
}
