use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Specific API-error title surfaced in SKIP banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorTitle {
    ApiKeyInvalid,
    ApiCreditsDepleted,
    RateLimited,
    ServiceUnavailable,
    ApiError,
}

impl ApiErrorTitle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorTitle::ApiKeyInvalid => "API_KEY_INVALID",
            ApiErrorTitle::ApiCreditsDepleted => "API_CREDITS_DEPLETED",
            ApiErrorTitle::RateLimited => "RATE_LIMITED",
            ApiErrorTitle::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ApiErrorTitle::ApiError => "API_ERROR",
        }
    }
}

/// Outcome classification for one CLI invocation, derived from the exit
/// status and the combined stdout+stderr text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Success,
    /// Exit 0 but nothing usable was produced. Treated as transient.
    EmptyOutput,
    /// Killed by the wall clock (or exit 124 from a `timeout` wrapper).
    Timeout,
    /// Invalid key, depleted credits, missing credentials. The same key
    /// applies to every model, so fallback is pointless.
    AuthOrQuota(ApiErrorTitle),
    /// Non-429 client error. The request shape may work on another model.
    Client4xx,
    RateLimit {
        retry_after: Option<u64>,
    },
    Server5xx,
    Network,
    /// Generic provider/upstream/model error phrasing.
    ProviderGeneric,
    /// Unknown non-zero exit. Any captured output is delegated to the parser.
    UnknownNonZero,
}

impl FailureClass {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureClass::EmptyOutput
                | FailureClass::RateLimit { .. }
                | FailureClass::Server5xx
                | FailureClass::Network
                | FailureClass::ProviderGeneric
        )
    }

    /// The API-error title to use when this classification becomes a
    /// terminal SKIP.
    pub fn api_error_title(&self) -> ApiErrorTitle {
        match self {
            FailureClass::AuthOrQuota(t) => *t,
            FailureClass::RateLimit { .. } => ApiErrorTitle::RateLimited,
            FailureClass::Server5xx => ApiErrorTitle::ServiceUnavailable,
            _ => ApiErrorTitle::ApiError,
        }
    }
}

const KEY_INVALID_PATTERNS: &[&str] = &[
    "invalid api key",
    "invalid x-api-key",
    "api key not valid",
    "authentication_error",
    "unauthorized",
    "401",
    "no credentials",
    "not logged in",
];

const CREDITS_PATTERNS: &[&str] = &[
    "credit balance is too low",
    "insufficient_credits",
    "insufficient credits",
    "quota exceeded",
    "out of credits",
    "payment required",
    "402",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "rate_limit_error", "too many requests"];

const SERVER_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "529",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "overloaded",
];

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "could not resolve",
    "name resolution",
    "econnrefused",
    "enotfound",
    "etimedout",
    "network error",
    "tls handshake",
];

const CLIENT_PATTERNS: &[&str] = &[
    "400",
    "403",
    "404",
    "invalid_request_error",
    "bad request",
    "not_found_error",
    "permission_error",
];

const PROVIDER_PATTERNS: &[&str] = &["provider error", "upstream error", "model error", "api error"];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Extract a `Retry-After`-style hint in seconds from provider output.
pub fn parse_retry_after(output: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)retry[-_ ]after[:=]?\s*(\d+)|retry in (\d+)\s*s").expect("valid regex")
    });
    let caps = re.captures(output)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Pure classification of one invocation.
///
/// `has_usable_output` is true when stdout or the scratchpad carries any
/// non-whitespace content.
pub fn classify(
    exit_code: i32,
    timed_out: bool,
    combined: &str,
    has_usable_output: bool,
) -> FailureClass {
    if timed_out || exit_code == 124 {
        return FailureClass::Timeout;
    }
    if exit_code == 0 {
        return if has_usable_output {
            FailureClass::Success
        } else {
            FailureClass::EmptyOutput
        };
    }

    let lower = combined.to_lowercase();
    if matches_any(&lower, CREDITS_PATTERNS) {
        return FailureClass::AuthOrQuota(ApiErrorTitle::ApiCreditsDepleted);
    }
    if matches_any(&lower, KEY_INVALID_PATTERNS) {
        return FailureClass::AuthOrQuota(ApiErrorTitle::ApiKeyInvalid);
    }
    if matches_any(&lower, RATE_LIMIT_PATTERNS) {
        return FailureClass::RateLimit {
            retry_after: parse_retry_after(&lower),
        };
    }
    if matches_any(&lower, SERVER_PATTERNS) {
        return FailureClass::Server5xx;
    }
    if matches_any(&lower, NETWORK_PATTERNS) {
        return FailureClass::Network;
    }
    if matches_any(&lower, CLIENT_PATTERNS) {
        return FailureClass::Client4xx;
    }
    if matches_any(&lower, PROVIDER_PATTERNS) {
        return FailureClass::ProviderGeneric;
    }
    FailureClass::UnknownNonZero
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_with_output_is_success() {
        assert_eq!(classify(0, false, "", true), FailureClass::Success);
    }

    #[test]
    fn exit_zero_without_output_is_empty() {
        assert_eq!(classify(0, false, "", false), FailureClass::EmptyOutput);
        assert!(FailureClass::EmptyOutput.is_transient());
    }

    #[test]
    fn timeout_flag_wins() {
        assert_eq!(classify(1, true, "whatever", true), FailureClass::Timeout);
    }

    #[test]
    fn exit_124_is_timeout() {
        assert_eq!(classify(124, false, "", false), FailureClass::Timeout);
    }

    #[test]
    fn credits_depleted_detected() {
        let c = classify(1, false, "Error: insufficient_credits", false);
        assert_eq!(c, FailureClass::AuthOrQuota(ApiErrorTitle::ApiCreditsDepleted));
        assert!(!c.is_transient());
        assert_eq!(c.api_error_title().as_str(), "API_CREDITS_DEPLETED");
    }

    #[test]
    fn credit_balance_phrase_detected() {
        let c = classify(1, false, "Your credit balance is too low to run this", false);
        assert_eq!(c, FailureClass::AuthOrQuota(ApiErrorTitle::ApiCreditsDepleted));
    }

    #[test]
    fn invalid_key_detected() {
        let c = classify(1, false, "authentication_error: invalid x-api-key", false);
        assert_eq!(c, FailureClass::AuthOrQuota(ApiErrorTitle::ApiKeyInvalid));
        assert_eq!(c.api_error_title().as_str(), "API_KEY_INVALID");
    }

    #[test]
    fn rate_limit_detected_with_retry_after() {
        let c = classify(1, false, "HTTP 429 Too Many Requests\nRetry-After: 30", false);
        assert_eq!(c, FailureClass::RateLimit { retry_after: Some(30) });
        assert!(c.is_transient());
    }

    #[test]
    fn rate_limit_without_hint() {
        let c = classify(1, false, "rate_limit_error", false);
        assert_eq!(c, FailureClass::RateLimit { retry_after: None });
    }

    #[test]
    fn server_errors_transient() {
        for text in ["HTTP 503", "internal server error", "overloaded_error"] {
            let c = classify(1, false, text, false);
            assert_eq!(c, FailureClass::Server5xx, "text: {text}");
            assert!(c.is_transient());
        }
        assert_eq!(
            FailureClass::Server5xx.api_error_title(),
            ApiErrorTitle::ServiceUnavailable
        );
    }

    #[test]
    fn network_errors_transient() {
        let c = classify(1, false, "connect error: Connection refused (os error 111)", false);
        assert_eq!(c, FailureClass::Network);
        assert!(c.is_transient());
    }

    #[test]
    fn client_4xx_not_transient() {
        let c = classify(1, false, "HTTP 400 invalid_request_error", false);
        assert_eq!(c, FailureClass::Client4xx);
        assert!(!c.is_transient());
    }

    #[test]
    fn provider_generic_transient() {
        let c = classify(1, false, "upstream error: model unavailable-ish", false);
        assert_eq!(c, FailureClass::ProviderGeneric);
        assert!(c.is_transient());
    }

    #[test]
    fn unknown_nonzero_falls_through() {
        let c = classify(7, false, "segfault maybe", true);
        assert_eq!(c, FailureClass::UnknownNonZero);
        assert!(!c.is_transient());
    }

    #[test]
    fn rate_limit_beats_server_match_order() {
        // "429" checked before "500"-family phrases
        let c = classify(1, false, "429 too many requests, server busy", false);
        assert!(matches!(c, FailureClass::RateLimit { .. }));
    }

    #[test]
    fn parse_retry_after_variants() {
        assert_eq!(parse_retry_after("Retry-After: 12"), Some(12));
        assert_eq!(parse_retry_after("retry_after=45"), Some(45));
        assert_eq!(parse_retry_after("please retry in 8 s"), Some(8));
        assert_eq!(parse_retry_after("no hint here"), None);
    }
}
