use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::{Classification, Classifier, Verdict};
use crate::config::BaiduConfig;
use crate::error::{ModerationError, Result};

/// Tokens are refreshed this long before the provider says they expire
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Default token lifetime when the response omits `expires_in` (30 days)
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 3600;

/// Upper bound on a token lifetime, whatever `expires_in` claims
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 3600;

// Error codes returned in the response body
const ERROR_QPS_LIMIT: i64 = 18;
const ERROR_REQUEST_LIMIT: i64 = 4;
const ERROR_TOKEN_INVALID: i64 = 110;
const ERROR_TOKEN_EXPIRED: i64 = 111;

/// Baidu content censor (image and text)
pub struct BaiduClassifier {
    config: BaiduConfig,
    client: reqwest::Client,
    token: RwLock<Option<AccessToken>>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// How a censor response body should be handled
#[derive(Debug, PartialEq)]
pub(crate) enum ResponseOutcome {
    Verdict(Verdict),
    Retry { refresh_token: bool, reason: String },
    Failed(String),
}

impl BaiduClassifier {
    pub fn new(config: BaiduConfig) -> Result<Self> {
        if config.api_key.is_none() || config.secret_key.is_none() {
            return Err(ModerationError::Config(
                "Baidu API key and secret key required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    /// Cached access token, fetching a new one when missing or expired
    async fn access_token(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref().filter(|t| t.is_valid(Utc::now())) {
                return Ok(token.value.clone());
            }
        }

        let mut token = self.token.write().await;
        // Another task may have refreshed it while we waited for the lock
        if let Some(existing) = token.as_ref().filter(|t| t.is_valid(Utc::now())) {
            return Ok(existing.value.clone());
        }

        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *token = Some(fresh);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let secret_key = self.config.secret_key.as_deref().unwrap_or_default();

        let url = Url::parse_with_params(
            &self.config.token_endpoint,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", api_key),
                ("client_secret", secret_key),
            ],
        )
        .map_err(|e| ModerationError::Config(format!("invalid token endpoint: {}", e)))?;

        debug!("Requesting access token from {}", self.config.token_endpoint);

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| ModerationError::ClassifierUnavailable(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|e| {
            ModerationError::ClassifierUnavailable(format!("token response unreadable ({}): {}", status, e))
        })?;

        let token = parse_token_response(body, Utc::now())?;
        info!("🔑 Acquired access token valid until {}", token.expires_at);
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// POST a form body to a censor endpoint, retrying transient failures
    async fn censor(&self, endpoint: &str, body: String) -> Result<Classification> {
        let mut attempt: u32 = 0;

        loop {
            let token = self.access_token().await?;
            let url = Url::parse_with_params(endpoint, &[("access_token", token.as_str())])
                .map_err(|e| ModerationError::Config(format!("invalid censor endpoint: {}", e)))?;

            let sent = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(ACCEPT, "application/json")
                .body(body.clone())
                .send()
                .await;

            let reason = match sent {
                Ok(response) if response.status().is_server_error() => {
                    format!("HTTP {}", response.status())
                }
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(ModerationError::Classifier(format!("HTTP {}: {}", status, text)));
                }
                Ok(response) => {
                    let raw: serde_json::Value = response.json().await.map_err(|e| {
                        ModerationError::Classifier(format!("malformed censor response: {}", e))
                    })?;

                    match interpret_response(&raw, self.config.suspected_is_non_compliant) {
                        ResponseOutcome::Verdict(verdict) => {
                            return Ok(Classification { verdict, raw });
                        }
                        ResponseOutcome::Failed(message) => {
                            return Err(ModerationError::Classifier(message));
                        }
                        ResponseOutcome::Retry { refresh_token, reason } => {
                            if refresh_token {
                                self.invalidate_token().await;
                            }
                            reason
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            if attempt >= self.config.max_retries {
                return Err(ModerationError::Classifier(format!(
                    "giving up after {} attempts: {}",
                    attempt + 1,
                    reason
                )));
            }

            let delay = Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(1 << attempt.min(10)));
            warn!("Censor request failed ({}), retrying in {:?}", reason, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Classifier for BaiduClassifier {
    async fn prepare(&self) -> Result<()> {
        self.access_token().await.map(|_| ())
    }

    async fn classify_image(&self, image: &[u8]) -> Result<Classification> {
        self.censor(&self.config.image_endpoint, image_form_body(image)).await
    }

    async fn classify_text(&self, text: &str) -> Result<Classification> {
        self.censor(&self.config.text_endpoint, text_form_body(text)).await
    }

    fn name(&self) -> &str {
        "baidu"
    }
}

fn parse_token_response(body: TokenResponse, now: DateTime<Utc>) -> Result<AccessToken> {
    if let Some(error) = body.error {
        return Err(ModerationError::ClassifierUnavailable(format!(
            "{}: {}",
            error,
            body.error_description.unwrap_or_default()
        )));
    }

    let value = body
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ModerationError::ClassifierUnavailable("no access_token in response".into()))?;

    let lifetime = body
        .expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .clamp(0, MAX_TOKEN_LIFETIME_SECS);
    let usable = (lifetime - TOKEN_EXPIRY_MARGIN_SECS).max(0);

    Ok(AccessToken {
        value,
        expires_at: now + ChronoDuration::seconds(usable),
    })
}

fn image_form_body(image: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    format!("image={}", urlencoding::encode(&encoded))
}

fn text_form_body(text: &str) -> String {
    format!("text={}", urlencoding::encode(text))
}

/// Map a censor response body to a verdict, a retry, or a failure
pub(crate) fn interpret_response(raw: &serde_json::Value, suspected_is_non_compliant: bool) -> ResponseOutcome {
    if let Some(code) = raw["error_code"].as_i64() {
        let message = raw["error_msg"].as_str().unwrap_or("unknown error");
        return match code {
            ERROR_TOKEN_INVALID | ERROR_TOKEN_EXPIRED => ResponseOutcome::Retry {
                refresh_token: true,
                reason: format!("token rejected ({}): {}", code, message),
            },
            ERROR_QPS_LIMIT | ERROR_REQUEST_LIMIT => ResponseOutcome::Retry {
                refresh_token: false,
                reason: format!("rate limited ({}): {}", code, message),
            },
            _ => ResponseOutcome::Failed(format!("error_code {}: {}", code, message)),
        };
    }

    let verdict = match raw["conclusionType"].as_i64() {
        Some(1) => Verdict::Compliant,
        Some(2) => Verdict::NonCompliant,
        Some(3) if suspected_is_non_compliant => Verdict::NonCompliant,
        Some(3) | Some(4) => Verdict::Indeterminate,
        _ => match raw["conclusion"].as_str() {
            Some("合规") => Verdict::Compliant,
            Some("不合规") => Verdict::NonCompliant,
            Some(_) => Verdict::Indeterminate,
            None => return ResponseOutcome::Failed("response has no conclusion".to_string()),
        },
    };

    ResponseOutcome::Verdict(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config() -> BaiduConfig {
        BaiduConfig {
            api_key: Some("key".into()),
            secret_key: Some("secret".into()),
            ..BaiduConfig::default()
        }
    }

    #[test]
    fn test_conclusion_types() {
        let cases = [
            (1, Verdict::Compliant),
            (2, Verdict::NonCompliant),
            (3, Verdict::Indeterminate),
            (4, Verdict::Indeterminate),
        ];
        for (conclusion_type, expected) in cases {
            let raw = json!({ "conclusion": "x", "conclusionType": conclusion_type });
            assert_eq!(interpret_response(&raw, false), ResponseOutcome::Verdict(expected));
        }
    }

    #[test]
    fn test_suspected_can_be_non_compliant() {
        let raw = json!({ "conclusion": "疑似", "conclusionType": 3 });
        assert_eq!(interpret_response(&raw, true), ResponseOutcome::Verdict(Verdict::NonCompliant));
    }

    #[test]
    fn test_conclusion_text_fallback() {
        assert_eq!(
            interpret_response(&json!({ "conclusion": "不合规" }), false),
            ResponseOutcome::Verdict(Verdict::NonCompliant)
        );
        assert_eq!(
            interpret_response(&json!({ "conclusion": "needs review" }), false),
            ResponseOutcome::Verdict(Verdict::Indeterminate)
        );
        assert!(matches!(interpret_response(&json!({}), false), ResponseOutcome::Failed(_)));
    }

    #[test]
    fn test_error_codes() {
        let expired = json!({ "error_code": 111, "error_msg": "Access token expired" });
        assert!(matches!(
            interpret_response(&expired, false),
            ResponseOutcome::Retry { refresh_token: true, .. }
        ));

        let qps = json!({ "error_code": 18, "error_msg": "Open api qps request limit reached" });
        assert!(matches!(
            interpret_response(&qps, false),
            ResponseOutcome::Retry { refresh_token: false, .. }
        ));

        let bad_image = json!({ "error_code": 216201, "error_msg": "image format error" });
        assert_eq!(
            interpret_response(&bad_image, false),
            ResponseOutcome::Failed("error_code 216201: image format error".into())
        );
    }

    #[test]
    fn test_form_bodies_are_urlencoded() {
        // base64 of [0xfb, 0xff] is "+/8=" which must be escaped
        assert_eq!(image_form_body(&[0xfb, 0xff]), "image=%2B%2F8%3D");
        assert_eq!(text_form_body("a b&c"), "text=a%20b%26c");
    }

    #[test]
    fn test_token_response_parsing() {
        let now = Utc::now();
        let token = parse_token_response(
            TokenResponse {
                access_token: Some("abc".into()),
                expires_in: Some(3600),
                error: None,
                error_description: None,
            },
            now,
        )
        .unwrap();
        assert_eq!(token.value, "abc");
        assert_eq!(token.expires_at, now + ChronoDuration::seconds(3540));
        assert!(token.is_valid(now));
        assert!(!token.is_valid(now + ChronoDuration::seconds(3600)));

        let err = parse_token_response(
            TokenResponse {
                access_token: None,
                expires_in: None,
                error: Some("invalid_client".into()),
                error_description: Some("unknown client id".into()),
            },
            now,
        )
        .unwrap_err();
        assert!(matches!(err, ModerationError::ClassifierUnavailable(_)));
    }

    #[test]
    fn test_oversized_token_lifetime_is_clamped() {
        let now = Utc::now();
        let token = parse_token_response(
            TokenResponse {
                access_token: Some("abc".into()),
                expires_in: Some(i64::MAX),
                error: None,
                error_description: None,
            },
            now,
        )
        .unwrap();
        assert_eq!(
            token.expires_at,
            now + ChronoDuration::seconds(MAX_TOKEN_LIFETIME_SECS - TOKEN_EXPIRY_MARGIN_SECS)
        );

        let token = parse_token_response(
            TokenResponse {
                access_token: Some("abc".into()),
                expires_in: Some(i64::MIN),
                error: None,
                error_description: None,
            },
            now,
        )
        .unwrap();
        assert!(!token.is_valid(now));
    }

    #[test]
    fn test_requires_credentials() {
        let err = BaiduClassifier::new(BaiduConfig::default()).err().unwrap();
        assert!(matches!(err, ModerationError::Config(_)));
        assert!(BaiduClassifier::new(config()).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_is_unavailable() {
        let classifier = BaiduClassifier::new(BaiduConfig {
            token_endpoint: "http://127.0.0.1:9/oauth/2.0/token".into(),
            timeout_seconds: 2,
            ..config()
        })
        .unwrap();

        let err = classifier.prepare().await.unwrap_err();
        assert!(matches!(err, ModerationError::ClassifierUnavailable(_)));
    }

    /// Local stand-in for the token and censor endpoints. Censor calls are
    /// answered from `replies` in order; tokens are numbered `tok-1`, `tok-2`...
    struct ScriptedProvider {
        addr: SocketAddr,
        token_requests: Arc<AtomicUsize>,
        censor_tokens: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        async fn start(replies: Vec<(u16, serde_json::Value)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let token_requests = Arc::new(AtomicUsize::new(0));
            let censor_tokens = Arc::new(Mutex::new(Vec::new()));
            let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

            let tokens = token_requests.clone();
            let seen = censor_tokens.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let request = read_request(&mut stream).await;
                    let target = request
                        .lines()
                        .next()
                        .and_then(|line| line.split(' ').nth(1))
                        .unwrap_or_default()
                        .to_string();

                    let (status, body) = if target.starts_with("/token") {
                        let n = tokens.fetch_add(1, Ordering::SeqCst) + 1;
                        (200, json!({ "access_token": format!("tok-{}", n), "expires_in": 3600 }))
                    } else {
                        let token = target.split("access_token=").nth(1).unwrap_or_default();
                        seen.lock().unwrap().push(token.to_string());
                        replies.lock().unwrap().pop_front().unwrap_or((503, json!({})))
                    };

                    let body = body.to_string();
                    let response = format!(
                        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            });

            Self {
                addr,
                token_requests,
                censor_tokens,
            }
        }

        fn config(&self, max_retries: u32, retry_backoff_ms: u64) -> BaiduConfig {
            BaiduConfig {
                token_endpoint: format!("http://{}/token", self.addr),
                image_endpoint: format!("http://{}/censor/image", self.addr),
                text_endpoint: format!("http://{}/censor/text", self.addr),
                timeout_seconds: 5,
                max_retries,
                retry_backoff_ms,
                ..config()
            }
        }

        fn censor_calls(&self) -> usize {
            self.censor_tokens.lock().unwrap().len()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn test_retries_transient_failures_and_refreshes_rejected_token() {
        let provider = ScriptedProvider::start(vec![
            (500, json!({})),
            (200, json!({ "error_code": 111, "error_msg": "Access token expired" })),
            (200, json!({ "error_code": 18, "error_msg": "Open api qps request limit reached" })),
            (200, json!({ "conclusion": "不合规", "conclusionType": 2 })),
        ])
        .await;
        let classifier = BaiduClassifier::new(provider.config(3, 1)).unwrap();

        let classification = classifier.classify_image(b"frame").await.unwrap();

        assert_eq!(classification.verdict, Verdict::NonCompliant);
        assert_eq!(classification.raw["conclusionType"], 2);
        assert_eq!(provider.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(
            *provider.censor_tokens.lock().unwrap(),
            vec!["tok-1", "tok-1", "tok-2", "tok-2"]
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries_with_backoff() {
        let provider = ScriptedProvider::start(vec![]).await;
        let classifier = BaiduClassifier::new(provider.config(2, 20)).unwrap();

        let started = Instant::now();
        let err = classifier.classify_text("hello").await.unwrap_err();

        match err {
            ModerationError::Classifier(message) => {
                assert!(message.starts_with("giving up after 3 attempts"), "{}", message);
            }
            other => panic!("expected classifier error, got {:?}", other),
        }
        assert_eq!(provider.censor_calls(), 3);
        // 20ms then 40ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(provider.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let provider = ScriptedProvider::start(vec![
            (400, json!({ "error": "bad request" })),
            (200, json!({ "error_code": 216201, "error_msg": "image format error" })),
        ])
        .await;
        let classifier = BaiduClassifier::new(provider.config(3, 1)).unwrap();

        let err = classifier.classify_image(b"frame").await.unwrap_err();
        assert!(matches!(err, ModerationError::Classifier(ref m) if m.starts_with("HTTP 400")));
        assert_eq!(provider.censor_calls(), 1);

        let err = classifier.classify_image(b"frame").await.unwrap_err();
        assert!(matches!(err, ModerationError::Classifier(ref m) if m.contains("216201")));
        assert_eq!(provider.censor_calls(), 2);
    }
}
