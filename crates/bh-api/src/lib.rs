//! Remote game API client: battle history, season metadata and login, with bounded
//! retry on rate limiting.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "bh-api";
pub const DEFAULT_BASE_URL: &str = "https://api.splinterlands.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate limiting is retried; every other HTTP error is terminal for the request.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Server retry hint in whole seconds, if present.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Exponential delay for `attempt_index`, replaced by the server hint when given;
    /// capped at `max_delay` either way.
    pub fn delay_for_attempt(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("still rate limited after {attempts} attempts for {url}")]
    RateLimited { url: String, attempts: usize },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("login rejected: {0}")]
    Login(String),
}

/// Username + token pair accepted by the authenticated endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub username: String,
    pub token: String,
}

/// Produces the hex signature the login endpoint expects for `message`.
#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign(&self, message: &str) -> anyhow::Result<String>;
}

/// Signs by running an external program with the message as its last argument and
/// reading the signature from stdout. Key handling stays with that program.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    program: String,
    args: Vec<String>,
}

impl CommandSigner {
    /// Split a whitespace-separated command line such as `hive-sign --key-file k`.
    pub fn from_command_line(command_line: &str) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().context("signer command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl MessageSigner for CommandSigner {
    async fn sign(&self, message: &str) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(message)
            .output()
            .await
            .with_context(|| format!("running signer {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "signer {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let signature = String::from_utf8(output.stdout)
            .with_context(|| format!("signer {} printed non-UTF-8 output", self.program))?
            .trim()
            .to_string();
        if signature.is_empty() {
            anyhow::bail!("signer {} printed no signature", self.program);
        }
        Ok(signature)
    }
}

/// Source of battle documents for a player.
#[async_trait]
pub trait BattleSource: Send + Sync {
    async fn battle_history(&self, player: &str) -> Result<Vec<JsonValue>, ApiError>;
}

/// Source of season metadata documents.
#[async_trait]
pub trait SeasonSource: Send + Sync {
    async fn season(&self, season_id: i64) -> Result<JsonValue, ApiError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    name: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` and return the body, retrying rate limits and connection failures.
    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0usize;

        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(&url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(ApiError::HttpStatus {
                            status: status.as_u16(),
                            url,
                        });
                    }
                    if !can_retry {
                        return Err(ApiError::RateLimited {
                            url,
                            attempts: attempt + 1,
                        });
                    }

                    let delay = self
                        .backoff
                        .delay_for_attempt(attempt, parse_retry_after(resp.headers()));
                    warn!(%url, attempt, delay_ms = delay.as_millis() as u64, "rate limited; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(ApiError::Request(err));
                    }
                    let delay = self.backoff.delay_for_attempt(attempt, None);
                    warn!(%url, attempt, error = %err, "request failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    pub async fn login(
        &self,
        username: &str,
        signer: &dyn MessageSigner,
    ) -> Result<AuthSession, ApiError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();
        let signature = signer
            .sign(&format!("{username}{ts}"))
            .await
            .map_err(|err| ApiError::Login(format!("signing failed: {err:#}")))?;

        let url = format!("{}/players/login", self.base_url);
        let body = self
            .get_text(
                "/players/login",
                &[("name", username), ("ts", &ts), ("sig", &signature)],
            )
            .await?;
        let response: LoginResponse =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode { url, source })?;

        match (response.name, response.token) {
            (Some(name), Some(token)) if name == username => {
                info!(username, "login succeeded");
                Ok(AuthSession {
                    username: name,
                    token,
                })
            }
            (name, _) => Err(ApiError::Login(format!(
                "unexpected response for {username} (name={name:?})"
            ))),
        }
    }

    /// Most recent battles of `player`; an empty list when the API reports none.
    pub async fn battle_history(
        &self,
        player: &str,
        session: &AuthSession,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let body = self
            .get_text(
                "/battle/history",
                &[
                    ("player", player),
                    ("username", &session.username),
                    ("token", &session.token),
                ],
            )
            .await?;

        if body.trim().is_empty() || body.contains("no battles") {
            debug!(player, "api reported no battles");
            return Ok(Vec::new());
        }

        let value: JsonValue = serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            url: format!("{}/battle/history", self.base_url),
            source,
        })?;
        Ok(value
            .get("battles")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn season(&self, season_id: i64) -> Result<JsonValue, ApiError> {
        let id = season_id.to_string();
        let body = self.get_text("/season", &[("id", &id)]).await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            url: format!("{}/season", self.base_url),
            source,
        })
    }

    pub fn authenticated(self, session: AuthSession) -> AuthenticatedClient {
        AuthenticatedClient {
            client: self,
            session,
        }
    }
}

#[async_trait]
impl SeasonSource for ApiClient {
    async fn season(&self, season_id: i64) -> Result<JsonValue, ApiError> {
        ApiClient::season(self, season_id).await
    }
}

/// Client bound to a login session.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    client: ApiClient,
    session: AuthSession,
}

impl AuthenticatedClient {
    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

#[async_trait]
impl BattleSource for AuthenticatedClient {
    async fn battle_history(&self, player: &str) -> Result<Vec<JsonValue>, ApiError> {
        self.client.battle_history(player, &self.session).await
    }
}
