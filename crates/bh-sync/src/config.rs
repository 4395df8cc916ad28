use std::path::PathBuf;
use std::time::Duration;

use bh_api::{ApiConfig, AuthSession, BackoffPolicy, DEFAULT_BASE_URL};
use bh_storage::StoreLayout;

/// Runtime settings for every harvester command, read from the environment.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub season_root: PathBuf,
    pub seasons_file: PathBuf,
    pub pending_requests_file: PathBuf,
    pub api_base_url: String,
    pub username: Option<String>,
    pub token: Option<String>,
    /// External program that signs login messages, used when no token is configured.
    pub signer_command: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub idle_secs: u64,
    pub player_delay_secs: u64,
    pub scheduler_enabled: bool,
    pub migrate_cron: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            data_dir: path("HARVEST_DATA_DIR", "./data"),
            season_root: path("HARVEST_SEASON_ROOT", "./Season"),
            seasons_file: path("HARVEST_SEASONS_FILE", "./seasons_data.json"),
            pending_requests_file: path("HARVEST_PENDING_REQUESTS_FILE", "./pending_requests.json"),
            api_base_url: lookup("SPL_API_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            username: non_empty("HIVE_USERNAME"),
            token: non_empty("SPL_TOKEN"),
            signer_command: non_empty("HARVEST_SIGNER_CMD"),
            user_agent: lookup("HARVEST_USER_AGENT")
                .unwrap_or_else(|| "battle-harvester/0.1".to_string()),
            http_timeout_secs: secs("HARVEST_HTTP_TIMEOUT_SECS", 30),
            idle_secs: secs("HARVEST_IDLE_SECS", 60),
            player_delay_secs: secs("HARVEST_PLAYER_DELAY_SECS", 5),
            scheduler_enabled: lookup("HARVEST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            migrate_cron: lookup("HARVEST_MIGRATE_CRON")
                .unwrap_or_else(|| "0 */10 * * * *".to_string()),
        }
    }

    pub fn store_layout(&self) -> StoreLayout {
        StoreLayout::new(self.data_dir.clone(), self.season_root.clone())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Session for the history endpoint, when both username and token are configured.
    pub fn auth_session(&self) -> Option<AuthSession> {
        match (&self.username, &self.token) {
            (Some(username), Some(token)) => Some(AuthSession {
                username: username.clone(),
                token: token.clone(),
            }),
            _ => None,
        }
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn player_delay(&self) -> Duration {
        Duration::from_secs(self.player_delay_secs)
    }
}
