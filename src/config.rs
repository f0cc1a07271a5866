//! Client configuration loading: timers, retry policy and local state paths.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::DurationMilliSeconds;
use tracing::{info, warn};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/client.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_VOTE_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the client.
pub struct ClientConfig {
    /// Lead-in between trivia activation and the answering phase.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub trivia_lead_in: Duration,
    /// Delay between entering `revealing` and showing the correct answer.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub trivia_reveal_delay: Duration,
    /// Countdown used when a trivia activity carries no `time_limit`.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub trivia_default_time_limit: Duration,
    /// Subscription attempts before the connection is reported disconnected.
    pub subscribe_max_attempts: u32,
    /// Retry delay grows by this step per failed attempt.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub subscribe_backoff_step: Duration,
    /// Upper bound of the retry delay.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub subscribe_backoff_max: Duration,
    /// How long a deleted id is shielded from resurrection without confirmation.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub pending_deletion_ttl: Duration,
    /// Full reload period while real-time is unavailable.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub polling_interval: Duration,
    /// Period of the store health check.
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub health_check_interval: Duration,
    /// Number of digits of generated room codes.
    pub room_code_length: usize,
    /// Where the participant profile is persisted; `None` keeps it in memory.
    pub participant_state_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded client config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Delay before retry number `attempt` (1-based): `min(attempt × step, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.subscribe_backoff_step
            .saturating_mul(attempt)
            .min(self.subscribe_backoff_max)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trivia_lead_in: Duration::from_secs(3),
            trivia_reveal_delay: Duration::from_secs(3),
            trivia_default_time_limit: Duration::from_secs(30),
            subscribe_max_attempts: 3,
            subscribe_backoff_step: Duration::from_secs(3),
            subscribe_backoff_max: Duration::from_secs(10),
            pending_deletion_ttl: Duration::from_secs(5),
            polling_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(15),
            room_code_length: 4,
            participant_state_path: Some(PathBuf::from("state/participant.json")),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
