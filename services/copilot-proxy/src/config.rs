//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Refresh credentials are loaded from the REFRESH_TOKEN env var or
//! `pool.refresh_token_file`, never stored in the TOML directly to avoid
//! leaking secrets.

use common::Secret;
use copilot_pool::{DispatchPolicy, ExchangePolicy, PoolConfig, RateGate};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::limits::RateLimitRule;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream API settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub chat_completions_url: String,
    pub models_url: String,
    pub token_endpoint: String,
    pub editor_version: String,
    pub timeout_secs: u64,
    pub dispatch_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            chat_completions_url: copilot_auth::CHAT_COMPLETIONS_ENDPOINT.to_string(),
            models_url: copilot_auth::MODELS_ENDPOINT.to_string(),
            token_endpoint: copilot_auth::TOKEN_ENDPOINT.to_string(),
            editor_version: copilot_auth::DEFAULT_EDITOR_VERSION.to_string(),
            timeout_secs: 300,
            dispatch_retries: 2,
        }
    }
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub active_token_index: usize,
    pub exchange_timeout_secs: u64,
    pub exchange_retries: u32,
    pub safety_margin_secs: u64,
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    /// 0 disables the background refresh task
    pub refresh_interval_secs: u64,
    /// File with comma- or newline-separated refresh credentials
    /// (alternative to the REFRESH_TOKEN env var)
    pub refresh_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_tokens: Vec<Secret<String>>,
    #[serde(skip)]
    pub gate: RateGate,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            active_token_index: 0,
            exchange_timeout_secs: 300,
            exchange_retries: 2,
            safety_margin_secs: 300,
            min_delay_seconds: 0.0,
            max_delay_seconds: 0.0,
            refresh_interval_secs: 60,
            refresh_token_file: None,
            refresh_tokens: Vec::new(),
            gate: RateGate::disabled(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Refresh credential resolution order:
    /// 1. REFRESH_TOKEN env var (comma-separated)
    /// 2. refresh_token_file path from config
    ///
    /// ACTIVE_TOKEN_INDEX overrides `pool.active_token_index`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(raw) = std::env::var("REFRESH_TOKEN") {
            config.pool.refresh_tokens = parse_refresh_tokens(&raw)?;
        } else if let Some(ref file) = config.pool.refresh_token_file {
            let raw = std::fs::read_to_string(file).map_err(|e| {
                common::Error::config(format!(
                    "failed to read refresh_token_file {}: {e}",
                    file.display()
                ))
            })?;
            config.pool.refresh_tokens = parse_refresh_tokens(&raw.replace('\n', ","))?;
        } else {
            return Err(common::Error::config(
                "no refresh credentials: set REFRESH_TOKEN or pool.refresh_token_file",
            ));
        }

        if let Ok(raw) = std::env::var("ACTIVE_TOKEN_INDEX") {
            config.pool.active_token_index = raw.trim().parse().map_err(|_| {
                common::Error::config(format!(
                    "ACTIVE_TOKEN_INDEX must be a non-negative integer, got: {raw}"
                ))
            })?;
        }

        let size = config.pool.refresh_tokens.len();
        if config.pool.active_token_index >= size {
            return Err(common::Error::config(format!(
                "active_token_index {} out of range for {size} credential(s)",
                config.pool.active_token_index
            )));
        }

        Ok(config)
    }

    fn validate(&mut self) -> common::Result<()> {
        for (name, url) in [
            ("chat_completions_url", &self.upstream.chat_completions_url),
            ("models_url", &self.upstream.models_url),
            ("token_endpoint", &self.upstream.token_endpoint),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::config("timeout_secs must be greater than 0"));
        }
        if self.pool.exchange_timeout_secs == 0 {
            return Err(common::Error::config(
                "exchange_timeout_secs must be greater than 0",
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }

        self.pool.gate = RateGate::new(self.pool.min_delay_seconds, self.pool.max_delay_seconds)
            .map_err(|e| common::Error::config(e.to_string()))?;

        for rule in &self.rate_limits {
            rule.validate().map_err(common::Error::config)?;
        }
        Ok(())
    }

    /// Pool construction parameters. Consumes the loaded credentials.
    pub fn pool_config(&mut self) -> PoolConfig {
        PoolConfig {
            secrets: std::mem::take(&mut self.pool.refresh_tokens),
            initial_index: self.pool.active_token_index,
            exchange: ExchangePolicy {
                safety_margin: Duration::from_secs(self.pool.safety_margin_secs),
                timeout: Duration::from_secs(self.pool.exchange_timeout_secs),
                max_retries: self.pool.exchange_retries,
                ..ExchangePolicy::default()
            },
            dispatch: DispatchPolicy {
                timeout: Duration::from_secs(self.upstream.timeout_secs),
                retries: self.upstream.dispatch_retries,
                ..DispatchPolicy::default()
            },
            gate: self.pool.gate,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-proxy.toml")
    }
}

/// Split a comma-separated credential list. Entries are trimmed; an empty
/// entry is an error rather than silently shifting every index after it.
/// OAuth refresh credentials issued by GitHub carry this prefix.
const REFRESH_TOKEN_PREFIX: &str = "gho_";

pub fn parse_refresh_tokens(raw: &str) -> common::Result<Vec<Secret<String>>> {
    let raw = raw.trim().trim_end_matches(',');
    if raw.is_empty() {
        return Err(common::Error::config("refresh credential list is empty"));
    }
    raw.split(',')
        .enumerate()
        .map(|(i, entry)| {
            let entry = entry.trim();
            if entry.is_empty() {
                Err(common::Error::config(format!(
                    "refresh credential at position {i} is empty"
                )))
            } else if !entry.starts_with(REFRESH_TOKEN_PREFIX) {
                Err(common::Error::config(format!(
                    "refresh credential at position {i} does not start with {REFRESH_TOKEN_PREFIX}"
                )))
            } else {
                Ok(Secret::from(entry))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_env() {
        unsafe {
            remove_env("REFRESH_TOKEN");
            remove_env("ACTIVE_TOKEN_INDEX");
        }
    }

    fn write_config(name: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("copilot-proxy-test-{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:15432"
"#;

    #[test]
    fn test_load_minimal_config_with_env_credentials() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config("minimal", MINIMAL);

        unsafe { set_env("REFRESH_TOKEN", "gho_one, gho_two ,gho_three") };
        let config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.upstream.timeout_secs, 300);
        assert_eq!(config.upstream.editor_version, "vscode/1.97.2");
        assert_eq!(
            config.upstream.token_endpoint,
            "https://api.github.com/copilot_internal/v2/token"
        );
        assert_eq!(config.pool.refresh_interval_secs, 60);
        assert!(config.pool.gate.is_disabled());
        let tokens: Vec<&str> = config
            .pool
            .refresh_tokens
            .iter()
            .map(|s| s.expose().as_str())
            .collect();
        assert_eq!(tokens, vec!["gho_one", "gho_two", "gho_three"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config(
            "full",
            r#"
[server]
listen_addr = "0.0.0.0:8080"
max_connections = 50

[upstream]
chat_completions_url = "http://localhost:9000/chat/completions"
timeout_secs = 30
dispatch_retries = 1

[pool]
active_token_index = 1
exchange_retries = 4
min_delay_seconds = 0.5
max_delay_seconds = 2.0
refresh_interval_secs = 0

[[rate_limits]]
model = "gpt-4o"
window_minutes = 1
requests = 10
behavior = "delay"

[[rate_limits]]
model = "o1"
window_minutes = 60
total_tokens = 50000
"#,
        );

        unsafe { set_env("REFRESH_TOKEN", "gho_a,gho_b") };
        let mut config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.upstream.models_url, copilot_auth::MODELS_ENDPOINT);
        assert_eq!(config.rate_limits.len(), 2);
        assert_eq!(config.rate_limits[1].total_tokens, Some(50_000));
        assert_eq!(config.rate_limits[1].requests, None);

        let pool = config.pool_config();
        assert_eq!(pool.initial_index, 1);
        assert_eq!(pool.secrets.len(), 2);
        assert_eq!(pool.dispatch.timeout, Duration::from_secs(30));
        assert_eq!(pool.dispatch.retries, 1);
        assert_eq!(pool.exchange.max_retries, 4);
        assert_eq!(pool.gate.min(), Duration::from_millis(500));
        assert_eq!(pool.gate.max(), Duration::from_secs(2));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_credentials_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = std::env::temp_dir().join("copilot-proxy-test-token-file");
        std::fs::create_dir_all(&dir).unwrap();
        let token_path = dir.join("tokens");
        std::fs::write(&token_path, "gho_file_a\ngho_file_b\n").unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            format!(
                "{MINIMAL}\n[pool]\nrefresh_token_file = \"{}\"\n",
                token_path.display()
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.refresh_tokens.len(), 2);
        assert_eq!(config.pool.refresh_tokens[1].expose(), "gho_file_b");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_credentials_override_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config(
            "env-over-file",
            &format!("{MINIMAL}\n[pool]\nrefresh_token_file = \"/nonexistent/tokens\"\n"),
        );

        unsafe { set_env("REFRESH_TOKEN", "gho_env") };
        let config = Config::load(&path).unwrap();
        clear_env();
        assert_eq!(config.pool.refresh_tokens[0].expose(), "gho_env");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config("no-creds", MINIMAL);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("no refresh credentials"), "got: {err}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_active_index_env_override_and_range_check() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config("active-index", MINIMAL);

        unsafe {
            set_env("REFRESH_TOKEN", "gho_a,gho_b,gho_c");
            set_env("ACTIVE_TOKEN_INDEX", "2");
        }
        assert_eq!(Config::load(&path).unwrap().pool.active_token_index, 2);

        unsafe { set_env("ACTIVE_TOKEN_INDEX", "3") };
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("out of range"), "got: {err}");

        unsafe { set_env("ACTIVE_TOKEN_INDEX", "first") };
        assert!(Config::load(&path).is_err());
        clear_env();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_inverted_delay_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config(
            "bad-delay",
            &format!("{MINIMAL}\n[pool]\nmin_delay_seconds = 3.0\nmax_delay_seconds = 1.0\n"),
        );
        unsafe { set_env("REFRESH_TOKEN", "gho_a") };
        let err = Config::load(&path).unwrap_err().to_string();
        clear_env();
        assert!(err.contains("max_delay_seconds"), "got: {err}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (dir, path) = write_config(
            "bad-url",
            &format!("{MINIMAL}\n[upstream]\nmodels_url = \"api.example.com/models\"\n"),
        );
        unsafe { set_env("REFRESH_TOKEN", "gho_a") };
        let err = Config::load(&path).unwrap_err().to_string();
        clear_env();
        assert!(err.contains("models_url must start with http"), "got: {err}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_zero_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { set_env("REFRESH_TOKEN", "gho_a") };
        for (name, extra) in [
            ("zero-timeout", "[upstream]\ntimeout_secs = 0\n"),
            ("zero-exchange-timeout", "[pool]\nexchange_timeout_secs = 0\n"),
        ] {
            let (dir, path) = write_config(name, &format!("{MINIMAL}\n{extra}"));
            assert!(Config::load(&path).is_err(), "{name} must be rejected");
            std::fs::remove_dir_all(&dir).unwrap();
        }
        let (dir, path) = write_config(
            "zero-maxconn",
            "[server]\nlisten_addr = \"127.0.0.1:1\"\nmax_connections = 0\n",
        );
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
        clear_env();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_refresh_tokens() {
        assert_eq!(parse_refresh_tokens("gho_a, gho_b,gho_c,").unwrap().len(), 3);
        assert!(parse_refresh_tokens("").is_err());
        assert!(parse_refresh_tokens(" , ").is_err());
        let err = parse_refresh_tokens("gho_a,,gho_b").unwrap_err().to_string();
        assert!(err.contains("position 1"), "got: {err}");
    }

    #[test]
    fn test_refresh_token_prefix_required() {
        let err = parse_refresh_tokens("gho_a,ghp_personal_secret")
            .unwrap_err()
            .to_string();
        assert!(err.contains("position 1"), "got: {err}");
        assert!(err.contains("gho_"), "got: {err}");
        assert!(!err.contains("personal_secret"), "credential leaked: {err}");
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("copilot-proxy.toml"));
    }
}
