use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("invalid environment value {key}: {message}")]
    Env { key: &'static str, message: String },
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub discord: Discord,
    pub upstream: Upstream,
    pub registration: Registration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub listen_addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Discord {
    pub application_id: Option<String>,
    pub bot_token: Option<String>,
    pub public_key: Option<String>,
    pub api_base: String,
}

impl Default for Discord {
    fn default() -> Self {
        Self {
            application_id: None,
            bot_token: None,
            public_key: None,
            api_base: "https://discord.com/api/v10".to_string(),
        }
    }
}

impl fmt::Debug for Discord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discord")
            .field("application_id", &self.application_id)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key)
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub enabled: bool,
    pub description: String,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            enabled: false,
            description: "Polls the current daily reward streak".to_string(),
        }
    }
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

pub fn load(path: Option<&str>) -> Result<Config, ConfigError> {
    let base = match path {
        Some(p) => load_and_validate(p)?,
        None => Config::default(),
    };
    let cfg = apply_env(base, |key| std::env::var(key).ok())?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

pub fn apply_env<F>(mut cfg: Config, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    // First non-empty value wins; lower-case names are the legacy deployment keys.
    let first = |keys: &[&str]| keys.iter().find_map(|&k| get(k));

    if let Some(v) = get("LISTEN_ADDR") {
        cfg.server.listen_addr = v;
    }
    if let Some(v) = first(&[
        "DISCORD_APPLICATION_ID",
        "DISCORD_CLIENT_ID",
        "discord_client_id",
    ]) {
        cfg.discord.application_id = Some(v);
    }
    if let Some(v) = first(&["DISCORD_BOT_TOKEN", "discord-bot-token"]) {
        cfg.discord.bot_token = Some(v);
    }
    if let Some(v) = first(&[
        "DISCORD_PUBLIC_KEY",
        "discord_public_key",
        "discord-public-key",
    ]) {
        cfg.discord.public_key = Some(v.trim().to_string());
    }
    if let Some(v) = get("DISCORD_API_BASE") {
        cfg.discord.api_base = v;
    }
    if let Some(v) = first(&["STREAK_API_URL", "api_url", "api-url"]) {
        cfg.upstream.url = Some(v);
    }
    if let Some(v) = get("STREAK_API_TIMEOUT_MS") {
        cfg.upstream.timeout_ms = v.trim().parse().map_err(|e| ConfigError::Env {
            key: "STREAK_API_TIMEOUT_MS",
            message: format!("{e}"),
        })?;
    }
    if let Some(v) = get("REGISTER_COMMANDS") {
        cfg.registration.enabled = parse_flag(&v).ok_or_else(|| ConfigError::Env {
            key: "REGISTER_COMMANDS",
            message: format!("expected a boolean, got {v:?}"),
        })?;
    }
    Ok(cfg)
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.listen_addr.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "server.listen_addr={} is not a socket address",
            cfg.server.listen_addr
        )));
    }
    if !is_http_url(&cfg.discord.api_base) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "discord.api_base={} must be an http(s) URL",
            cfg.discord.api_base
        )));
    }
    if let Some(url) = &cfg.upstream.url {
        if !is_http_url(url) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "upstream.url={url} must be an http(s) URL"
            )));
        }
    }
    if cfg.upstream.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "upstream.timeout_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn is_http_url(v: &str) -> bool {
    v.starts_with("http://") || v.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("streakbot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:8080"

discord:
  application_id: "1242937339886436525"
  api_base: "https://discord.com/api/v10"

upstream:
  url: "https://streaks.example.com/api/status"
  timeout_ms: 2500

registration:
  enabled: false
"#
        .to_string()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn loads_yaml_file() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(
            cfg.discord.application_id.as_deref(),
            Some("1242937339886436525")
        );
        assert_eq!(cfg.upstream.timeout_ms, 2500);
        assert!(cfg.discord.public_key.is_none());
    }

    #[test]
    fn rejects_unknown_keys_via_schema() {
        let path = write_temp_config(&base_yaml().replace("timeout_ms", "timeout_millis"));
        let err = load_and_validate(&path).expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_zero_timeout_via_schema() {
        let path = write_temp_config(&base_yaml().replace("2500", "0"));
        let err = load_and_validate(&path).expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn zero_timeout_from_env_is_rejected_at_runtime() {
        let mut cfg = Config::default();
        cfg.upstream.timeout_ms = 0;
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let path = write_temp_config(&base_yaml());
        let file_cfg = load_and_validate(&path).unwrap();
        let cfg = apply_env(
            file_cfg,
            env_of(&[
                ("DISCORD_CLIENT_ID", "42"),
                ("DISCORD_PUBLIC_KEY", "  abcd  "),
                ("STREAK_API_URL", "http://127.0.0.1:9000/streak"),
                ("REGISTER_COMMANDS", "yes"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.discord.application_id.as_deref(), Some("42"));
        assert_eq!(cfg.discord.public_key.as_deref(), Some("abcd"));
        assert_eq!(
            cfg.upstream.url.as_deref(),
            Some("http://127.0.0.1:9000/streak")
        );
        assert!(cfg.registration.enabled);
        assert_eq!(cfg.upstream.timeout_ms, 2500);
    }

    #[test]
    fn application_id_wins_over_client_id_alias() {
        let cfg = apply_env(
            Config::default(),
            env_of(&[
                ("DISCORD_APPLICATION_ID", "1"),
                ("DISCORD_CLIENT_ID", "2"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.discord.application_id.as_deref(), Some("1"));
    }

    #[test]
    fn legacy_lowercase_keys_are_accepted() {
        let key = "ab".repeat(32);
        let cfg = apply_env(
            Config::default(),
            env_of(&[
                ("discord_public_key", key.as_str()),
                ("discord_client_id", "1"),
                ("discord-bot-token", "legacy-token"),
                ("api_url", "http://x/y"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.discord.public_key.as_deref(), Some(key.as_str()));
        assert_eq!(cfg.discord.application_id.as_deref(), Some("1"));
        assert_eq!(cfg.discord.bot_token.as_deref(), Some("legacy-token"));
        assert_eq!(cfg.upstream.url.as_deref(), Some("http://x/y"));
    }

    #[test]
    fn hyphenated_legacy_keys_are_accepted() {
        let cfg = apply_env(
            Config::default(),
            env_of(&[
                ("discord-public-key", "cd"),
                ("api-url", "http://x/z"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.discord.public_key.as_deref(), Some("cd"));
        assert_eq!(cfg.upstream.url.as_deref(), Some("http://x/z"));
    }

    #[test]
    fn current_keys_win_over_legacy_keys() {
        let cfg = apply_env(
            Config::default(),
            env_of(&[
                ("DISCORD_PUBLIC_KEY", "aa"),
                ("discord_public_key", "bb"),
                ("STREAK_API_URL", "http://new/streak"),
                ("api_url", "http://old/streak"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.discord.public_key.as_deref(), Some("aa"));
        assert_eq!(cfg.upstream.url.as_deref(), Some("http://new/streak"));
    }

    #[test]
    fn empty_env_values_are_unset() {
        let cfg = apply_env(Config::default(), env_of(&[("DISCORD_BOT_TOKEN", "  ")])).unwrap();
        assert!(cfg.discord.bot_token.is_none());
    }

    #[test]
    fn bad_timeout_env_is_rejected() {
        let err = apply_env(
            Config::default(),
            env_of(&[("STREAK_API_TIMEOUT_MS", "soon")]),
        )
        .expect_err("expected env error");
        assert!(matches!(
            err,
            ConfigError::Env {
                key: "STREAK_API_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn bad_flag_env_is_rejected() {
        let err = apply_env(Config::default(), env_of(&[("REGISTER_COMMANDS", "maybe")]))
            .expect_err("expected env error");
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn debug_output_redacts_bot_token() {
        let mut cfg = Config::default();
        cfg.discord.bot_token = Some("super-secret".to_string());
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn defaults_pass_runtime_validation() {
        assert!(validate_runtime_support(&Config::default()).is_ok());
    }

    #[test]
    fn non_http_upstream_url_is_rejected() {
        let mut cfg = Config::default();
        cfg.upstream.url = Some("ftp://streaks".to_string());
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
    }
}
