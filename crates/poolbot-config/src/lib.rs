//! Poolbot Configuration
//!
//! TOML configuration loading and validation for the account pool and bot

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 500;
pub const DEFAULT_CONVERSATION_SEPARATOR: &str = "- - - - - - - - - - - - - - -";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub derivation: Option<DerivationConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    pub cache_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default)]
    pub ignored_senders: Vec<String>,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_conversation_separator")]
    pub conversation_separator: String,
    #[serde(default = "default_true")]
    pub quote_group_prompt: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            ignored_senders: Vec::new(),
            max_message_chars: default_max_message_chars(),
            conversation_separator: default_conversation_separator(),
            quote_group_prompt: true,
        }
    }
}

impl BotConfig {
    /// The `@name` token users type to address the bot in a group.
    pub fn mention_token(&self) -> String {
        format!("@{}", self.name.trim().trim_start_matches('@'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivationConfig {
    pub command: String,
    #[serde(default = "default_derivation_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_inbound_concurrency")]
    pub max_inbound_concurrency: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
            max_inbound_concurrency: default_max_inbound_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub identity: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind<'a> {
    /// Already holds a usable session credential.
    SessionToken(&'a str),
    /// Holds identity + secret; the session credential must be derived.
    Password(&'a str),
}

impl AccountKind<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            AccountKind::SessionToken(_) => "session_token",
            AccountKind::Password(_) => "password",
        }
    }
}

impl AccountConfig {
    pub fn kind(&self) -> anyhow::Result<AccountKind<'_>> {
        let token = self
            .session_token
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let password = self.password.as_deref().filter(|v| !v.is_empty());

        match (token, password) {
            (Some(token), None) => Ok(AccountKind::SessionToken(token)),
            (None, Some(password)) => Ok(AccountKind::Password(password)),
            (Some(_), Some(_)) => anyhow::bail!(
                "Account '{}' sets both session_token and password",
                self.identity
            ),
            (None, None) => anyhow::bail!(
                "Account '{}' needs either session_token or password",
                self.identity
            ),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bot_name() -> String {
    "poolbot".to_string()
}

fn default_max_message_chars() -> usize {
    DEFAULT_MAX_MESSAGE_CHARS
}

fn default_conversation_separator() -> String {
    DEFAULT_CONVERSATION_SEPARATOR.to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_derivation_timeout_secs() -> u64 {
    120
}

fn default_send_timeout_secs() -> u64 {
    60
}

fn default_max_inbound_concurrency() -> usize {
    8
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("poolbot").join("config.toml"))
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = self.core.data_dir.as_deref() {
            return Ok(expand_home(dir));
        }
        dirs::home_dir()
            .map(|home| home.join(".poolbot"))
            .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory for data_dir"))
    }

    pub fn cache_path(&self) -> anyhow::Result<PathBuf> {
        let file = self.core.cache_file.as_deref().unwrap_or("cache.json");
        let path = expand_home(file);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.data_dir()?.join(path))
        }
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.accounts.is_empty() {
            anyhow::bail!("At least one [[accounts]] entry is required");
        }

        let mut identities = HashSet::new();
        let mut needs_derivation = false;
        for account in &self.accounts {
            let identity = account.identity.trim();
            if identity.is_empty() {
                anyhow::bail!("Account identity cannot be empty");
            }
            if !identities.insert(identity.to_string()) {
                anyhow::bail!("Duplicate account identity '{}'", identity);
            }
            if matches!(account.kind()?, AccountKind::Password(_)) {
                needs_derivation = true;
            }
        }

        if needs_derivation {
            let command = self
                .derivation
                .as_ref()
                .map(|d| d.command.trim())
                .unwrap_or_default();
            if command.is_empty() {
                anyhow::bail!("Password accounts require [derivation].command");
            }
        }
        if let Some(derivation) = &self.derivation {
            if derivation.timeout_secs == 0 {
                anyhow::bail!("derivation.timeout_secs must be greater than zero");
            }
        }

        let name = self.bot.name.trim().trim_start_matches('@');
        if name.is_empty() {
            anyhow::bail!("bot.name cannot be empty");
        }
        if self.bot.max_message_chars == 0 {
            anyhow::bail!("bot.max_message_chars must be greater than zero");
        }
        if self.bot.conversation_separator.is_empty() {
            anyhow::bail!("bot.conversation_separator cannot be empty");
        }

        if self.upstream.base_url.trim().is_empty() {
            anyhow::bail!("upstream.base_url cannot be empty");
        }
        if self.router.send_timeout_secs == 0 {
            anyhow::bail!("router.send_timeout_secs must be greater than zero");
        }
        if self.router.max_inbound_concurrency == 0 {
            anyhow::bail!("router.max_inbound_concurrency must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AccountKind, Config};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn validate_accepts_mixed_account_kinds() {
        let cfg = parse_config(
            r#"
[bot]
name = "helper"

[derivation]
command = "python3 generate_session.py {identity} {secret}"

[[accounts]]
identity = "a@example.com"
session_token = "tok-a"

[[accounts]]
identity = "b@example.com"
password = "hunter2"
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.accounts[0].kind().unwrap(),
            AccountKind::SessionToken("tok-a")
        );
        assert_eq!(cfg.accounts[1].kind().unwrap(), AccountKind::Password("hunter2"));
    }

    #[test]
    fn defaults_fill_bot_and_router_sections() {
        let cfg = parse_config(
            r#"
[[accounts]]
identity = "a"
session_token = "t"
"#,
        );
        assert_eq!(cfg.bot.max_message_chars, 500);
        assert_eq!(cfg.bot.mention_token(), "@poolbot");
        assert_eq!(cfg.router.send_timeout_secs, 60);
        assert_eq!(cfg.router.retry.max_retries, 0);
        assert_eq!(cfg.log_level(), "info");
    }

    #[test]
    fn validate_rejects_empty_account_list() {
        let cfg = parse_config("[bot]\nname = \"x\"\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_identities() {
        let cfg = parse_config(
            r#"
[[accounts]]
identity = "a"
session_token = "t1"

[[accounts]]
identity = "a"
session_token = "t2"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_account_with_both_credentials() {
        let cfg = parse_config(
            r#"
[derivation]
command = "derive {identity} {secret}"

[[accounts]]
identity = "a"
session_token = "t"
password = "p"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_password_account_without_derivation_command() {
        let cfg = parse_config(
            r#"
[[accounts]]
identity = "a"
password = "p"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let cfg = parse_config(
            r#"
[bot]
max_message_chars = 0

[[accounts]]
identity = "a"
session_token = "t"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mention_token_strips_leading_at() {
        let cfg = parse_config(
            r#"
[bot]
name = "@helper"

[[accounts]]
identity = "a"
session_token = "t"
"#,
        );
        assert_eq!(cfg.bot.mention_token(), "@helper");
    }

    #[test]
    fn relative_cache_file_lands_in_data_dir() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/tmp/poolbot-test"
cache_file = "tokens.json"

[[accounts]]
identity = "a"
session_token = "t"
"#,
        );
        assert_eq!(
            cfg.cache_path().unwrap(),
            std::path::PathBuf::from("/tmp/poolbot-test/tokens.json")
        );
    }
}
