//! Session credential derivation through an external helper process.

use crate::{SessionDeriver, UpstreamError};
use anyhow::{anyhow, bail, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const IDENTITY_PLACEHOLDER: &str = "{identity}";
const SECRET_PLACEHOLDER: &str = "{secret}";
const MAX_STDERR_CHARS: usize = 400;

/// Runs a configured helper (e.g. `python3 generate_session.py {identity} {secret}`)
/// and takes the last non-empty stdout line as the credential. The identity and
/// secret are also exported as `POOLBOT_IDENTITY` / `POOLBOT_SECRET` so helpers
/// can avoid taking the secret on argv.
pub struct CommandDeriver {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDeriver {
    pub fn new(command: &str, timeout_secs: u64) -> Result<Self> {
        let tokens = shlex::split(command).ok_or_else(|| anyhow!("Invalid command syntax"))?;
        if tokens.is_empty() {
            bail!("Missing derivation command");
        }

        Ok(Self {
            program: tokens[0].clone(),
            args: tokens[1..].to_vec(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render_args(&self, identity: &str, secret: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace(IDENTITY_PLACEHOLDER, identity)
                    .replace(SECRET_PLACEHOLDER, secret)
            })
            .collect()
    }

    fn last_line(stdout: &str) -> Option<String> {
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(|line| line.to_string())
    }
}

fn truncate_output(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

#[async_trait::async_trait]
impl SessionDeriver for CommandDeriver {
    async fn derive(&self, identity: &str, secret: &str) -> Result<String, UpstreamError> {
        let mut process = Command::new(&self.program);
        process
            .args(self.render_args(identity, secret))
            .env("POOLBOT_IDENTITY", identity)
            .env("POOLBOT_SECRET", secret)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, process.output()).await {
            Ok(result) => result.map_err(|e| {
                UpstreamError::Derivation(format!("failed to execute '{}': {}", self.program, e))
            })?,
            Err(_) => return Err(UpstreamError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpstreamError::Derivation(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                truncate_output(&stderr, MAX_STDERR_CHARS)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::last_line(&stdout).ok_or_else(|| {
            UpstreamError::Derivation(format!("'{}' printed no credential", self.program))
        })
    }
}
