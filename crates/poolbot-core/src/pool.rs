use crate::credentials::CredentialResolver;
use crate::error::PoolError;
use poolbot_config::{AccountConfig, AccountKind};
use poolbot_providers::{ClientFactory, UpstreamClient, UpstreamError};
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Configured session token used as-is.
    Static,
    /// Derived from identity + secret (possibly served from the cache).
    Derived,
}

impl CredentialSource {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialSource::Static => "static",
            CredentialSource::Derived => "derived",
        }
    }
}

/// A usable account: its credential is resolved and its client is live.
pub struct PoolEntry {
    identity: String,
    source: CredentialSource,
    client: Arc<dyn UpstreamClient>,
}

impl PoolEntry {
    pub fn new(identity: &str, source: CredentialSource, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            identity: identity.to_string(),
            source,
            client,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("identity", &self.identity)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ExcludedAccount {
    pub identity: String,
    pub reason: String,
}

/// Fixed set of usable accounts, read-only once initialized.
pub struct AccountPool {
    entries: Vec<Arc<PoolEntry>>,
    excluded: Vec<ExcludedAccount>,
}

impl AccountPool {
    pub fn from_entries(entries: Vec<Arc<PoolEntry>>) -> Self {
        Self {
            entries,
            excluded: Vec::new(),
        }
    }

    /// Resolves every configured account concurrently. Accounts whose
    /// credential cannot be obtained are logged and left out; they never block
    /// the others.
    pub async fn initialize(
        accounts: &[AccountConfig],
        resolver: Arc<CredentialResolver>,
        factory: &dyn ClientFactory,
    ) -> Self {
        let mut tasks = JoinSet::new();

        for (index, account) in accounts.iter().enumerate() {
            let identity = account.identity.trim().to_string();
            let kind = account.kind().map(|kind| match kind {
                AccountKind::SessionToken(token) => (CredentialSource::Static, token.to_string()),
                AccountKind::Password(secret) => (CredentialSource::Derived, secret.to_string()),
            });
            let resolver = Arc::clone(&resolver);

            tasks.spawn(async move {
                let outcome = match kind {
                    Ok((CredentialSource::Static, token)) => Ok((CredentialSource::Static, token)),
                    Ok((CredentialSource::Derived, secret)) => resolver
                        .resolve(&identity, &secret)
                        .await
                        .map(|credential| (CredentialSource::Derived, credential)),
                    Err(err) => Err(UpstreamError::Derivation(err.to_string())),
                };
                (index, identity, outcome)
            });
        }

        let mut resolved = Vec::with_capacity(accounts.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(item) => resolved.push(item),
                Err(err) => error!("Credential resolution task failed: {}", err),
            }
        }
        resolved.sort_by_key(|(index, _, _)| *index);

        let mut entries = Vec::new();
        let mut excluded = Vec::new();
        for (_, identity, outcome) in resolved {
            let connected = outcome.and_then(|(source, credential)| {
                factory
                    .connect(&identity, &credential)
                    .map(|client| PoolEntry::new(&identity, source, client))
            });

            match connected {
                Ok(entry) => {
                    info!(account = %identity, source = entry.source().label(), "Account ready");
                    entries.push(Arc::new(entry));
                }
                Err(err) => {
                    warn!(account = %identity, error = %err, "Account excluded from pool");
                    excluded.push(ExcludedAccount {
                        identity,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            usable = entries.len(),
            excluded = excluded.len(),
            "Account pool initialized"
        );

        Self { entries, excluded }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<PoolEntry>] {
        &self.entries
    }

    pub fn excluded(&self) -> &[ExcludedAccount] {
        &self.excluded
    }

    /// Fails with `PoolExhausted` when routing would be impossible.
    pub fn ensure_usable(&self) -> Result<(), PoolError> {
        if self.entries.is_empty() {
            return Err(PoolError::Exhausted);
        }
        Ok(())
    }

    /// Uniformly random usable account.
    pub fn pick(&self) -> Result<Arc<PoolEntry>, PoolError> {
        self.pick_with(&mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Arc<PoolEntry>, PoolError> {
        select_index(self.entries.len(), rng)
            .map(|index| Arc::clone(&self.entries[index]))
            .ok_or(PoolError::Exhausted)
    }
}

fn select_index<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Option<usize> {
    if len == 0 {
        None
    } else {
        Some(rng.gen_range(0..len))
    }
}
