use poolbot_providers::{SessionDeriver, UpstreamError};
use poolbot_storage::CredentialCache;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache-first session credential lookup for password accounts.
pub struct CredentialResolver {
    cache: Arc<CredentialCache>,
    deriver: Option<Arc<dyn SessionDeriver>>,
}

impl CredentialResolver {
    pub fn new(cache: Arc<CredentialCache>, deriver: Option<Arc<dyn SessionDeriver>>) -> Self {
        Self { cache, deriver }
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub async fn resolve(&self, identity: &str, secret: &str) -> Result<String, UpstreamError> {
        if let Some(credential) = self.cache.get(identity).await {
            debug!(account = %identity, "Session credential served from cache");
            return Ok(credential);
        }

        let deriver = self.deriver.as_ref().ok_or_else(|| {
            UpstreamError::Derivation("no derivation command configured".to_string())
        })?;

        info!(account = %identity, "Deriving session credential");
        let credential = deriver.derive(identity, secret).await?.trim().to_string();
        if credential.is_empty() {
            return Err(UpstreamError::Derivation(format!(
                "empty session credential for {}",
                identity
            )));
        }

        // Losing the write only costs one more derivation after restart.
        if let Err(err) = self.cache.set(identity, &credential).await {
            warn!(
                account = %identity,
                path = %self.cache.path().display(),
                error = %err,
                "Failed to persist session credential"
            );
        }

        Ok(credential)
    }
}
