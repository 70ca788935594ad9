//! Scripted upstream doubles shared by the unit tests.

use crate::pool::{AccountPool, CredentialSource, PoolEntry};
use poolbot_providers::{ClientFactory, Conversation, SessionDeriver, UpstreamClient, UpstreamError};
use poolbot_storage::CredentialCache;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn temp_cache(name: &str) -> Arc<CredentialCache> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("poolbot-core-{}-{}.json", name, nanos));
    Arc::new(CredentialCache::load(path))
}

pub(crate) struct CountingDeriver {
    calls: AtomicUsize,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl CountingDeriver {
    pub(crate) fn new() -> Self {
        Self::failing_for(&[])
    }

    pub(crate) fn failing_for(identities: &[&str]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: identities.iter().map(|s| s.to_string()).collect(),
            delay: None,
        }
    }

    /// Every derivation takes `delay`, like a slow login helper.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionDeriver for CountingDeriver {
    async fn derive(&self, identity: &str, _secret: &str) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(identity) {
            return Err(UpstreamError::Derivation(format!("login rejected for {}", identity)));
        }
        Ok(format!("derived-{}", identity))
    }
}

/// Behaviour shared by every client and conversation a factory produces.
#[derive(Default)]
struct Script {
    replies: HashMap<String, String>,
    failures: HashMap<String, VecDeque<UpstreamError>>,
    send_delay: Option<Duration>,
    open_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct StubFactory {
    script: Arc<Mutex<Script>>,
    opened: Arc<AtomicUsize>,
    credentials: Arc<Mutex<HashMap<String, String>>>,
}

impl StubFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn client(&self, identity: &str) -> Arc<dyn UpstreamClient> {
        Arc::new(StubClient {
            identity: identity.to_string(),
            script: Arc::clone(&self.script),
            opened: Arc::clone(&self.opened),
        })
    }

    pub(crate) fn set_replies(&self, pairs: &[(&str, &str)]) {
        let mut script = self.script.lock().expect("script lock");
        for (prompt, reply) in pairs {
            script.replies.insert(prompt.to_string(), reply.to_string());
        }
    }

    /// The next send through any conversation of `identity` fails with `err`.
    pub(crate) fn fail_next(&self, identity: &str, err: UpstreamError) {
        let mut script = self.script.lock().expect("script lock");
        script
            .failures
            .entry(identity.to_string())
            .or_default()
            .push_back(err);
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        self.script.lock().expect("script lock").send_delay = Some(delay);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.script.lock().expect("script lock").open_delay = Some(delay);
    }

    pub(crate) fn total_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn credential_for(&self, identity: &str) -> Option<String> {
        self.credentials
            .lock()
            .expect("credentials lock")
            .get(identity)
            .cloned()
    }
}

impl ClientFactory for StubFactory {
    fn connect(
        &self,
        identity: &str,
        session_credential: &str,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        self.credentials
            .lock()
            .expect("credentials lock")
            .insert(identity.to_string(), session_credential.to_string());
        Ok(self.client(identity))
    }
}

struct StubClient {
    identity: String,
    script: Arc<Mutex<Script>>,
    opened: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl UpstreamClient for StubClient {
    async fn open_conversation(&self) -> Result<Arc<dyn Conversation>, UpstreamError> {
        let delay = self.script.lock().expect("script lock").open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubConversation {
            id: format!("{}-conv-{}", self.identity, n),
            identity: self.identity.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

struct StubConversation {
    id: String,
    identity: String,
    script: Arc<Mutex<Script>>,
}

#[async_trait::async_trait]
impl Conversation for StubConversation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, text: &str) -> Result<String, UpstreamError> {
        let (failure, reply, delay) = {
            let mut script = self.script.lock().expect("script lock");
            let failure = script
                .failures
                .get_mut(&self.identity)
                .and_then(|queue| queue.pop_front());
            let reply = script
                .replies
                .get(text)
                .cloned()
                .unwrap_or_else(|| format!("echo: {}", text));
            (failure, reply, script.send_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }
}

/// Pool of stub accounts, one client per identity, all sharing one script.
pub(crate) fn stub_pool(identities: &[&str]) -> (Arc<AccountPool>, StubFactory) {
    let factory = StubFactory::new();
    let entries = identities
        .iter()
        .map(|identity| {
            Arc::new(PoolEntry::new(
                identity,
                CredentialSource::Static,
                factory.client(identity),
            ))
        })
        .collect();
    (Arc::new(AccountPool::from_entries(entries)), factory)
}
