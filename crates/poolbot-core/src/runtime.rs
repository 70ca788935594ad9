use crate::bot::ChatBot;
use crate::credentials::CredentialResolver;
use crate::pool::AccountPool;
use crate::registry::ConversationRegistry;
use crate::router::MessageRouter;
use anyhow::{Context, Result};
use poolbot_config::Config;
use poolbot_ipc::{EventBus, InboundMessage, OutboundMessage};
use poolbot_providers::{ClientFactory, CommandDeriver, SessionDeriver};
use poolbot_storage::CredentialCache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{error, info, warn};

/// Builds the credential resolver described by the configuration.
pub fn credential_resolver(config: &Config, cache: Arc<CredentialCache>) -> Result<CredentialResolver> {
    let deriver: Option<Arc<dyn SessionDeriver>> = match &config.derivation {
        Some(derivation) => Some(Arc::new(
            CommandDeriver::new(&derivation.command, derivation.timeout_secs)
                .context("invalid [derivation].command")?,
        )),
        None => None,
    };
    Ok(CredentialResolver::new(cache, deriver))
}

/// Resolves every account and wires pool, registry, router and bot together.
/// An empty pool is fatal: nothing could ever be routed.
pub async fn bootstrap(
    config: &Config,
    resolver: Arc<CredentialResolver>,
    factory: &dyn ClientFactory,
) -> Result<Arc<ChatBot>> {
    let pool = AccountPool::initialize(&config.accounts, resolver, factory).await;
    if let Err(err) = pool.ensure_usable() {
        error!(
            configured = config.accounts.len(),
            excluded = pool.excluded().len(),
            "No usable upstream accounts; refusing to start"
        );
        return Err(err.into());
    }

    let registry = Arc::new(ConversationRegistry::new(Arc::new(pool)));
    let router = Arc::new(MessageRouter::from_config(registry, &config.router));
    Ok(Arc::new(ChatBot::new(router, config.bot.clone())))
}

/// Drives the bot from the event bus: one task per inbound message, bounded
/// by a semaphore, with messages of the same thread handled in arrival order.
pub struct BotRuntime {
    bot: Arc<ChatBot>,
    event_bus: EventBus,
    max_concurrency: usize,
    thread_locks: ThreadLocks,
}

type ThreadLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

impl BotRuntime {
    pub fn new(bot: Arc<ChatBot>, event_bus: EventBus, max_concurrency: usize) -> Self {
        Self {
            bot,
            event_bus,
            max_concurrency: max_concurrency.max(1),
            thread_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    async fn thread_lock(locks: &ThreadLocks, thread_key: &str) -> Arc<Mutex<()>> {
        let mut locks = locks.lock().await;
        locks
            .entry(thread_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the thread's lock from the map once no other task holds or waits
    /// on it. Clones are only taken under the map lock, so the count is exact.
    async fn release_thread_lock(locks: &ThreadLocks, thread_key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(thread_key);
        }
    }

    /// Runs until the inbound channel closes.
    pub async fn run(&self, mut inbound_rx: broadcast::Receiver<InboundMessage>) {
        info!("Poolbot runtime started");
        let outbound = self.event_bus.outbound_sender();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        loop {
            let message = match inbound_rx.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping message processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                    continue;
                }
            };

            let bot = Arc::clone(&self.bot);
            let outbound = outbound.clone();
            let semaphore = Arc::clone(&semaphore);
            let thread_locks = Arc::clone(&self.thread_locks);

            tokio::spawn(async move {
                // Thread order first; a permit is only taken by work that can run.
                let key = format!("{}:{}", message.channel, message.thread_id);
                let lock = Self::thread_lock(&thread_locks, &key).await;
                let guard = Arc::clone(&lock).lock_owned().await;

                match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        if let Some(chunks) = bot.handle(&message).await {
                            Self::deliver(&outbound, &message, chunks);
                        }
                    }
                    Err(err) => {
                        error!(trace_id = %message.trace_id, "Inbound semaphore closed: {}", err);
                    }
                }

                drop(guard);
                Self::release_thread_lock(&thread_locks, &key, lock).await;
            });
        }
    }

    fn deliver(
        outbound: &broadcast::Sender<OutboundMessage>,
        message: &InboundMessage,
        chunks: Vec<String>,
    ) {
        let total = chunks.len();
        if total == 0 {
            let marker = OutboundMessage {
                trace_id: message.trace_id.clone(),
                channel: message.channel.clone(),
                thread_id: message.thread_id.clone(),
                seq: 0,
                total: 0,
                text: String::new(),
            };
            if let Err(err) = outbound.send(marker) {
                warn!(trace_id = %message.trace_id, "No outbound listener: {}", err);
            }
            return;
        }
        for (seq, text) in chunks.into_iter().enumerate() {
            let out = OutboundMessage {
                trace_id: message.trace_id.clone(),
                channel: message.channel.clone(),
                thread_id: message.thread_id.clone(),
                seq,
                total,
                text,
            };
            if let Err(err) = outbound.send(out) {
                warn!(trace_id = %message.trace_id, "No outbound listener: {}", err);
                return;
            }
        }
    }
}
