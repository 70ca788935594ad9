//! Poolbot Core
//!
//! Account pool and conversation routing: resolves per-account session
//! credentials, binds each chat thread to one upstream conversation, sends
//! through it, and turns upstream failures into chat-friendly text.

mod bot;
mod credentials;
mod error;
mod pool;
mod registry;
mod router;
mod runtime;

#[cfg(test)]
mod test_support;

pub use bot::{chunk_message, ChatBot};
pub use credentials::CredentialResolver;
pub use error::{PoolError, RouteError};
pub use pool::{AccountPool, CredentialSource, ExcludedAccount, PoolEntry};
pub use registry::{ConversationEntry, ConversationRegistry};
pub use router::{
    ErrorClass, MessageRouter, RetryPolicy, RATE_LIMITED_MESSAGE, SERVER_BUSY_MESSAGE,
    UNKNOWN_ERROR_MESSAGE,
};
pub use runtime::{bootstrap, credential_resolver, BotRuntime};
