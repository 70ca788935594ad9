use crate::router::MessageRouter;
use poolbot_config::BotConfig;
use poolbot_ipc::InboundMessage;
use std::sync::Arc;
use tracing::{debug, info};

/// Splits `text` into consecutive chunks of at most `max_chars` characters.
/// Empty text yields no chunks.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect()
}

/// Chat-facing glue: decides whether to answer, cleans the prompt, routes it
/// and returns the reply already split for delivery.
pub struct ChatBot {
    router: Arc<MessageRouter>,
    config: BotConfig,
    mention: String,
}

impl ChatBot {
    pub fn new(router: Arc<MessageRouter>, config: BotConfig) -> Self {
        let mention = config.mention_token();
        Self {
            router,
            config,
            mention,
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Keeps only the text after the last conversation separator, dropping
    /// quoted earlier turns.
    pub fn clean_message<'a>(&self, text: &'a str) -> &'a str {
        text.rsplit(self.config.conversation_separator.as_str())
            .next()
            .unwrap_or(text)
    }

    fn should_ignore(&self, message: &InboundMessage) -> bool {
        if message.is_self || !message.kind.is_text() {
            return true;
        }
        self.config
            .ignored_senders
            .iter()
            .any(|name| name == &message.sender_name)
    }

    /// Returns the reply chunks for `message`, or `None` when the bot stays
    /// silent. An empty upstream reply is answered with no chunks.
    pub async fn handle(&self, message: &InboundMessage) -> Option<Vec<String>> {
        if self.should_ignore(message) {
            debug!(trace_id = %message.trace_id, "Ignoring message");
            return None;
        }

        let reply = match &message.group {
            None => {
                let prompt = message.text.trim();
                if prompt.is_empty() {
                    return None;
                }
                info!(
                    thread_id = %message.thread_id,
                    sender = %message.sender_name,
                    "Direct message"
                );
                self.router.route(&message.thread_id, prompt).await
            }
            Some(group) => {
                let cleaned = self.clean_message(&message.text);
                if !cleaned.contains(&self.mention) {
                    return None;
                }
                let prompt = cleaned.replace(&self.mention, "").trim().to_string();
                if prompt.is_empty() {
                    return None;
                }
                info!(
                    thread_id = %message.thread_id,
                    room = %group.room_id,
                    topic = group.topic.as_deref().unwrap_or(""),
                    sender = %message.sender_name,
                    "Mentioned in group"
                );
                let response = self.router.route(&message.thread_id, &prompt).await;
                if self.config.quote_group_prompt {
                    format!("{}\n ------\n {}", prompt, response)
                } else {
                    response
                }
            }
        };

        Some(chunk_message(&reply, self.config.max_message_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConversationRegistry;
    use crate::test_support::{stub_pool, StubFactory};
    use poolbot_ipc::MessageKind;
    use std::time::Duration;

    fn bot_with(config: BotConfig) -> (ChatBot, StubFactory) {
        let (pool, factory) = stub_pool(&["a"]);
        let registry = Arc::new(ConversationRegistry::new(pool));
        let router = Arc::new(MessageRouter::new(registry, Duration::from_secs(5)));
        (ChatBot::new(router, config), factory)
    }

    fn bot() -> (ChatBot, StubFactory) {
        bot_with(BotConfig {
            name: "helper".to_string(),
            ignored_senders: vec!["System".to_string()],
            ..BotConfig::default()
        })
    }

    #[test]
    fn chunk_message_splits_at_fixed_size_in_order() {
        let text: String = ('a'..='z').cycle().take(1200).collect();
        let chunks = chunk_message(&text, 500);
        let lengths: Vec<usize> = chunks.iter().map(|c| c.chars().count()).collect();
        assert_eq!(lengths, vec![500, 500, 200]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_message_counts_characters_not_bytes() {
        let text = "é".repeat(501);
        let chunks = chunk_message(&text, 500);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "é");
    }

    #[test]
    fn chunk_message_short_and_empty_text() {
        assert_eq!(chunk_message("hi", 500), vec!["hi".to_string()]);
        assert!(chunk_message("", 500).is_empty());
    }

    #[test]
    fn clean_message_keeps_text_after_last_separator() {
        let (bot, _) = bot();
        let sep = poolbot_config::DEFAULT_CONVERSATION_SEPARATOR;
        let text = format!("old question{}old answer{}@helper new one", sep, sep);
        assert_eq!(bot.clean_message(&text), "@helper new one");
        assert_eq!(bot.clean_message("plain"), "plain");
    }

    #[tokio::test]
    async fn direct_message_is_routed_on_its_thread() {
        let (bot, _) = bot();
        let msg = InboundMessage::new("test", "dm-1", "u1", "hello");
        assert_eq!(bot.handle(&msg).await, Some(vec!["echo: hello".to_string()]));
        assert!(bot.router().registry().get("dm-1").await.is_some());
    }

    #[tokio::test]
    async fn self_non_text_and_ignored_senders_are_skipped() {
        let (bot, factory) = bot();
        let own = InboundMessage::new("test", "dm-1", "me", "hello").from_self();
        let image = InboundMessage::new("test", "dm-1", "u1", "").with_kind(MessageKind::Image);
        let system = InboundMessage::new("test", "dm-1", "sys", "notice").with_sender_name("System");

        assert!(bot.handle(&own).await.is_none());
        assert!(bot.handle(&image).await.is_none());
        assert!(bot.handle(&system).await.is_none());
        assert_eq!(factory.total_opened(), 0);
    }

    #[tokio::test]
    async fn group_message_without_mention_is_ignored() {
        let (bot, factory) = bot();
        let msg = InboundMessage::new("test", "room1", "u1", "just chatting")
            .with_group("room1", Some("Friends"));
        assert!(bot.handle(&msg).await.is_none());
        assert_eq!(factory.total_opened(), 0);
    }

    #[tokio::test]
    async fn group_mention_is_stripped_and_prompt_quoted() {
        let (bot, _) = bot();
        let msg = InboundMessage::new("test", "room1", "u1", "@helper what time is it")
            .with_group("room1", None);
        let chunks = bot.handle(&msg).await.unwrap();
        assert_eq!(
            chunks,
            vec!["what time is it\n ------\n echo: what time is it".to_string()]
        );
    }

    #[tokio::test]
    async fn group_reply_without_quote_when_disabled() {
        let (bot, _) = bot_with(BotConfig {
            name: "helper".to_string(),
            quote_group_prompt: false,
            ..BotConfig::default()
        });
        let msg = InboundMessage::new("test", "room1", "u1", "hey @helper ping")
            .with_group("room1", None);
        assert_eq!(bot.handle(&msg).await, Some(vec!["echo: hey  ping".to_string()]));
    }

    #[tokio::test]
    async fn empty_reply_is_answered_with_no_chunks() {
        let (bot, factory) = bot();
        factory.set_replies(&[("quiet", "")]);
        let msg = InboundMessage::new("test", "dm-1", "u1", "quiet");
        assert_eq!(bot.handle(&msg).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn long_reply_is_chunked() {
        let (bot, factory) = bot_with(BotConfig {
            max_message_chars: 10,
            ..BotConfig::default()
        });
        factory.set_replies(&[("long", "0123456789abcdefghij!")]);
        let msg = InboundMessage::new("test", "dm-1", "u1", "long");
        assert_eq!(
            bot.handle(&msg).await.unwrap(),
            vec![
                "0123456789".to_string(),
                "abcdefghij".to_string(),
                "!".to_string()
            ]
        );
    }
}
