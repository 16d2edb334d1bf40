//! Chat Adapter
//!
//! Interface to the chat-protocol layer plus outbound delivery.
//!
//! Delivery records every message that actually went out as a bot-authored
//! [`ChatMessage`], and paces consecutive sends with short randomized
//! pauses. A rejected send only drops that one message; the rest of the
//! batch still goes out.

use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::message::ChatMessage;
use crate::random::{self, RandomSource};
use crate::speaker::{SpeakAction, SpeakPlan};
use crate::store::ChatStore;

/// Error types for adapter operations
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Poke failed: {0}")]
    PokeFailed(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Adapter not ready")]
    NotReady,
}

/// Chat platform actions the engine needs
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Send text to a group, returning the platform message id
    async fn send_group_message(&self, group_id: i64, content: &str) -> Result<i64, AdapterError>;

    /// Retract a message
    async fn delete_message(&self, message_id: i64) -> Result<(), AdapterError>;

    /// Nudge a group member
    async fn poke_user(&self, group_id: i64, user_id: i64) -> Result<(), AdapterError>;
}

/// Randomized pauses that emulate human pacing
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Before a learned reply is returned
    pub typing: Range<Duration>,
    /// Between reply messages
    pub reply_gap: Range<Duration>,
    /// Between proactive messages
    pub speak_gap: Range<Duration>,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            typing: Duration::from_millis(500)..Duration::from_millis(1500),
            reply_gap: Duration::from_millis(500)..Duration::from_millis(1500),
            speak_gap: Duration::from_secs(2)..Duration::from_secs(4),
        }
    }
}

impl Pacing {
    /// No pauses at all
    pub fn none() -> Self {
        Self {
            typing: Duration::ZERO..Duration::ZERO,
            reply_gap: Duration::ZERO..Duration::ZERO,
            speak_gap: Duration::ZERO..Duration::ZERO,
        }
    }

    /// Sleep for a random duration in `range`
    pub async fn pause(&self, range: &Range<Duration>, rng: &dyn RandomSource) {
        if range.end.is_zero() {
            return;
        }
        let secs = random::uniform(rng, range.start.as_secs_f64(), range.end.as_secs_f64());
        tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
    }
}

/// Sends replies and proactive plans, recording what went out
pub struct Dispatcher {
    adapter: Arc<dyn ChatAdapter>,
    store: Arc<ChatStore>,
    rng: Arc<dyn RandomSource>,
    pacing: Pacing,
    self_id: i64,
}

impl Dispatcher {
    pub fn new(
        adapter: Arc<dyn ChatAdapter>,
        store: Arc<ChatStore>,
        rng: Arc<dyn RandomSource>,
        pacing: Pacing,
        self_id: i64,
    ) -> Self {
        Self {
            adapter,
            store,
            rng,
            pacing,
            self_id,
        }
    }

    /// Send reply texts, returning how many went out
    pub async fn send_replies(&self, group_id: i64, replies: &[String]) -> usize {
        let mut sent = 0;
        for reply in replies {
            info!("Replying to group {}: \"{}\"", group_id, reply);
            if self.send_and_record(group_id, reply).await {
                sent += 1;
            }
            self.pacing.pause(&self.pacing.reply_gap, self.rng.as_ref()).await;
        }
        sent
    }

    /// Carry out a proactive plan, returning how many actions succeeded
    pub async fn deliver_plan(&self, plan: &SpeakPlan) -> usize {
        let mut done = 0;
        for action in &plan.actions {
            match action {
                SpeakAction::Text(text) => {
                    info!("Speaking in group {}: \"{}\"", plan.group_id, text);
                    if self.send_and_record(plan.group_id, text).await {
                        done += 1;
                    }
                    self.pacing.pause(&self.pacing.speak_gap, self.rng.as_ref()).await;
                }
                SpeakAction::Poke(user_id) => {
                    match self.adapter.poke_user(plan.group_id, *user_id).await {
                        Ok(()) => {
                            debug!("Poked {} in group {}", user_id, plan.group_id);
                            done += 1;
                        }
                        Err(e) => warn!(
                            "Poke of {} in group {} via {} failed: {}",
                            user_id,
                            plan.group_id,
                            self.adapter.name(),
                            e
                        ),
                    }
                }
            }
        }
        done
    }

    async fn send_and_record(&self, group_id: i64, text: &str) -> bool {
        let message_id = match self.adapter.send_group_message(group_id, text).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Send to group {} via {} failed, possibly rate limited: {}",
                    group_id,
                    self.adapter.name(),
                    e
                );
                return false;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut record = ChatMessage::outbound(group_id, self.self_id, message_id, text, now);
        if let Err(e) = self.store.insert_message(&mut record).await {
            warn!("Failed to record sent message {}: {}", message_id, e);
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingAdapter;
    use super::*;
    use crate::random::ScriptedRandom;

    fn dispatcher(adapter: Arc<RecordingAdapter>, store: Arc<ChatStore>) -> Dispatcher {
        Dispatcher::new(
            adapter,
            store,
            Arc::new(ScriptedRandom::constant(0.5)),
            Pacing::none(),
            99,
        )
    }

    #[tokio::test]
    async fn test_failed_send_does_not_abort_batch() {
        let adapter = Arc::new(RecordingAdapter::default());
        adapter.reject.lock().push("second".into());
        let store = Arc::new(ChatStore::open_in_memory().unwrap());
        let dispatcher = dispatcher(adapter.clone(), store.clone());

        let plan = SpeakPlan {
            group_id: 1,
            actions: vec![
                SpeakAction::Text("first".into()),
                SpeakAction::Text("second".into()),
                SpeakAction::Text("third".into()),
                SpeakAction::Poke(42),
            ],
        };
        assert_eq!(dispatcher.deliver_plan(&plan).await, 3);
        assert_eq!(adapter.sent.lock().len(), 2);
        assert_eq!(adapter.poked.lock().as_slice(), &[(1, 42)]);

        // Only delivered messages are recorded, as the bot
        let last = store.last_message_from(1, 99).await.unwrap().unwrap();
        assert_eq!(last.message, "third");
        let recent = store.recent_messages(1, 0, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_send_replies_records_outbound() {
        let adapter = Arc::new(RecordingAdapter::default());
        let store = Arc::new(ChatStore::open_in_memory().unwrap());
        let dispatcher = dispatcher(adapter.clone(), store.clone());

        let sent = dispatcher.send_replies(5, &["hello there".to_string()]).await;
        assert_eq!(sent, 1);
        let recorded = store.last_message_from(5, 99).await.unwrap().unwrap();
        assert_eq!(recorded.message_id, 10_000);
        assert_eq!(recorded.plain_text, "hello there");
    }
}
