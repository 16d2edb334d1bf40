//! Learning Engine
//!
//! Classifies each inbound group message and performs the learn step that
//! pairs a stimulus with a response.
//!
//! Every event is judged against one settings snapshot taken when the event
//! arrives (see [`Turn`]); a concurrent settings change only affects later
//! events.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::adapter::{ChatAdapter, Pacing};
use crate::filter::ContentFilter;
use crate::keywords::{FrequencyExtractor, KeywordExtractor};
use crate::message::ChatMessage;
use crate::phrases::{self, Phrases, BAN_TRIGGERS, DISABLE_TRIGGERS, ENABLE_TRIGGERS};
use crate::random::{RandomSource, StdRandom};
use crate::settings::{ChatSettings, GroupSettings, SettingsManager};
use crate::store::{ChatAnswer, ChatContext, ChatStore};

/// Window of recent messages searched for a stimulus
const WINDOW_SECONDS: i64 = 3600;
const WINDOW_SIZE: usize = 5;

/// Sender standing in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    Superuser,
    Owner,
    Admin,
    Member,
}

impl SenderRole {
    /// May toggle learning and ban learned content
    pub fn is_elevated(&self) -> bool {
        !matches!(self, SenderRole::Member)
    }

    /// Map a platform role string, unknown roles are members
    pub fn from_platform(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "owner" => SenderRole::Owner,
            "admin" => SenderRole::Admin,
            _ => SenderRole::Member,
        }
    }
}

/// Inbound group message as delivered by the adapter
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub group_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub raw_text: String,
    pub plain_text: String,
    /// Unix seconds
    pub time: i64,
    pub role: SenderRole,
    /// Platform id of the message this one replies to
    pub reply_to: Option<i64>,
    /// Adapter-reported addressing (mention, private wake word)
    pub to_me: bool,
}

/// What to do with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Learn,
    Pass,
    Repeat,
    Ban,
    SetEnable,
    SetDisable,
}

/// One event's working state: the message plus the settings it is judged by
pub struct Turn {
    pub data: ChatMessage,
    pub role: SenderRole,
    pub reply_to: Option<i64>,
    pub to_me: bool,
    pub settings: Arc<ChatSettings>,
    pub group: GroupSettings,
    pub ban_users: HashSet<i64>,
    pub filter: ContentFilter,
}

impl Turn {
    pub fn group_id(&self) -> i64 {
        self.data.group_id
    }

    pub fn phrases(&self) -> Phrases {
        Phrases::new(&self.settings.nickname)
    }
}

/// The learning chat engine.
///
/// Holds the shared store, live settings, keyword extractor and random
/// source. Reply assembly, moderation and proactive speaking are
/// implemented in their own modules on this same type.
pub struct LearningChat {
    pub(crate) store: Arc<ChatStore>,
    pub(crate) settings: Arc<SettingsManager>,
    pub(crate) extractor: Arc<dyn KeywordExtractor>,
    pub(crate) rng: Arc<dyn RandomSource>,
    pub(crate) adapter: Arc<dyn ChatAdapter>,
    pub(crate) pacing: Pacing,
    pub(crate) self_id: i64,
}

impl LearningChat {
    /// Engine with the built-in extractor (seeded from the settings
    /// dictionary), an entropy-seeded random source and default pacing
    pub fn new(
        store: Arc<ChatStore>,
        settings: Arc<SettingsManager>,
        adapter: Arc<dyn ChatAdapter>,
        self_id: i64,
    ) -> Self {
        let extractor = FrequencyExtractor::with_dictionary(&settings.snapshot().dictionary);
        Self {
            store,
            settings,
            extractor: Arc::new(extractor),
            rng: Arc::new(StdRandom::from_entropy()),
            adapter,
            pacing: Pacing::default(),
            self_id,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn KeywordExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    pub fn extractor(&self) -> &Arc<dyn KeywordExtractor> {
        &self.extractor
    }

    pub fn random(&self) -> Arc<dyn RandomSource> {
        self.rng.clone()
    }

    pub fn self_id(&self) -> i64 {
        self.self_id
    }

    /// Build the working state for one inbound event
    pub fn turn(&self, event: &ChatEvent) -> Turn {
        let settings = self.settings.snapshot();
        let group = settings.group(event.group_id);
        let data = ChatMessage::new(
            event.group_id,
            event.user_id,
            event.message_id,
            &event.raw_text,
            &event.plain_text,
            event.time,
        );

        let nickname = settings.nickname.trim();
        let to_me = event.to_me || (!nickname.is_empty() && data.message.contains(nickname));
        let role = if settings.is_superuser(event.user_id) {
            SenderRole::Superuser
        } else {
            event.role
        };

        Turn {
            data,
            role,
            reply_to: event.reply_to,
            to_me,
            ban_users: settings.effective_ban_users(&group),
            filter: ContentFilter::new(settings.effective_ban_words(&group)),
            group,
            settings,
        }
    }

    /// Signature of a message under the snapshot's top-K
    pub(crate) fn signature<'m>(&self, turn: &Turn, message: &'m ChatMessage) -> &'m str {
        message.keywords(self.extractor.as_ref(), turn.settings.keywords_size)
    }

    pub(crate) fn keyword_list<'m>(&self, turn: &Turn, message: &'m ChatMessage) -> &'m [String] {
        message.keyword_list(self.extractor.as_ref(), turn.settings.keywords_size)
    }

    async fn allowed(&self, turn: &Turn, message: &ChatMessage) -> Result<bool> {
        turn.filter
            .check_allow(
                &self.store,
                &message.message,
                self.signature(turn, message),
                message.group_id,
            )
            .await
    }

    /// Decide what to do with the turn's message. Learns a pairing as a
    /// side effect when the result is [`Classification::Learn`].
    ///
    /// Runs before the message itself is persisted.
    pub async fn classify(&self, turn: &Turn) -> Result<Classification> {
        let text = turn.data.message.as_str();
        let group_id = turn.group_id();

        if turn.to_me && phrases::contains_any(text, ENABLE_TRIGGERS) {
            return Ok(Classification::SetEnable);
        }
        if turn.to_me && phrases::contains_any(text, DISABLE_TRIGGERS) {
            return Ok(Classification::SetDisable);
        }
        if !turn.settings.total_enable || !turn.group.enable {
            debug!("Learning disabled in group {}", group_id);
            return Ok(Classification::Pass);
        }
        if turn
            .settings
            .command_prefixes
            .iter()
            .any(|p| !p.is_empty() && text.starts_with(p.as_str()))
        {
            debug!("Command message skipped: {}", text);
            return Ok(Classification::Pass);
        }
        if turn.ban_users.contains(&turn.data.user_id) {
            debug!("Ignored sender {} in group {}", turn.data.user_id, group_id);
            return Ok(Classification::Pass);
        }
        if turn.to_me && phrases::contains_any(text, BAN_TRIGGERS) {
            return Ok(Classification::Ban);
        }
        if !self.allowed(turn, &turn.data).await? {
            return Ok(Classification::Pass);
        }

        if let Some(reply_id) = turn.reply_to {
            let Some(stimulus) = self.store.message_by_platform_id(reply_id).await? else {
                debug!("Replied-to message {} not stored", reply_id);
                return Ok(Classification::Pass);
            };
            if turn.ban_users.contains(&stimulus.user_id) || !self.allowed(turn, &stimulus).await? {
                return Ok(Classification::Pass);
            }
            self.learn(turn, &stimulus).await?;
            return Ok(Classification::Learn);
        }

        let window = self
            .store
            .recent_messages(group_id, turn.data.time - WINDOW_SECONDS, WINDOW_SIZE)
            .await?;
        let Some(newest) = window.first() else {
            return Ok(Classification::Pass);
        };
        if newest.message == turn.data.message {
            debug!("Repeat in progress in group {}: {}", group_id, text);
            return Ok(Classification::Repeat);
        }

        let own = self.keyword_list(turn, &turn.data);
        for candidate in &window {
            if turn.ban_users.contains(&candidate.user_id) {
                continue;
            }
            let theirs = self.keyword_list(turn, candidate);
            let shares_keyword = own.iter().any(|k| theirs.contains(k));
            if shares_keyword && theirs != own && self.allowed(turn, candidate).await? {
                self.learn(turn, candidate).await?;
                return Ok(Classification::Learn);
            }
        }

        if turn.ban_users.contains(&newest.user_id) || !self.allowed(turn, newest).await? {
            return Ok(Classification::Pass);
        }
        self.learn(turn, newest).await?;
        Ok(Classification::Learn)
    }

    /// Reinforce the pairing stimulus -> turn message
    pub async fn learn(&self, turn: &Turn, stimulus: &ChatMessage) -> Result<()> {
        let max = turn.settings.learn_max_count;
        let time = turn.data.time;
        let stimulus_sig = self.signature(turn, stimulus);
        let response_sig = self.signature(turn, &turn.data);

        let mut context = match self.store.context_by_keywords(stimulus_sig).await? {
            Some(mut context) => {
                if context.count < max {
                    context.count += 1;
                }
                context.time = time;
                context
            }
            None => ChatContext::new(stimulus_sig, time),
        };
        self.store.save_context(&mut context).await?;

        let text = turn.data.message.as_str();
        let mut answer = match self
            .store
            .find_answer(context.id, turn.group_id(), response_sig)
            .await?
        {
            Some(mut answer) => {
                if answer.count < max {
                    answer.count += 1;
                }
                answer.time = time;
                if !answer.messages.iter().any(|m| m == text) {
                    answer.messages.push(text.to_string());
                }
                answer
            }
            None => ChatAnswer::new(response_sig, turn.group_id(), time, context.id, text),
        };
        self.store.save_answer(&mut answer).await?;

        debug!(
            "Learned [{}] -> [{}] in group {} (context {}, answer {})",
            stimulus_sig,
            response_sig,
            turn.group_id(),
            context.count,
            answer.count
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::adapter::testing::RecordingAdapter;
    use crate::random::ScriptedRandom;

    pub const BOT: i64 = 99;
    pub const GROUP: i64 = 100;

    pub struct Harness {
        pub engine: LearningChat,
        pub adapter: Arc<RecordingAdapter>,
        pub rng: Arc<ScriptedRandom>,
    }

    pub fn harness(settings: ChatSettings) -> Harness {
        let adapter = Arc::new(RecordingAdapter::default());
        let rng = Arc::new(ScriptedRandom::constant(0.0));
        let engine = LearningChat::new(
            Arc::new(ChatStore::open_in_memory().unwrap()),
            Arc::new(SettingsManager::in_memory(settings).unwrap()),
            adapter.clone(),
            BOT,
        )
        .with_random(rng.clone())
        .with_pacing(Pacing::none());
        Harness {
            engine,
            adapter,
            rng,
        }
    }

    pub fn event(user_id: i64, message_id: i64, text: &str, time: i64) -> ChatEvent {
        ChatEvent {
            group_id: GROUP,
            user_id,
            message_id,
            raw_text: text.to_string(),
            plain_text: text.to_string(),
            time,
            role: SenderRole::Member,
            reply_to: None,
            to_me: false,
        }
    }

    /// Store a message as if it had been observed earlier
    pub async fn observe(engine: &LearningChat, user_id: i64, message_id: i64, text: &str, time: i64) {
        let mut message = ChatMessage::new(GROUP, user_id, message_id, text, text, time);
        engine.store.insert_message(&mut message).await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_no_window_passes_and_learns_nothing() {
        let h = harness(ChatSettings::default());
        let turn = h.engine.turn(&event(1, 1, "rust borrow checker", 1_000));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Pass);
        assert!(h.engine.store.contexts_with_min_count(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_keyword_pairing() {
        let h = harness(ChatSettings::default());
        observe(&h.engine, 1, 1, "rust borrow checker", 1_000).await;

        let turn = h.engine.turn(&event(2, 2, "rust lifetimes explained", 1_010));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Learn);

        let context = h
            .engine
            .store
            .context_by_keywords("rust borrow checker")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.count, 1);
        let answers = h.engine.store.answers_for_context(context.id, 1, None).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].keywords, "rust lifetimes explained");
        assert_eq!(answers[0].messages, vec!["rust lifetimes explained"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_newest_message() {
        let h = harness(ChatSettings::default());
        observe(&h.engine, 1, 1, "completely unrelated words", 1_000).await;

        let turn = h.engine.turn(&event(2, 2, "good morning everyone", 1_010));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Learn);
        assert!(h
            .engine
            .store
            .context_by_keywords("completely unrelated words")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_identical_newest_is_repeat() {
        let h = harness(ChatSettings::default());
        observe(&h.engine, 1, 1, "same words again", 1_000).await;
        let turn = h.engine.turn(&event(2, 2, "same words again", 1_010));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Repeat);
    }

    #[tokio::test]
    async fn test_decision_order() {
        let mut settings = ChatSettings::default();
        settings.nickname = "paimon".into();
        settings.command_prefixes = vec!["/".into()];
        settings.ban_users = vec![7];
        let h = harness(settings);

        // Toggle wins even for ignored senders
        let turn = h.engine.turn(&event(7, 1, "paimon stop learning", 1_000));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::SetDisable);

        let turn = h.engine.turn(&event(1, 2, "/help me", 1_000));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Pass);

        let turn = h.engine.turn(&event(7, 3, "hello there", 1_000));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Pass);

        let turn = h.engine.turn(&event(1, 4, "paimon don't say that", 1_000));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Ban);

        // Not addressed: the ban trigger is just text
        let turn = h.engine.turn(&event(1, 5, "don't say that", 1_000));
        assert_ne!(h.engine.classify(&turn).await.unwrap(), Classification::Ban);
    }

    #[tokio::test]
    async fn test_disabled_group_passes() {
        let h = harness(ChatSettings::default());
        h.engine.settings.set_group_enable(GROUP, false).unwrap();
        observe(&h.engine, 1, 1, "rust borrow checker", 1_000).await;
        let turn = h.engine.turn(&event(2, 2, "rust lifetimes explained", 1_010));
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Pass);
    }

    #[tokio::test]
    async fn test_reply_pairs_with_replied_message() {
        let h = harness(ChatSettings::default());
        observe(&h.engine, 1, 50, "what should we eat", 1_000).await;
        observe(&h.engine, 3, 51, "weather looks grim", 1_005).await;

        let mut reply = event(2, 52, "hotpot tonight", 1_010);
        reply.reply_to = Some(50);
        let turn = h.engine.turn(&reply);
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Learn);
        assert!(h
            .engine
            .store
            .context_by_keywords("what should we eat")
            .await
            .unwrap()
            .is_none());
        let context = h
            .engine
            .store
            .context_by_keywords("should eat")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.count, 1);

        reply.reply_to = Some(404);
        let turn = h.engine.turn(&reply);
        assert_eq!(h.engine.classify(&turn).await.unwrap(), Classification::Pass);
    }

    #[tokio::test]
    async fn test_counts_capped() {
        let mut settings = ChatSettings::default();
        settings.learn_max_count = 2;
        let h = harness(settings);
        let stimulus = ChatMessage::new(GROUP, 1, 1, "rust borrow checker", "rust borrow checker", 1_000);

        for i in 0..5 {
            let turn = h.engine.turn(&event(2, 10 + i, "rust lifetimes explained", 1_010 + i));
            h.engine.learn(&turn, &stimulus).await.unwrap();
        }
        let context = h
            .engine
            .store
            .context_by_keywords("rust borrow checker")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.count, 2);
        let answers = h.engine.store.answers_for_context(context.id, 1, None).await.unwrap();
        assert_eq!(answers[0].count, 2);
        assert_eq!(answers[0].messages.len(), 1);
    }

    #[test]
    fn test_turn_addressing_and_role() {
        let mut settings = ChatSettings::default();
        settings.nickname = "paimon".into();
        settings.superusers = vec![1];
        let h = harness(settings);

        let turn = h.engine.turn(&event(1, 1, "hey paimon", 0));
        assert!(turn.to_me);
        assert_eq!(turn.role, SenderRole::Superuser);

        let mut plain = event(2, 2, "hey there", 0);
        plain.role = SenderRole::Admin;
        let turn = h.engine.turn(&plain);
        assert!(!turn.to_me);
        assert_eq!(turn.role, SenderRole::Admin);
        assert!(turn.role.is_elevated());
        assert_eq!(SenderRole::from_platform("OWNER"), SenderRole::Owner);
        assert!(!SenderRole::from_platform("member").is_elevated());
    }
}
