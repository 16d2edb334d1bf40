//! Proactive speaking
//!
//! On each scheduler tick, finds the busiest group that has gone quiet and
//! plans a short chain of learned messages for it, optionally followed by a
//! poke at a recent speaker.

use anyhow::Result;
use chrono::{DateTime, Local, Timelike};
use std::cmp::Ordering;
use tracing::debug;

use crate::engine::LearningChat;
use crate::filter::{has_blocked_marker, is_redacted, ContentFilter};
use crate::message::ChatMessage;
use crate::random::{self, chance};
use crate::settings::{ChatSettings, GroupSettings};
use crate::store::ChatAnswer;

/// Messages since midnight before a group is considered at all
const MIN_ACTIVE_MESSAGES: usize = 10;
/// Messages since midnight before the bot may speak in a group
const MIN_SPEAK_MESSAGES: usize = 30;
/// Recent messages whose senders may be poked
const POKE_WINDOW: usize = 5;

/// One planned outbound action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakAction {
    Text(String),
    Poke(i64),
}

/// What to say, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakPlan {
    pub group_id: i64,
    pub actions: Vec<SpeakAction>,
}

/// Unix time of the most recent local midnight
fn local_midnight(now: DateTime<Local>) -> i64 {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.timestamp())
        .unwrap_or_else(|| now.timestamp() - i64::from(now.num_seconds_from_midnight()))
}

/// Messages per second over the span of `messages` (newest first)
fn popularity(messages: &[ChatMessage]) -> f64 {
    let (Some(newest), Some(oldest)) = (messages.first(), messages.last()) else {
        return 0.0;
    };
    let span = (newest.time - oldest.time).max(1);
    messages.len() as f64 / span as f64
}

impl LearningChat {
    /// Plan proactive speech as of now
    pub async fn speak(&self, self_id: i64) -> Result<Option<SpeakPlan>> {
        self.speak_at(self_id, Local::now()).await
    }

    /// Plan proactive speech as of `now`
    pub async fn speak_at(&self, self_id: i64, now: DateTime<Local>) -> Result<Option<SpeakPlan>> {
        let settings = self.settings.snapshot();
        if !settings.total_enable {
            return Ok(None);
        }
        let today = local_midnight(now);

        let mut ranked = Vec::new();
        for group_id in self.store.active_groups(today, MIN_ACTIVE_MESSAGES).await? {
            let messages = self.store.messages_since(group_id, today).await?;
            if !messages.is_empty() {
                ranked.push((group_id, messages));
            }
        }
        // Stable: ties keep group order
        ranked.sort_by(|a, b| {
            popularity(&b.1)
                .partial_cmp(&popularity(&a.1))
                .unwrap_or(Ordering::Equal)
        });

        for (group_id, messages) in &ranked {
            let plan = self
                .plan_group(&settings, self_id, *group_id, messages, now.timestamp(), today)
                .await?;
            if plan.is_some() {
                return Ok(plan);
            }
        }
        debug!("Nothing to say in {} active groups", ranked.len());
        Ok(None)
    }

    async fn plan_group(
        &self,
        settings: &ChatSettings,
        self_id: i64,
        group_id: i64,
        messages: &[ChatMessage],
        now: i64,
        today: i64,
    ) -> Result<Option<SpeakPlan>> {
        if messages.len() < MIN_SPEAK_MESSAGES {
            debug!("Group {} too quiet today ({} messages)", group_id, messages.len());
            return Ok(None);
        }
        let group = settings.group(group_id);
        if !group.speak_enable || !group.enable {
            debug!("Speaking disabled in group {}", group_id);
            return Ok(None);
        }
        let (newest, oldest) = match (messages.first(), messages.last()) {
            (Some(newest), Some(oldest)) => (newest, oldest),
            _ => return Ok(None),
        };
        if newest.user_id == self_id {
            debug!("Bot spoke last in group {}", group_id);
            return Ok(None);
        }
        if let Some(last_own) = self.store.last_message_from(group_id, self_id).await? {
            if now - last_own.time < group.speak_min_interval {
                debug!("Bot spoke in group {} too recently", group_id);
                return Ok(None);
            }
        }

        let avg_interval = (newest.time - oldest.time) as f64 / messages.len() as f64;
        let silence = (now - newest.time) as f64;
        if silence < avg_interval * group.speak_threshold as f64 {
            debug!(
                "Group {} not quiet yet ({:.0}s of {:.0}s)",
                group_id,
                silence,
                avg_interval * group.speak_threshold as f64
            );
            return Ok(None);
        }

        let filter = ContentFilter::new(settings.effective_ban_words(&group));
        let mut contexts = self
            .store
            .contexts_with_min_count(group.answer_threshold)
            .await?;
        if contexts.is_empty() {
            return Ok(None);
        }
        random::shuffle(self.rng.as_ref(), &mut contexts);

        let mut chain = Vec::new();
        let mut current = None;
        for context in &contexts {
            if let Some((answer, text)) = self
                .pick_speakable(&filter, &group, context.id, group_id, today)
                .await?
            {
                chain.push(text);
                current = Some(answer);
                break;
            }
        }
        let Some(mut current) = current else {
            debug!("No speakable answer in group {}", group_id);
            return Ok(None);
        };

        while chain.len() < group.speak_continuously_max_len
            && chance(self.rng.as_ref(), group.speak_continuously_probability)
        {
            let Some(next) = self.store.context_by_keywords(&current.keywords).await? else {
                break;
            };
            let Some((answer, text)) = self
                .pick_speakable(&filter, &group, next.id, group_id, today)
                .await?
            else {
                break;
            };
            chain.push(text);
            current = answer;
        }

        let mut actions: Vec<SpeakAction> = chain.into_iter().map(SpeakAction::Text).collect();
        if chance(self.rng.as_ref(), group.speak_poke_probability) {
            let mut senders: Vec<i64> = Vec::new();
            for message in messages.iter().take(POKE_WINDOW) {
                if message.user_id != self_id && !senders.contains(&message.user_id) {
                    senders.push(message.user_id);
                }
            }
            if let Some(user_id) = random::pick(self.rng.as_ref(), &senders) {
                actions.push(SpeakAction::Poke(*user_id));
            }
        }

        Ok(Some(SpeakPlan { group_id, actions }))
    }

    /// Weighted pick of one answer under a context, with one of its texts,
    /// if that text may be said in the group. Answers updated today get a
    /// bonus.
    async fn pick_speakable(
        &self,
        filter: &ContentFilter,
        group: &GroupSettings,
        context_id: i64,
        group_id: i64,
        today: i64,
    ) -> Result<Option<(ChatAnswer, String)>> {
        let answers = self
            .store
            .answers_for_context(context_id, group.answer_threshold, Some(group_id))
            .await?;
        let weights: Vec<f64> = answers
            .iter()
            .map(|a| (a.count + i64::from(a.time >= today)) as f64)
            .collect();
        let Some(answer) = random::weighted_choice(self.rng.as_ref(), &answers, &weights) else {
            return Ok(None);
        };
        let Some(text) = random::pick(self.rng.as_ref(), &answer.messages) else {
            return Ok(None);
        };

        if text.chars().count() < 2 || is_redacted(text) || has_blocked_marker(text) {
            return Ok(None);
        }
        if !filter
            .check_allow(&self.store, text, &answer.keywords, group_id)
            .await?
        {
            return Ok(None);
        }
        Ok(Some((answer.clone(), text.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::settings::ChatSettings;
    use crate::store::{BlacklistEntry, ChatContext};
    use chrono::TimeZone;

    fn noon() -> DateTime<Local> {
        let date = Local::now().date_naive();
        Local
            .from_local_datetime(&date.and_hms_opt(12, 0, 0).unwrap())
            .earliest()
            .unwrap()
    }

    /// `count` messages from alternating users, one per `gap` seconds,
    /// ending `quiet` seconds before noon
    async fn chatter(h: &Harness, group_id: i64, count: i64, gap: i64, quiet: i64) {
        let end = noon().timestamp() - quiet;
        for i in 0..count {
            let time = end - (count - 1 - i) * gap;
            let mut m = ChatMessage::new(group_id, 1 + i % 3, i, "chatting away", "chatting away", time);
            h.engine.store().insert_message(&mut m).await.unwrap();
        }
    }

    async fn teach(h: &Harness, group_id: i64, stimulus: &str, response: &str, count: i64) {
        let store = h.engine.store();
        let mut context = match store.context_by_keywords(stimulus).await.unwrap() {
            Some(c) => c,
            None => ChatContext::new(stimulus, 0),
        };
        context.count = count;
        store.save_context(&mut context).await.unwrap();
        let mut answer = ChatAnswer::new(response, group_id, 0, context.id, response);
        answer.count = count;
        store.save_answer(&mut answer).await.unwrap();
    }

    fn quiet_settings(continue_p: f64, poke_p: f64) -> ChatSettings {
        let mut settings = ChatSettings::default();
        settings.groups.insert(
            GROUP.to_string(),
            GroupSettings {
                speak_continuously_probability: continue_p,
                speak_poke_probability: poke_p,
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn test_popularity_zero_span() {
        let m = ChatMessage::new(1, 1, 1, "x", "x", 100);
        assert_eq!(popularity(&[m.clone(), m]), 2.0);
        assert_eq!(popularity(&[]), 0.0);
    }

    #[tokio::test]
    async fn test_chain_follows_answer_signatures() {
        let h = harness(quiet_settings(1.0, 0.0));
        chatter(&h, GROUP, 40, 30, 3_600).await;
        teach(&h, GROUP, "morning all", "coffee time", 4).await;
        teach(&h, GROUP, "coffee time", "tea is better", 4).await;
        teach(&h, GROUP, "tea is better", "water please", 4).await;
        teach(&h, GROUP, "water please", "juice instead", 4).await;
        // Only "morning all" can start a chain
        for keywords in ["coffee time", "tea is better", "water please"] {
            let mut context = h.engine.store().context_by_keywords(keywords).await.unwrap().unwrap();
            context.count = 1;
            h.engine.store().save_context(&mut context).await.unwrap();
        }

        let plan = h.engine.speak_at(BOT, noon()).await.unwrap().unwrap();
        assert_eq!(plan.group_id, GROUP);
        // Capped at speak_continuously_max_len
        assert_eq!(
            plan.actions,
            vec![
                SpeakAction::Text("coffee time".into()),
                SpeakAction::Text("tea is better".into()),
                SpeakAction::Text("water please".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_chain_stops_when_no_context_matches() {
        let h = harness(quiet_settings(1.0, 0.0));
        chatter(&h, GROUP, 40, 30, 3_600).await;
        teach(&h, GROUP, "morning all", "coffee time", 4).await;

        let plan = h.engine.speak_at(BOT, noon()).await.unwrap().unwrap();
        assert_eq!(plan.actions, vec![SpeakAction::Text("coffee time".into())]);
    }

    #[tokio::test]
    async fn test_single_message_and_poke() {
        let h = harness(quiet_settings(0.0, 1.0));
        chatter(&h, GROUP, 40, 30, 3_600).await;
        teach(&h, GROUP, "morning all", "coffee time", 4).await;

        let plan = h.engine.speak_at(BOT, noon()).await.unwrap().unwrap();
        assert_eq!(plan.actions[0], SpeakAction::Text("coffee time".into()));
        assert!(matches!(plan.actions[1], SpeakAction::Poke(user) if (1..=3).contains(&user)));
        assert_eq!(plan.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_disqualified_groups() {
        let h = harness(quiet_settings(0.0, 0.0));
        teach(&h, GROUP, "morning all", "coffee time", 4).await;

        // Too few messages today
        chatter(&h, GROUP, 20, 30, 3_600).await;
        assert_eq!(h.engine.speak_at(BOT, noon()).await.unwrap(), None);

        // Still chatting: silence below avg interval * threshold
        let h = harness(quiet_settings(0.0, 0.0));
        teach(&h, GROUP, "morning all", "coffee time", 4).await;
        chatter(&h, GROUP, 40, 30, 10).await;
        assert_eq!(h.engine.speak_at(BOT, noon()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bot_spoke_recently() {
        let h = harness(quiet_settings(0.0, 0.0));
        teach(&h, GROUP, "morning all", "coffee time", 4).await;
        chatter(&h, GROUP, 40, 30, 3_600).await;
        let mut own = ChatMessage::outbound(GROUP, BOT, 500, "hi", noon().timestamp() - 60);
        h.engine.store().insert_message(&mut own).await.unwrap();
        assert_eq!(h.engine.speak_at(BOT, noon()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_group_stays_quiet() {
        for (speak_enable, enable) in [(false, true), (true, false), (true, true)] {
            let mut settings = quiet_settings(0.0, 0.0);
            if let Some(group) = settings.groups.get_mut(&GROUP.to_string()) {
                group.speak_enable = speak_enable;
                group.enable = enable;
            }
            let h = harness(settings);
            chatter(&h, GROUP, 40, 30, 3_600).await;
            teach(&h, GROUP, "morning all", "coffee time", 4).await;

            let plan = h.engine.speak_at(BOT, noon()).await.unwrap();
            assert_eq!(plan.is_some(), speak_enable && enable);
        }
    }

    #[tokio::test]
    async fn test_min_interval_since_bot_spoke() {
        for (min_interval, expect_plan) in [(7_200, false), (3_000, true)] {
            let mut settings = quiet_settings(0.0, 0.0);
            if let Some(group) = settings.groups.get_mut(&GROUP.to_string()) {
                group.speak_min_interval = min_interval;
            }
            let h = harness(settings);
            teach(&h, GROUP, "morning all", "coffee time", 4).await;
            // Bot spoke before the last user message, 4000s before noon
            let mut own = ChatMessage::outbound(GROUP, BOT, 500, "hi", noon().timestamp() - 4_000);
            h.engine.store().insert_message(&mut own).await.unwrap();
            chatter(&h, GROUP, 40, 30, 3_600).await;

            let plan = h.engine.speak_at(BOT, noon()).await.unwrap();
            assert_eq!(plan.is_some(), expect_plan, "min interval {min_interval}");
        }
    }

    #[tokio::test]
    async fn test_blacklisted_and_short_answers_skipped() {
        let h = harness(quiet_settings(0.0, 0.0));
        chatter(&h, GROUP, 40, 30, 3_600).await;
        teach(&h, GROUP, "morning all", "k", 4).await;
        teach(&h, GROUP, "evening all", "coffee time", 4).await;
        h.engine
            .store()
            .save_blacklist(&mut BlacklistEntry::new("coffee time", vec![GROUP], false))
            .await
            .unwrap();
        assert_eq!(h.engine.speak_at(BOT, noon()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_busiest_group_first() {
        let mut settings = quiet_settings(0.0, 0.0);
        let busy = settings.groups[&GROUP.to_string()].clone();
        settings.groups.insert("200".into(), busy);
        let h = harness(settings);
        chatter(&h, 200, 40, 60, 7_200).await;
        chatter(&h, GROUP, 40, 20, 3_600).await;
        teach(&h, 200, "morning all", "slow group text", 4).await;
        teach(&h, GROUP, "morning all", "busy group text", 4).await;

        let plan = h.engine.speak_at(BOT, noon()).await.unwrap().unwrap();
        assert_eq!(plan.group_id, GROUP);
        assert_eq!(plan.actions, vec![SpeakAction::Text("busy group text".into())]);
    }
}
