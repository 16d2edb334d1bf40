//! Reply assembly
//!
//! Turns a classified inbound message into zero or one reply text.

use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::engine::{ChatEvent, Classification, LearningChat, Turn};
use crate::phrases::PhraseKind;
use crate::random::{self, chance};

/// Extra messages scanned for the bot's own copy of a repeat
const REPEAT_LOOKBACK_EXTRA: usize = 5;
const REPEAT_WINDOW_SECONDS: i64 = 3600;

/// Draw weights for answers with the given counts, plus a trailing
/// "say nothing" weight.
///
/// Each answer weighs `count / total * (1 - 1 / count)`, so a count of one
/// can never be drawn and higher counts dominate.
pub fn reply_weights(counts: &[i64]) -> Vec<f64> {
    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    let mut weights: Vec<f64> = counts
        .iter()
        .map(|&c| {
            let c = c as f64;
            if total <= 0.0 || c <= 0.0 {
                0.0
            } else {
                c / total * (1.0 - 1.0 / c)
            }
        })
        .collect();
    let used: f64 = weights.iter().sum();
    weights.push((1.0 - used).max(0.0));
    weights
}

impl LearningChat {
    /// Handle one inbound event end to end: classify, persist, reply
    pub async fn answer(&self, event: &ChatEvent) -> Result<Option<String>> {
        let mut turn = self.turn(event);
        let classification = self.classify(&turn).await?;
        self.store.insert_message(&mut turn.data).await?;
        self.produce_reply(&turn, classification).await
    }

    /// Reply for an already classified and persisted turn
    pub async fn produce_reply(
        &self,
        turn: &Turn,
        classification: Classification,
    ) -> Result<Option<String>> {
        let phrases = turn.phrases();
        let phrase = |kind| random::pick(self.rng.as_ref(), &phrases.get(kind)).cloned();

        match classification {
            Classification::Pass => Ok(None),
            Classification::Ban => {
                if !turn.role.is_elevated() {
                    return Ok(phrase(PhraseKind::NoPermission));
                }
                let banned = self.ban(turn, turn.reply_to).await?;
                Ok(phrase(if banned {
                    PhraseKind::Sorry
                } else {
                    PhraseKind::Doubt
                }))
            }
            Classification::SetEnable | Classification::SetDisable => {
                if !turn.role.is_elevated() {
                    return Ok(phrase(PhraseKind::NoPermission));
                }
                let enable = classification == Classification::SetEnable;
                self.settings.set_group_enable(turn.group_id(), enable)?;
                info!(
                    "Learning {} in group {} by {}",
                    if enable { "enabled" } else { "disabled" },
                    turn.group_id(),
                    turn.data.user_id
                );
                Ok(phrase(if enable {
                    PhraseKind::Enable
                } else {
                    PhraseKind::Disable
                }))
            }
            Classification::Learn => self.reply(turn).await,
            Classification::Repeat => self.repeat(turn).await,
        }
    }

    /// Reply count thresholds `(same group, cross group)` for a turn
    pub fn reply_thresholds(&self, turn: &Turn) -> (i64, i64) {
        if turn.to_me {
            return (1, 1);
        }
        let choices = turn.group.threshold_choices();
        let weights: Vec<f64> = turn
            .group
            .answer_threshold_weights
            .iter()
            .map(|&w| w as f64)
            .collect();
        let mut threshold = random::weighted_choice(self.rng.as_ref(), &choices, &weights)
            .copied()
            .unwrap_or(turn.group.answer_threshold);
        if self.keyword_list(turn, &turn.data).len() == turn.settings.keywords_size {
            threshold -= 1;
        }
        (threshold, turn.settings.cross_group_threshold)
    }

    async fn reply(&self, turn: &Turn) -> Result<Option<String>> {
        if turn.data.is_short() {
            return Ok(None);
        }
        let signature = self.signature(turn, &turn.data);
        let Some(context) = self.store.context_by_keywords(signature).await? else {
            debug!("No context for [{}]", signature);
            return Ok(None);
        };

        let (threshold, cross_threshold) = self.reply_thresholds(turn);
        let local = self
            .store
            .answers_for_context(context.id, threshold, Some(turn.group_id()))
            .await?;
        let promoted = self
            .store
            .cross_group_answers(context.id, threshold, cross_threshold)
            .await?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for answer in local.into_iter().chain(promoted) {
            if !seen.insert(answer.id) {
                continue;
            }
            if turn
                .filter
                .check_answer(&self.store, &answer, turn.group_id())
                .await?
            {
                candidates.push(answer);
            }
        }
        if candidates.is_empty() {
            debug!(
                "No answer for [{}] at threshold {} in group {}",
                signature,
                threshold,
                turn.group_id()
            );
            return Ok(None);
        }

        let counts: Vec<i64> = candidates.iter().map(|a| a.count).collect();
        let weights = reply_weights(&counts);
        let chosen = random::weighted_index(self.rng.as_ref(), &weights)
            .and_then(|i| candidates.get(i));
        let Some(answer) = chosen else {
            debug!("Chose to stay quiet on [{}]", signature);
            return Ok(None);
        };
        let Some(text) = random::pick(self.rng.as_ref(), &answer.messages).cloned() else {
            return Ok(None);
        };

        self.pacing.pause(&self.pacing.typing, self.rng.as_ref()).await;
        Ok(Some(text))
    }

    /// Join or break an ongoing repeat. The turn's message is already stored.
    async fn repeat(&self, turn: &Turn) -> Result<Option<String>> {
        let group_id = turn.group_id();
        let text = &turn.data.message;
        let since = turn.data.time - REPEAT_WINDOW_SECONDS;
        let threshold = turn.group.repeat_threshold;

        if self
            .store
            .sent_recently(
                group_id,
                self.self_id,
                text,
                since,
                threshold + REPEAT_LOOKBACK_EXTRA,
            )
            .await?
        {
            debug!("Already joined the repeat in group {}", group_id);
            return Ok(None);
        }

        let recent = self.store.recent_messages(group_id, since, threshold).await?;
        let repeating = recent.len() >= threshold
            && recent.iter().all(|m| &m.message == text)
            && recent.iter().any(|m| m.user_id != turn.data.user_id);
        if !repeating {
            return Ok(None);
        }

        if chance(self.rng.as_ref(), turn.group.break_probability) {
            info!("Breaking repeat in group {}", group_id);
            let phrases = turn.phrases().get(PhraseKind::BreakRepeat);
            return Ok(random::pick(self.rng.as_ref(), &phrases).cloned());
        }
        info!("Joining repeat in group {}: {}", group_id, text);
        Ok(Some(text.clone()))
    }
}
