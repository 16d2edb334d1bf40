//! Moderation
//!
//! Bans keyword signatures. A signature banned in one group is purged from
//! that group only; once two distinct groups have banned it the ban turns
//! global and every answer with it is purged. The owning context is always
//! reset so the stimulus has to be relearned.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::engine::{LearningChat, Turn};
use crate::message::ChatMessage;
use crate::store::{BlacklistEntry, ChatAnswer, ChatContext};

/// Local bans needed before a signature is banned everywhere
const GLOBAL_BAN_GROUPS: usize = 2;

/// Record an administrator bans directly
#[derive(Debug, Clone)]
pub enum BanTarget {
    /// Group-scoped ban of the message's signature
    Message(ChatMessage),
    /// Global ban of the context's signature
    Context(ChatContext),
    /// Ban of the answer's signature in the answer's group. The answer's
    /// owning context is reset too.
    Answer(ChatAnswer),
}

impl LearningChat {
    /// Ban what the bot said, from a chat command.
    ///
    /// Targets the stored message with platform id `message_id`, or the
    /// bot's own latest message in the group. Returns `false` when there is
    /// nothing eligible to ban.
    pub async fn ban(&self, turn: &Turn, message_id: Option<i64>) -> Result<bool> {
        let group_id = turn.group_id();
        let target = match message_id {
            Some(id) => self.store.message_by_platform_id(id).await?,
            None => self.store.last_message_from(group_id, self.self_id).await?,
        };
        let Some(target) = target else {
            debug!("Nothing to ban in group {}", group_id);
            return Ok(false);
        };
        if turn.phrases().is_canned(&target.message) {
            debug!("Refusing to ban a canned phrase: {}", target.message);
            return Ok(false);
        }

        if let Err(e) = self.adapter.delete_message(target.message_id).await {
            warn!(
                "Could not retract message {} via {}: {}",
                target.message_id,
                self.adapter.name(),
                e
            );
        }

        let keywords = self.signature(turn, &target).to_string();
        self.ban_in_group(&keywords, group_id).await?;
        Ok(true)
    }

    /// Ban a record chosen by an administrator
    pub async fn add_ban(&self, target: &BanTarget) -> Result<BlacklistEntry> {
        match target {
            BanTarget::Message(message) => {
                let top_k = self.settings.snapshot().keywords_size;
                let keywords = message
                    .keywords(self.extractor.as_ref(), top_k)
                    .to_string();
                self.ban_in_group(&keywords, message.group_id).await
            }
            BanTarget::Context(context) => self.ban_globally(&context.keywords).await,
            BanTarget::Answer(answer) => {
                let entry = self.ban_in_group(&answer.keywords, answer.group_id).await?;
                if let Some(context_id) = answer.context_id {
                    self.store.delete_context(context_id).await?;
                }
                Ok(entry)
            }
        }
    }

    async fn ban_in_group(&self, keywords: &str, group_id: i64) -> Result<BlacklistEntry> {
        let mut entry = match self.store.blacklist_by_keywords(keywords).await? {
            Some(mut entry) => {
                if !entry.ban_group_id.contains(&group_id) {
                    entry.ban_group_id.push(group_id);
                }
                entry
            }
            None => BlacklistEntry::new(keywords, vec![group_id], false),
        };

        if entry.ban_group_id.len() >= GLOBAL_BAN_GROUPS {
            entry.global_ban = true;
            let purged = self.store.delete_answers_by_keywords(keywords, None).await?;
            info!(
                "Globally banned [{}] ({} groups, {} answers purged)",
                keywords,
                entry.ban_group_id.len(),
                purged
            );
        } else {
            let purged = self
                .store
                .delete_answers_by_keywords(keywords, Some(group_id))
                .await?;
            info!(
                "Banned [{}] in group {} ({} answers purged)",
                keywords, group_id, purged
            );
        }

        self.finish_ban(keywords, entry).await
    }

    async fn ban_globally(&self, keywords: &str) -> Result<BlacklistEntry> {
        let entry = match self.store.blacklist_by_keywords(keywords).await? {
            Some(mut entry) => {
                entry.global_ban = true;
                entry
            }
            None => BlacklistEntry::new(keywords, Vec::new(), true),
        };
        let purged = self.store.delete_answers_by_keywords(keywords, None).await?;
        info!("Globally banned [{}] ({} answers purged)", keywords, purged);
        self.finish_ban(keywords, entry).await
    }

    async fn finish_ban(&self, keywords: &str, mut entry: BlacklistEntry) -> Result<BlacklistEntry> {
        // Contexts with this signature start over
        self.store.delete_contexts_by_keywords(keywords).await?;
        self.store.save_blacklist(&mut entry).await?;
        Ok(entry)
    }
}
