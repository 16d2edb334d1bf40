//! Administrative operations
//!
//! Record browsing and maintenance for operators: paged listings, deletes,
//! bans, bulk clears, retention cleanup and settings changes that must
//! keep stored data consistent with the new limits.

use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::engine::LearningChat;
use crate::message::ChatMessage;
use crate::moderation::BanTarget;
use crate::settings::{ChatSettings, GroupSettings};
use crate::store::{
    AnswerFilter, BlacklistEntry, ChatAnswer, ChatContext, MessageFilter, Page, PageQuery,
};

/// Stored record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
    Context,
    Answer,
    Blacklist,
}

impl FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "message" => Ok(RecordKind::Message),
            "context" => Ok(RecordKind::Context),
            "answer" => Ok(RecordKind::Answer),
            "blacklist" => Ok(RecordKind::Blacklist),
            other => Err(anyhow!("Unknown record kind: {}", other)),
        }
    }
}

pub struct AdminService {
    engine: Arc<LearningChat>,
}

impl AdminService {
    pub fn new(engine: Arc<LearningChat>) -> Self {
        Self { engine }
    }

    pub async fn messages(&self, filter: &MessageFilter, query: &PageQuery) -> Result<Page<ChatMessage>> {
        self.engine.store().list_messages(filter, query).await
    }

    pub async fn contexts(&self, keywords: Option<&str>, query: &PageQuery) -> Result<Page<ChatContext>> {
        self.engine.store().list_contexts(keywords, query).await
    }

    pub async fn answers(&self, filter: &AnswerFilter, query: &PageQuery) -> Result<Page<ChatAnswer>> {
        self.engine.store().list_answers(filter, query).await
    }

    /// Blacklist page, optionally narrowed to a scope label ("global" or a
    /// group id)
    pub async fn blacklist(
        &self,
        keywords: Option<&str>,
        scope: Option<&str>,
        query: &PageQuery,
    ) -> Result<Page<BlacklistEntry>> {
        self.engine.store().list_blacklist(keywords, scope, query).await
    }

    /// Delete one record. Deleting a context deletes its answers.
    pub async fn delete(&self, kind: RecordKind, id: i64) -> Result<bool> {
        let store = self.engine.store();
        let deleted = match kind {
            RecordKind::Message => store.delete_message(id).await?,
            RecordKind::Context => store.delete_context(id).await?,
            RecordKind::Answer => store.delete_answer(id).await?,
            RecordKind::Blacklist => store.delete_blacklist(id).await?,
        };
        if deleted {
            info!("Deleted {:?} {}", kind, id);
        }
        Ok(deleted)
    }

    /// Ban a stored record's signature
    pub async fn ban(&self, kind: RecordKind, id: i64) -> Result<BlacklistEntry> {
        let store = self.engine.store();
        let target = match kind {
            RecordKind::Message => BanTarget::Message(
                store
                    .message_by_id(id)
                    .await?
                    .ok_or_else(|| anyhow!("Message {} not found", id))?,
            ),
            RecordKind::Context => BanTarget::Context(
                store
                    .context_by_id(id)
                    .await?
                    .ok_or_else(|| anyhow!("Context {} not found", id))?,
            ),
            RecordKind::Answer => BanTarget::Answer(
                store
                    .answer_by_id(id)
                    .await?
                    .ok_or_else(|| anyhow!("Answer {} not found", id))?,
            ),
            RecordKind::Blacklist => bail!("Blacklist entries cannot be banned"),
        };
        self.engine.add_ban(&target).await
    }

    /// Delete every record of a kind. Answers may be limited to one context.
    pub async fn delete_all(&self, kind: RecordKind, context_id: Option<i64>) -> Result<usize> {
        let store = self.engine.store();
        let deleted = match (kind, context_id) {
            (RecordKind::Answer, Some(context_id)) => store.delete_answers_for_context(context_id).await?,
            (RecordKind::Message, _) => store.delete_all_messages().await?,
            (RecordKind::Context, _) => store.delete_all_contexts().await?,
            (RecordKind::Answer, None) => store.delete_all_answers().await?,
            (RecordKind::Blacklist, _) => store.delete_all_blacklist().await?,
        };
        info!("Deleted all {:?} records ({})", kind, deleted);
        Ok(deleted)
    }

    /// Retention cleanup of messages older than `before`
    pub async fn purge_messages_before(&self, before: i64) -> Result<usize> {
        let purged = self.engine.store().delete_messages_before(before).await?;
        info!("Purged {} messages before {}", purged, before);
        Ok(purged)
    }

    /// Change global settings, then clamp stored counts to the new cap and
    /// replace the extractor's dictionary
    pub async fn update_global<F>(&self, change: F) -> Result<Arc<ChatSettings>>
    where
        F: FnOnce(&mut ChatSettings),
    {
        let settings = self.engine.settings().update_global(change)?;
        let (contexts, answers) = self
            .engine
            .store()
            .clamp_counts(settings.learn_max_count)
            .await?;
        if contexts + answers > 0 {
            info!(
                "Clamped {} contexts and {} answers to {}",
                contexts, answers, settings.learn_max_count
            );
        }
        self.engine.extractor().replace_dictionary(&settings.dictionary);
        Ok(settings)
    }

    /// Change settings of each listed group
    pub async fn update_groups<F>(&self, group_ids: &[i64], change: F) -> Result<Arc<ChatSettings>>
    where
        F: Fn(&mut GroupSettings),
    {
        if group_ids.is_empty() {
            bail!("No groups selected");
        }
        let settings = self.engine.settings().update_groups(group_ids, change)?;
        info!("Updated settings of groups {:?}", group_ids);
        Ok(settings)
    }
}
