//! Content Filter
//!
//! Decides whether a candidate text and its signature may be learned or
//! surfaced. Called for both the stimulus and the response side.

use anyhow::Result;
use tracing::debug;

use crate::store::{ChatAnswer, ChatStore};

/// Rich-content segments that are never learned or surfaced
pub const BLOCKED_MARKERS: &[&str] = &[
    "[CQ:xml",
    "[CQ:json",
    "[CQ:at",
    "[CQ:video",
    "[CQ:record",
    "[CQ:share",
];

/// Escaped-bracket wrapper left behind when all content was stripped
const REDACTED_OPEN: &str = "&#91;";
const REDACTED_CLOSE: &str = "&#93;";

pub fn has_blocked_marker(text: &str) -> bool {
    BLOCKED_MARKERS.iter().any(|m| text.contains(m))
}

pub fn is_redacted(text: &str) -> bool {
    text.starts_with(REDACTED_OPEN) && text.ends_with(REDACTED_CLOSE)
}

/// Eligibility predicate bound to one group's effective ban words
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    ban_words: Vec<String>,
}

impl ContentFilter {
    pub fn new(ban_words: Vec<String>) -> Self {
        Self { ban_words }
    }

    /// Text-only checks: markers, ban words, redacted placeholder
    pub fn check_text(&self, text: &str) -> bool {
        if has_blocked_marker(text) {
            return false;
        }
        if self.ban_words.iter().any(|w| text.contains(w.as_str())) {
            return false;
        }
        !is_redacted(text)
    }

    /// Text checks plus the blacklist for `keywords` as seen from `group_id`
    pub async fn check_allow(
        &self,
        store: &ChatStore,
        text: &str,
        keywords: &str,
        group_id: i64,
    ) -> Result<bool> {
        if !self.check_text(text) {
            debug!("Rejected by text filter: {}", text);
            return Ok(false);
        }
        match store.blacklist_by_keywords(keywords).await? {
            Some(entry) if entry.blocks(group_id) => {
                debug!("Rejected by blacklist: {}", keywords);
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// An answer bundle is judged by its first text, in the group it was
    /// learned in and in `group_id` where it would be said
    pub async fn check_answer(
        &self,
        store: &ChatStore,
        answer: &ChatAnswer,
        group_id: i64,
    ) -> Result<bool> {
        let text = answer.messages.first().map(String::as_str).unwrap_or_default();
        if !self
            .check_allow(store, text, &answer.keywords, answer.group_id)
            .await?
        {
            return Ok(false);
        }
        if answer.group_id == group_id {
            return Ok(true);
        }
        self.check_allow(store, text, &answer.keywords, group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlacklistEntry;

    #[test]
    fn test_text_rules() {
        let filter = ContentFilter::new(vec!["spoiler".into()]);
        assert!(filter.check_text("good morning"));
        assert!(!filter.check_text("look [CQ:share,url=x]"));
        assert!(!filter.check_text("[CQ:at,qq=1] hey"));
        assert!(!filter.check_text("big spoiler ahead"));
        assert!(!filter.check_text("&#91;image&#93;"));
        assert!(filter.check_text("[CQ:image,file=a.jpg]"));
    }

    #[tokio::test]
    async fn test_blacklist_scopes() {
        let store = ChatStore::open_in_memory().unwrap();
        let filter = ContentFilter::default();
        store
            .save_blacklist(&mut BlacklistEntry::new("local sig", vec![1], false))
            .await
            .unwrap();
        store
            .save_blacklist(&mut BlacklistEntry::new("global sig", vec![], true))
            .await
            .unwrap();

        assert!(!filter.check_allow(&store, "t", "local sig", 1).await.unwrap());
        assert!(filter.check_allow(&store, "t", "local sig", 2).await.unwrap());
        assert!(!filter.check_allow(&store, "t", "global sig", 2).await.unwrap());
        assert!(filter.check_allow(&store, "t", "unbanned", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_answer_checked_where_it_would_be_said() {
        let store = ChatStore::open_in_memory().unwrap();
        let filter = ContentFilter::default();
        store
            .save_blacklist(&mut BlacklistEntry::new("promoted", vec![100], false))
            .await
            .unwrap();
        let answer = ChatAnswer::new("promoted", 1, 0, 1, "promoted");

        assert!(filter.check_answer(&store, &answer, 1).await.unwrap());
        assert!(filter.check_answer(&store, &answer, 2).await.unwrap());
        assert!(!filter.check_answer(&store, &answer, 100).await.unwrap());
    }
}
