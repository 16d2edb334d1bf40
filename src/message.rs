//! Chat Messages
//!
//! One observed group message (inbound or sent by the bot) with lazily
//! cached keyword analysis.

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::keywords::{self, KeywordExtractor};

/// Image segments carry a volatile `subType`/`url` tail; collapse it
static IMAGE_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",subType=\d+,url=[^\]]*\]").expect("valid regex"));

/// Mention and reply markup never takes part in learning
static MENTION_OR_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[CQ:(?:at,qq|reply,id)=[^\]]*\]").expect("valid regex"));

static ANY_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[CQ:[^\]]*\]").expect("valid regex"));

/// Marker that opens every rich-content segment
pub const RICH_SEGMENT_MARKER: &str = "[CQ:";

/// Strip mention/reply markup and image tails from raw platform text
pub fn normalize(raw: &str) -> String {
    let collapsed = IMAGE_TAIL.replace_all(raw, "]");
    MENTION_OR_REPLY
        .replace_all(&collapsed, "")
        .trim()
        .to_string()
}

/// Plain-text projection: every rich segment removed
pub fn plain_projection(text: &str) -> String {
    ANY_SEGMENT.replace_all(text, "").trim().to_string()
}

/// A stored chat message
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Row id, 0 until persisted
    pub id: i64,
    pub group_id: i64,
    pub user_id: i64,
    /// Platform message id
    pub message_id: i64,
    /// Normalized text (mention/reply markup stripped)
    pub message: String,
    pub raw_message: String,
    pub plain_text: String,
    /// Unix seconds
    pub time: i64,

    keyword_list: OnceCell<Vec<String>>,
    keywords: OnceCell<String>,
}

impl ChatMessage {
    /// Build from raw platform text, normalizing it
    pub fn new(
        group_id: i64,
        user_id: i64,
        message_id: i64,
        raw_message: &str,
        plain_text: &str,
        time: i64,
    ) -> Self {
        Self::from_parts(
            0,
            group_id,
            user_id,
            message_id,
            normalize(raw_message),
            raw_message.to_string(),
            plain_text.to_string(),
            time,
        )
    }

    /// A message the bot sent itself
    pub fn outbound(group_id: i64, self_id: i64, message_id: i64, text: &str, time: i64) -> Self {
        Self::from_parts(
            0,
            group_id,
            self_id,
            message_id,
            text.to_string(),
            text.to_string(),
            plain_projection(text),
            time,
        )
    }

    /// Rehydrate a stored row
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: i64,
        group_id: i64,
        user_id: i64,
        message_id: i64,
        message: String,
        raw_message: String,
        plain_text: String,
        time: i64,
    ) -> Self {
        Self {
            id,
            group_id,
            user_id,
            message_id,
            message,
            raw_message,
            plain_text,
            time,
            keyword_list: OnceCell::new(),
            keywords: OnceCell::new(),
        }
    }

    /// No embedded rich-content segments
    pub fn is_plain_text(&self) -> bool {
        !self.message.contains(RICH_SEGMENT_MARKER)
    }

    /// Plain text of at most one visible character
    pub fn is_short(&self) -> bool {
        self.is_plain_text() && self.plain_text.chars().count() <= 1
    }

    /// Top-K keywords of the plain text. Computed once per instance.
    pub fn keyword_list(&self, extractor: &dyn KeywordExtractor, top_k: usize) -> &[String] {
        self.keyword_list.get_or_init(|| {
            keywords::keyword_list(extractor, self.is_plain_text(), &self.plain_text, top_k)
        })
    }

    /// Keyword signature. Computed once per instance.
    pub fn keywords(&self, extractor: &dyn KeywordExtractor, top_k: usize) -> &str {
        self.keywords.get_or_init(|| {
            let list = self.keyword_list(extractor, top_k);
            keywords::signature(&self.message, list, self.is_plain_text(), &self.plain_text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::FrequencyExtractor;

    #[test]
    fn test_normalize_strips_mentions_and_replies() {
        let raw = "[CQ:reply,id=123][CQ:at,qq=456] hello there";
        assert_eq!(normalize(raw), "hello there");
    }

    #[test]
    fn test_normalize_collapses_image_tail() {
        let raw = "[CQ:image,file=a.jpg,subType=0,url=https://x/y?z=1] nice";
        assert_eq!(normalize(raw), "[CQ:image,file=a.jpg] nice");
    }

    #[test]
    fn test_plain_projection() {
        assert_eq!(plain_projection("[CQ:face,id=1]hi [CQ:image,file=b]"), "hi");
    }

    #[test]
    fn test_outbound_message() {
        let msg = ChatMessage::outbound(1, 99, 7, "[CQ:face,id=2]good morning", 1000);
        assert_eq!(msg.user_id, 99);
        assert_eq!(msg.plain_text, "good morning");
        assert!(!msg.is_plain_text());
    }

    #[test]
    fn test_keywords_cached() {
        let extractor = FrequencyExtractor::new();
        let msg = ChatMessage::new(1, 2, 3, "coffee machine broken again", "coffee machine broken again", 10);
        let first = msg.keywords(&extractor, 3).to_string();
        assert_eq!(first, "coffee machine broken");
        // Different top_k does not recompute
        assert_eq!(msg.keywords(&extractor, 1), first);
    }

    #[test]
    fn test_short_message() {
        let msg = ChatMessage::new(1, 2, 3, "?", "?", 10);
        assert!(msg.is_short());
        let image = ChatMessage::new(1, 2, 3, "[CQ:image,file=a]", "", 10);
        assert!(!image.is_short());
    }
}
