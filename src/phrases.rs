//! Canned phrases and trigger words

/// Addressed-to-bot words that switch learning on
pub const ENABLE_TRIGGERS: &[&str] = &["学说话", "快学", "开启学习", "start learning"];

/// Addressed-to-bot words that switch learning off
pub const DISABLE_TRIGGERS: &[&str] = &["闭嘴", "别学", "关闭学习", "stop learning", "shut up"];

/// Addressed-to-bot words that ask to ban what the bot said
pub const BAN_TRIGGERS: &[&str] = &["不可以", "达咩", "不能说这", "don't say that", "dont say that"];

/// Which canned list a phrase comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseKind {
    NoPermission,
    Enable,
    Disable,
    Sorry,
    Doubt,
    BreakRepeat,
}

const ALL_KINDS: [PhraseKind; 6] = [
    PhraseKind::NoPermission,
    PhraseKind::Enable,
    PhraseKind::Disable,
    PhraseKind::Sorry,
    PhraseKind::Doubt,
    PhraseKind::BreakRepeat,
];

/// Phrases rendered with the bot's nickname
#[derive(Debug, Clone)]
pub struct Phrases {
    nickname: String,
}

impl Phrases {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
        }
    }

    pub fn get(&self, kind: PhraseKind) -> Vec<String> {
        let n = &self.nickname;
        match kind {
            PhraseKind::NoPermission => vec![
                format!("{n} just likes saying that, hmph!"),
                format!("Who are you to boss {n} around!"),
            ],
            PhraseKind::Enable => vec![
                format!("{n} will try to pick up how you all talk!"),
                format!("Okay, let {n} learn the way you speak~"),
            ],
            PhraseKind::Disable => vec![
                format!("Fine, fine, {n} won't learn to talk!"),
                format!("Sorry... {n} won't learn anymore..."),
            ],
            PhraseKind::Sorry => vec![
                format!("{n} knows that was wrong..."),
                format!("{n} won't say that again..."),
                format!("Sorry, {n} said the wrong thing..."),
            ],
            PhraseKind::Doubt => vec![format!("Did {n} say anything weird?")],
            PhraseKind::BreakRepeat => vec!["Breaking the repeat!".to_string(), "Break!".to_string()],
        }
    }

    /// Whether `text` is one of the bot's own stock responses
    pub fn is_canned(&self, text: &str) -> bool {
        ALL_KINDS
            .iter()
            .any(|kind| self.get(*kind).iter().any(|p| p == text))
    }
}

/// Any trigger contained in `text`
pub fn contains_any(text: &str, triggers: &[&str]) -> bool {
    let lower = text.to_lowercase();
    triggers.iter().any(|t| lower.contains(t))
}
