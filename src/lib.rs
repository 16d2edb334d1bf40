//! Learning Chat
//!
//! A group-chat bot that learns how a group talks and talks back.
//!
//! # Features
//!
//! - **Learning**: pairs each message with the message it answers, keyed by
//!   keyword signatures
//! - **Replies**: weighted draw over learned answers, with cross-group
//!   promotion of answers many groups agree on
//! - **Repeats**: joins (or breaks) a chain of identical messages
//! - **Moderation**: per-group bans that turn global after a second group
//! - **Proactive speaking**: chains learned lines into quiet, busy groups
//!
//! # Architecture
//!
//! ```text
//! ChatAdapter ──► LearningChat ──► classify ──► learn
//!   (console)        │                 │
//!      ▲             │                 └──► answer / ban / toggle
//!      │             ├── ChatStore (SQLite)
//!      │             ├── SettingsManager (TOML)
//!      │             └── KeywordExtractor
//!      │
//!  Dispatcher ◄── SpeakScheduler ──► speak
//! ```

pub mod adapter;
pub mod admin;
pub mod config;
pub mod console;
pub mod engine;
pub mod filter;
pub mod keywords;
pub mod message;
pub mod moderation;
pub mod phrases;
pub mod random;
pub mod responder;
pub mod scheduler;
pub mod settings;
pub mod speaker;
pub mod store;

pub use adapter::{AdapterError, ChatAdapter, Dispatcher, Pacing};
pub use admin::{AdminService, RecordKind};
pub use config::Config;
pub use console::{serve_lines, ConsoleAdapter};
pub use engine::{ChatEvent, Classification, LearningChat, SenderRole, Turn};
pub use filter::ContentFilter;
pub use keywords::{FrequencyExtractor, KeywordExtractor};
pub use message::ChatMessage;
pub use moderation::BanTarget;
pub use random::{RandomSource, ScriptedRandom, StdRandom};
pub use responder::reply_weights;
pub use scheduler::SpeakScheduler;
pub use settings::{ChatSettings, GroupSettings, SettingsError, SettingsManager};
pub use speaker::{SpeakAction, SpeakPlan};
pub use store::{
    AnswerFilter, BlacklistEntry, ChatAnswer, ChatContext, ChatStore, MessageFilter, Page,
    PageQuery,
};
