//! Learning Settings
//!
//! Global and per-group behaviour knobs, persisted as TOML.
//!
//! The engine never reads settings from ambient state: every inbound event
//! takes an [`Arc<ChatSettings>`] snapshot up front and decides against it.
//! Mutations go through [`SettingsManager`], which validates before saving.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Settings load/save errors. All of these are startup-fatal.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Settings serialize failed: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid setting `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl SettingsError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Per-group behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    /// Learn and reply in this group
    pub enable: bool,
    /// Group-local banned words (merged with the global list)
    pub ban_words: Vec<String>,
    /// Group-local ignored senders (merged with the global list)
    pub ban_users: Vec<i64>,
    /// Highest reply-count threshold of the weighted draw
    pub answer_threshold: i64,
    /// One weight per threshold, ascending threshold order
    pub answer_threshold_weights: Vec<u32>,
    /// Identical messages needed before the bot joins a repeat
    pub repeat_threshold: usize,
    /// Chance of breaking a repeat instead of joining it
    pub break_probability: f64,
    /// Allow proactive speaking
    pub speak_enable: bool,
    /// Silence multiplier over the average message interval
    pub speak_threshold: i64,
    /// Minimum seconds between bot messages in the group
    pub speak_min_interval: i64,
    /// Chance of extending a proactive chain by one more message
    pub speak_continuously_probability: f64,
    /// Longest proactive chain
    pub speak_continuously_max_len: usize,
    /// Chance of poking a recent speaker after a proactive chain
    pub speak_poke_probability: f64,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            enable: true,
            ban_words: Vec::new(),
            ban_users: Vec::new(),
            answer_threshold: 4,
            answer_threshold_weights: vec![10, 30, 60],
            repeat_threshold: 3,
            break_probability: 0.25,
            speak_enable: true,
            speak_threshold: 5,
            speak_min_interval: 300,
            speak_continuously_probability: 0.5,
            speak_continuously_max_len: 3,
            speak_poke_probability: 0.5,
        }
    }
}

impl GroupSettings {
    /// Thresholds the weighted draw picks from, ascending.
    ///
    /// `answer_threshold - len(weights) + 1 ..= answer_threshold`, paired
    /// index-for-index with `answer_threshold_weights`.
    pub fn threshold_choices(&self) -> Vec<i64> {
        let len = self.answer_threshold_weights.len() as i64;
        (self.answer_threshold - len + 1..=self.answer_threshold).collect()
    }

    pub fn validate(&self, scope: &str) -> Result<(), SettingsError> {
        if self.answer_threshold_weights.is_empty() {
            return Err(SettingsError::invalid(
                format!("{scope}.answer_threshold_weights"),
                "at least one weight is required",
            ));
        }
        if self.answer_threshold_weights.iter().all(|w| *w == 0) {
            return Err(SettingsError::invalid(
                format!("{scope}.answer_threshold_weights"),
                "weights must not all be zero",
            ));
        }
        if self.answer_threshold < self.answer_threshold_weights.len() as i64 {
            return Err(SettingsError::invalid(
                format!("{scope}.answer_threshold"),
                format!(
                    "must be at least the number of weights ({})",
                    self.answer_threshold_weights.len()
                ),
            ));
        }
        for (field, value) in [
            ("break_probability", self.break_probability),
            ("speak_continuously_probability", self.speak_continuously_probability),
            ("speak_poke_probability", self.speak_poke_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SettingsError::invalid(
                    format!("{scope}.{field}"),
                    format!("{value} is outside [0, 1]"),
                ));
            }
        }
        if self.repeat_threshold == 0 {
            return Err(SettingsError::invalid(
                format!("{scope}.repeat_threshold"),
                "must be at least 1",
            ));
        }
        if self.speak_continuously_max_len == 0 {
            return Err(SettingsError::invalid(
                format!("{scope}.speak_continuously_max_len"),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Global behaviour plus the per-group table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Master switch for learning, replying and speaking
    pub total_enable: bool,
    pub ban_words: Vec<String>,
    pub ban_users: Vec<i64>,
    /// Top-K keywords extracted per message
    pub keywords_size: usize,
    /// Distinct groups an answer signature needs before it is used everywhere
    pub cross_group_threshold: i64,
    /// Cap on context and answer counts
    pub learn_max_count: i64,
    /// Extra words for the keyword extractor
    pub dictionary: Vec<String>,
    /// Bot nickname, used for addressing and canned phrases
    pub nickname: String,
    pub superusers: Vec<i64>,
    /// Messages starting with any of these are commands, never learned
    pub command_prefixes: Vec<String>,
    /// Per-group overrides keyed by group id
    pub groups: BTreeMap<String, GroupSettings>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            total_enable: true,
            ban_words: Vec::new(),
            ban_users: Vec::new(),
            keywords_size: 3,
            cross_group_threshold: 3,
            learn_max_count: 6,
            dictionary: Vec::new(),
            nickname: "bot".to_string(),
            superusers: Vec::new(),
            command_prefixes: Vec::new(),
            groups: BTreeMap::new(),
        }
    }
}

impl ChatSettings {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings for a group, defaults when the group has no entry
    pub fn group(&self, group_id: i64) -> GroupSettings {
        self.groups
            .get(&group_id.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Global ∪ group ignored senders
    pub fn effective_ban_users(&self, group: &GroupSettings) -> HashSet<i64> {
        self.ban_users
            .iter()
            .chain(group.ban_users.iter())
            .copied()
            .collect()
    }

    /// Global ∪ group banned words
    pub fn effective_ban_words(&self, group: &GroupSettings) -> Vec<String> {
        let mut seen = HashSet::new();
        self.ban_words
            .iter()
            .chain(group.ban_words.iter())
            .filter(|w| !w.is_empty() && seen.insert(w.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_superuser(&self, user_id: i64) -> bool {
        self.superusers.contains(&user_id)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.keywords_size == 0 {
            return Err(SettingsError::invalid("keywords_size", "must be at least 1"));
        }
        if self.learn_max_count < 1 {
            return Err(SettingsError::invalid("learn_max_count", "must be at least 1"));
        }
        if self.cross_group_threshold < 1 {
            return Err(SettingsError::invalid(
                "cross_group_threshold",
                "must be at least 1",
            ));
        }
        for (key, group) in &self.groups {
            if key.parse::<i64>().is_err() {
                return Err(SettingsError::invalid(
                    format!("groups.{key}"),
                    "group key must be a numeric group id",
                ));
            }
            group.validate(&format!("groups.{key}"))?;
        }
        Ok(())
    }
}

/// Owner of the live settings.
///
/// Readers take cheap `Arc` snapshots; writers apply a change to a copy,
/// validate it, persist it, then swap it in.
#[derive(Debug)]
pub struct SettingsManager {
    path: Option<PathBuf>,
    current: RwLock<Arc<ChatSettings>>,
}

impl SettingsManager {
    /// Load from a TOML file, creating it with defaults when missing
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            ChatSettings::from_toml_str(&content)?
        } else {
            info!("Settings file {} missing, writing defaults", path.display());
            ChatSettings::default()
        };

        let manager = Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(settings)),
        };
        manager.save(&manager.snapshot())?;

        info!("Settings loaded: {}", path.display());
        Ok(manager)
    }

    /// Settings that are never written to disk (tests, embedding)
    pub fn in_memory(settings: ChatSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn snapshot(&self) -> Arc<ChatSettings> {
        self.current.read().clone()
    }

    /// Apply a change to the global settings
    pub fn update_global<F>(&self, change: F) -> Result<Arc<ChatSettings>, SettingsError>
    where
        F: FnOnce(&mut ChatSettings),
    {
        let mut next = (*self.snapshot()).clone();
        change(&mut next);
        self.commit(next)
    }

    /// Apply the same change to each listed group's settings
    pub fn update_groups<F>(
        &self,
        group_ids: &[i64],
        change: F,
    ) -> Result<Arc<ChatSettings>, SettingsError>
    where
        F: Fn(&mut GroupSettings),
    {
        let mut next = (*self.snapshot()).clone();
        for group_id in group_ids {
            let entry = next
                .groups
                .entry(group_id.to_string())
                .or_default();
            change(entry);
        }
        self.commit(next)
    }

    /// Toggle learning for one group
    pub fn set_group_enable(&self, group_id: i64, enable: bool) -> Result<(), SettingsError> {
        self.update_groups(&[group_id], |group| group.enable = enable)?;
        Ok(())
    }

    fn commit(&self, next: ChatSettings) -> Result<Arc<ChatSettings>, SettingsError> {
        next.validate()?;
        self.save(&next)?;
        let next = Arc::new(next);
        *self.current.write() = next.clone();
        Ok(next)
    }

    fn save(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(settings)?)?;
        debug!("Settings saved: {}", path.display());
        Ok(())
    }
}
