//! Keyword Signatures
//!
//! Maps message text to an ordered keyword list and a canonical signature
//! string. Two messages "mean the same thing" for learning purposes exactly
//! when their signatures are equal.
//!
//! Extraction is pluggable through [`KeywordExtractor`]; the built-in
//! [`FrequencyExtractor`] ranks tokens by frequency and segments CJK runs
//! with a user dictionary falling back to overlapping bigrams.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Joins keywords into a signature
pub const SIGNATURE_SEPARATOR: &str = " ";

/// Longest dictionary word considered during CJK segmentation
const MAX_DICT_WORD_CHARS: usize = 8;

const STOPWORDS: &[&str] = &[
    // English
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her",
    "was", "one", "our", "out", "has", "him", "his", "how", "its", "who", "did", "yes",
    "get", "got", "too", "use", "that", "this", "with", "have", "from", "they", "will",
    "what", "when", "your", "just", "than", "then", "them", "been", "were", "into",
    "also", "some", "very", "there", "their", "about", "would", "which", "could",
    "is", "it", "to", "of", "in", "on", "at", "be", "as", "an", "or", "if", "so", "do",
    "my", "me", "we", "he", "she", "no", "by", "up", "am", "oh", "ok",
    // Chinese function bigrams
    "我们", "你们", "他们", "她们", "什么", "这个", "那个", "就是", "不是", "还是", "但是",
    "因为", "所以", "然后", "如果", "可以", "没有", "一个", "自己", "这样", "怎么", "这么",
    "那么", "已经", "的话", "时候", "知道",
];

/// Keyword extraction, language specific and pluggable
pub trait KeywordExtractor: Send + Sync {
    /// Up to `top_k` keywords of `text`, most significant first
    fn extract(&self, text: &str, top_k: usize) -> Vec<String>;

    /// Add user dictionary words. Extractors without a dictionary ignore this.
    fn load_dictionary(&self, _words: &[String]) {}

    /// Make `words` the whole user dictionary, dropping words not listed
    fn replace_dictionary(&self, words: &[String]) {
        self.load_dictionary(words);
    }
}

/// Frequency-ranked extractor with a user dictionary
pub struct FrequencyExtractor {
    dictionary: RwLock<HashSet<String>>,
    stopwords: HashSet<&'static str>,
}

impl Default for FrequencyExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyExtractor {
    pub fn new() -> Self {
        Self {
            dictionary: RwLock::new(HashSet::new()),
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    pub fn with_dictionary(words: &[String]) -> Self {
        let extractor = Self::new();
        extractor.load_dictionary(words);
        extractor
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let dictionary = self.dictionary.read();
        let mut tokens = Vec::new();
        let mut latin = String::new();
        let mut cjk: Vec<char> = Vec::new();

        for c in text.chars() {
            if is_cjk(c) {
                flush_latin(&mut latin, &mut tokens);
                cjk.push(c);
            } else if c.is_alphanumeric() {
                segment_cjk(&cjk, &dictionary, &mut tokens);
                cjk.clear();
                latin.extend(c.to_lowercase());
            } else {
                flush_latin(&mut latin, &mut tokens);
                segment_cjk(&cjk, &dictionary, &mut tokens);
                cjk.clear();
            }
        }
        flush_latin(&mut latin, &mut tokens);
        segment_cjk(&cjk, &dictionary, &mut tokens);

        tokens
            .into_iter()
            .filter(|t| !self.stopwords.contains(t.as_str()))
            .filter(|t| t.chars().count() > 1 || t.chars().any(is_cjk))
            .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
            .collect()
    }
}

impl KeywordExtractor for FrequencyExtractor {
    fn extract(&self, text: &str, top_k: usize) -> Vec<String> {
        let tokens = self.tokenize(text);

        // token -> (frequency, first position)
        let mut stats: HashMap<&str, (usize, usize)> = HashMap::new();
        for (pos, token) in tokens.iter().enumerate() {
            stats
                .entry(token.as_str())
                .and_modify(|(freq, _)| *freq += 1)
                .or_insert((1, pos));
        }

        let mut ranked: Vec<(&str, usize, usize)> = stats
            .into_iter()
            .map(|(token, (freq, first))| (token, freq, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        ranked
            .into_iter()
            .take(top_k)
            .map(|(token, _, _)| token.to_string())
            .collect()
    }

    fn load_dictionary(&self, words: &[String]) {
        let mut dictionary = self.dictionary.write();
        let before = dictionary.len();
        dictionary.extend(
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty()),
        );
        debug!("Dictionary loaded: {} new words", dictionary.len() - before);
    }

    fn replace_dictionary(&self, words: &[String]) {
        self.dictionary.write().clear();
        self.load_dictionary(words);
    }
}

fn flush_latin(latin: &mut String, tokens: &mut Vec<String>) {
    if !latin.is_empty() {
        tokens.push(std::mem::take(latin));
    }
}

/// Longest dictionary match first, otherwise an overlapping bigram
fn segment_cjk(run: &[char], dictionary: &HashSet<String>, tokens: &mut Vec<String>) {
    let mut i = 0;
    while i < run.len() {
        let longest = (2..=MAX_DICT_WORD_CHARS.min(run.len() - i))
            .rev()
            .map(|len| run[i..i + len].iter().collect::<String>())
            .find(|word| dictionary.contains(word));

        match longest {
            Some(word) => {
                i += word.chars().count();
                tokens.push(word);
            }
            None => {
                if i + 1 < run.len() {
                    tokens.push(run[i..i + 2].iter().collect());
                } else if run.len() == 1 && dictionary.contains(&run[0].to_string()) {
                    tokens.push(run[0].to_string());
                }
                i += 1;
            }
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// Keyword list of a message.
///
/// Empty when the message carries rich content and has no plain text at all.
pub fn keyword_list(
    extractor: &dyn KeywordExtractor,
    is_plain_text: bool,
    plain_text: &str,
    top_k: usize,
) -> Vec<String> {
    if !is_plain_text && plain_text.is_empty() {
        return Vec::new();
    }
    extractor.extract(plain_text, top_k)
}

/// Canonical signature of a message.
///
/// The processed text itself when fewer than two keywords came out (or the
/// message is rich content without plain text), otherwise the keywords
/// joined by [`SIGNATURE_SEPARATOR`].
pub fn signature(
    processed_text: &str,
    keywords: &[String],
    is_plain_text: bool,
    plain_text: &str,
) -> String {
    if (!is_plain_text && plain_text.is_empty()) || keywords.len() < 2 {
        return processed_text.to_string();
    }
    keywords.join(SIGNATURE_SEPARATOR)
}
