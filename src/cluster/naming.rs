use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

pub const NOISE_NAME: &str = "unclustered";
pub const EMPTY_NAME: &str = "misc";

/// Common chat words excluded from cluster names.
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "must", "can", "this", "that",
    "these", "those", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us",
    "them", "my", "your", "his", "its", "our", "their", "what", "which", "who", "when", "where",
    "why", "how", "all", "each", "every", "both", "few", "more", "most", "other", "some", "such",
    "no", "nor", "not", "only", "own", "same", "so", "than", "too", "very", "just", "also",
    "now", "here", "there", "then", "if", "because", "while", "although", "though", "after",
    "before", "since", "until", "unless", "about", "into", "through", "during", "above",
    "below", "between", "under", "again", "further", "once", "dont", "don't", "like", "get",
    "got", "going", "know", "think", "want", "need", "make", "made", "way", "thing", "things",
    "yeah", "yes", "okay", "ok", "oh", "well", "really", "actually", "pretty", "much", "even",
    "still", "back", "out", "up", "down", "over", "any", "being", "something", "anything",
    "nothing", "everything", "someone", "anyone", "everyone", "one", "two", "first", "time",
    "good", "new", "used", "man", "work", "look", "see", "come", "say", "said", "people",
    "take", "give", "find", "long", "little", "big", "great", "old", "right", "high", "small",
    "different", "large", "next", "early", "young", "important", "public", "bad", "able", "im",
    "i'm",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[a-zA-Z]{3,}\b").expect("static regex"))
}

/// Lowercase alphabetic runs of at least three letters.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_pattern()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct NamingConfig {
    pub top_words: usize,
    pub stopwords: HashSet<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            top_words: 3,
            stopwords: STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl NamingConfig {
    /// Top tokens of `texts` joined by spaces, or [`EMPTY_NAME`] when nothing
    /// survives the stopword filter. Ties keep first-seen order.
    pub fn name_cluster<'a, I>(&self, texts: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: Vec<(String, usize)> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();

        for text in texts {
            for token in tokenize(text) {
                if self.stopwords.contains(&token) {
                    continue;
                }
                match slots.get(&token) {
                    Some(&slot) => counts[slot].1 += 1,
                    None => {
                        slots.insert(token.clone(), counts.len());
                        counts.push((token, 1));
                    }
                }
            }
        }

        // Stable sort keeps first-seen order among equal counts
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let top: Vec<&str> = counts
            .iter()
            .take(self.top_words)
            .map(|(word, _)| word.as_str())
            .collect();

        if top.is_empty() {
            return EMPTY_NAME.to_string();
        }
        top.join(" ")
    }
}
