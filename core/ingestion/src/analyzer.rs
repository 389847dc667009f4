use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use memory_graph_schemas::{ContentAnalysis, Memory};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Produces topics, keywords, entities and sentiment for a memory.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, memory: &Memory) -> Result<ContentAnalysis>;
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "this", "that", "these", "those", "it",
    "its", "they", "their", "have", "has", "had", "will", "would", "should", "could", "about",
    "into", "than", "then", "there", "what", "when", "which", "while", "your", "just", "also",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "love", "like", "happy", "fast", "clean", "works", "working",
    "success", "successful", "improved", "easy", "nice", "fixed", "solved", "glad", "awesome",
    "reliable",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "hate", "slow", "broken", "bug", "fail", "failed", "failure", "error",
    "crash", "crashed", "hard", "ugly", "sad", "angry", "problem", "issue", "blocked", "flaky",
];

const NEGATIONS: &[&str] = &["not", "never", "no", "don't", "doesn't", "isn't", "wasn't"];

/// Stop words per language, used to guess the language of short texts.
const LANGUAGE_MARKERS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "of", "to", "with", "that", "for"]),
    ("es", &["el", "la", "los", "las", "y", "es", "de", "que", "con", "para"]),
    ("fr", &["le", "la", "les", "et", "est", "des", "que", "avec", "pour", "une"]),
    ("de", &["der", "die", "das", "und", "ist", "mit", "nicht", "für", "ein", "eine"]),
];

/// Common sentence starters that are capitalised but are not entities.
const COMMON_CAPITALISED: &[&str] = &[
    "The", "This", "That", "These", "Those", "And", "But", "For", "With", "When", "What",
    "Then", "There", "After", "Before", "Today", "Yesterday", "Tomorrow",
];

/// Rule-based analyzer: stop-word keywords, lexicon sentiment, marker-word
/// language guess.
pub struct HeuristicAnalyzer {
    word_pattern: Regex,
    identifier_pattern: Regex,
    max_keywords: usize,
    max_topics: usize,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self {
            word_pattern: Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}_'\-]*").unwrap(),
            // Code identifiers in backticks
            identifier_pattern: Regex::new(r"`([a-zA-Z0-9_:.<>]+(?:\([^)]*\))?)`").unwrap(),
            max_keywords: 10,
            max_topics: 3,
        }
    }

    fn tokens(&self, text: &str) -> Vec<String> {
        self.word_pattern
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    pub fn extract_keywords(&self, text: &str) -> Vec<String> {
        let stop: HashSet<&str> = STOP_WORDS.iter().copied().collect();
        let mut word_freq: HashMap<String, usize> = HashMap::new();

        for token in self.tokens(text) {
            if token.chars().count() > 3 && !stop.contains(token.as_str()) {
                *word_freq.entry(token).or_insert(0) += 1;
            }
        }

        let mut keywords: Vec<(String, usize)> = word_freq.into_iter().collect();
        keywords.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        keywords
            .into_iter()
            .take(self.max_keywords)
            .map(|(word, _)| word)
            .collect()
    }

    pub fn extract_entities(&self, text: &str) -> Vec<String> {
        let mut entities = Vec::new();

        // Capitalised words (potential names)
        for word in text.split_whitespace() {
            let clean = word.trim_matches(|c: char| !c.is_alphanumeric());
            let starts_upper = clean.chars().next().is_some_and(char::is_uppercase);
            if clean.len() > 2 && starts_upper && !COMMON_CAPITALISED.contains(&clean) {
                entities.push(clean.to_string());
            }
        }

        for caps in self.identifier_pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                entities.push(m.as_str().to_string());
            }
        }

        entities.sort();
        entities.dedup();
        entities
    }

    /// Lexicon score in [-1, 1]; a preceding negation flips a word's polarity.
    pub fn score_sentiment(&self, text: &str) -> f32 {
        let tokens = self.tokens(text);
        let mut positive = 0i32;
        let mut negative = 0i32;

        for (idx, token) in tokens.iter().enumerate() {
            let polarity = if POSITIVE_WORDS.contains(&token.as_str()) {
                1
            } else if NEGATIVE_WORDS.contains(&token.as_str()) {
                -1
            } else {
                continue;
            };
            let negated = idx > 0 && NEGATIONS.contains(&tokens[idx - 1].as_str());
            match (polarity, negated) {
                (1, false) | (-1, true) => positive += 1,
                _ => negative += 1,
            }
        }

        let total = positive + negative;
        if total == 0 {
            return 0.0;
        }
        ((positive - negative) as f32 / total as f32).clamp(-1.0, 1.0)
    }

    pub fn detect_language(&self, text: &str) -> String {
        let tokens = self.tokens(text);
        let mut best: Option<(&str, usize)> = None;

        for (language, markers) in LANGUAGE_MARKERS {
            let hits = tokens.iter().filter(|t| markers.contains(&t.as_str())).count();
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((*language, hits));
            }
        }

        best.map(|(language, _)| language.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn infer_topics(&self, memory: &Memory, keywords: &[String]) -> Vec<String> {
        let mut topics = Vec::new();
        if let Some(topic) = memory.topic.as_deref().map(str::trim) {
            if !topic.is_empty() {
                topics.push(topic.to_lowercase());
            }
        }
        for keyword in keywords {
            if topics.len() >= self.max_topics {
                break;
            }
            if !topics.contains(keyword) {
                topics.push(keyword.clone());
            }
        }
        topics
    }
}

#[async_trait]
impl ContentAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, memory: &Memory) -> Result<ContentAnalysis> {
        let content = &memory.content;
        let keywords = self.extract_keywords(content);
        let topics = self.infer_topics(memory, &keywords);

        let analysis = ContentAnalysis {
            memory_id: memory.id.clone(),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            topics,
            entities: self.extract_entities(content),
            sentiment: self.score_sentiment(content),
            language: self.detect_language(content),
            keywords,
            analyzed_at: Utc::now(),
        };

        debug!(
            "Analyzed memory {}: {} words, language {}, {} keywords",
            memory.id,
            analysis.word_count,
            analysis.language,
            analysis.keywords.len()
        );

        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_graph_schemas::UserId;

    #[test]
    fn test_keyword_extraction_skips_stop_words() {
        let analyzer = HeuristicAnalyzer::new();
        let keywords =
            analyzer.extract_keywords("The tokio runtime drives the tokio scheduler and the reactor");
        assert_eq!(keywords[0], "tokio");
        assert!(keywords.contains(&"runtime".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"and".to_string()));
    }

    #[test]
    fn test_entity_extraction() {
        let analyzer = HeuristicAnalyzer::new();
        let entities =
            analyzer.extract_entities("The team met Alice in Berlin to review `spawn_blocking` usage.");
        assert!(entities.contains(&"Alice".to_string()));
        assert!(entities.contains(&"Berlin".to_string()));
        assert!(entities.contains(&"spawn_blocking".to_string()));
        assert!(!entities.contains(&"The".to_string()));
    }

    #[test]
    fn test_sentiment_bounds_and_negation() {
        let analyzer = HeuristicAnalyzer::new();
        assert_eq!(analyzer.score_sentiment("great fix, works and fast"), 1.0);
        assert_eq!(analyzer.score_sentiment("the build is broken and slow"), -1.0);
        assert_eq!(analyzer.score_sentiment("it is not broken"), 1.0);
        assert_eq!(analyzer.score_sentiment("neutral statement about lunch"), 0.0);
    }

    #[test]
    fn test_language_detection() {
        let analyzer = HeuristicAnalyzer::new();
        assert_eq!(analyzer.detect_language("the cat is on the mat with a hat"), "en");
        assert_eq!(analyzer.detect_language("el perro y la casa de los vecinos"), "es");
        assert_eq!(analyzer.detect_language("der Hund und die Katze ist nicht hier"), "de");
        assert_eq!(analyzer.detect_language("12345 67890"), "unknown");
    }

    #[tokio::test]
    async fn test_analyze_memory() {
        let analyzer = HeuristicAnalyzer::new();
        let mut memory = Memory::new(
            UserId("u1".into()),
            "Migrated the ingestion worker to tokio channels. Ingestion latency improved.",
        );
        memory.topic = Some("Rust".into());

        let analysis = analyzer.analyze(&memory).await.unwrap();
        assert_eq!(analysis.memory_id, memory.id);
        assert_eq!(analysis.word_count, 10);
        assert_eq!(analysis.language, "en");
        assert_eq!(analysis.topics[0], "rust");
        assert!(analysis.topics.contains(&"ingestion".to_string()));
        assert!(analysis.sentiment > 0.0);
    }
}
