//! Keyword extraction and matching.
//!
//! A job's prompt is reduced to a small ordered set of search terms, which
//! are compiled once into a single case-insensitive, word-boundary-anchored
//! alternation.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use smallvec::SmallVec;
use std::collections::HashSet;
use tracing::warn;

/// Words and hashtags shorter than this are dropped.
pub const MIN_KEYWORD_LENGTH: usize = 3;

/// Upper bound on the number of keywords kept per job.
pub const MAX_KEYWORDS: usize = 10;

/// Extracted keywords, hashtags first.
pub type Keywords = SmallVec<[String; MAX_KEYWORDS]>;

lazy_static! {
    /// English function words plus the phrasing people use when asking
    /// for sentiment ("what do people think about ...").
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her",
        "was", "one", "our", "out", "has", "him", "his", "how", "its", "may", "new", "now",
        "old", "see", "two", "way", "who", "did", "get", "got", "let", "say", "she", "too",
        "use", "yes", "yet", "off", "own", "why", "also", "been", "from", "have", "here",
        "into", "just", "like", "more", "most", "much", "must", "only", "over", "same",
        "some", "such", "than", "that", "them", "then", "there", "these", "they", "this",
        "those", "very", "were", "what", "when", "where", "which", "while", "will", "with",
        "would", "your", "about", "after", "again", "being", "could", "does", "doing",
        "down", "each", "few", "further", "itself", "myself", "ours", "should", "their",
        "theirs", "through", "under", "until", "ourselves", "yourself", "between", "before",
        "during", "above", "below", "because", "against", "people", "think", "thinks",
        "feel", "feels", "opinion", "opinions", "sentiment", "analyze", "analyse",
        "analysis", "tell", "show", "find", "posts", "post", "saying", "talk", "talking",
        "regarding", "toward", "towards", "lately", "today", "right", "going",
    ]
    .into_iter()
    .collect();
}

fn is_hashtag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_word_separator(c: char) -> bool {
    c.is_whitespace() || c.is_ascii_punctuation()
}

/// Split `prompt` into hashtag words (without `#`) and the remaining text.
fn split_hashtags(prompt: &str) -> (Vec<String>, String) {
    let mut hashtags = Vec::new();
    let mut remainder = String::with_capacity(prompt.len());
    let mut chars = prompt.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != '#' {
            remainder.push(c);
            continue;
        }
        let start = idx + c.len_utf8();
        let mut end = start;
        while let Some(&(i, next)) = chars.peek() {
            if !is_hashtag_char(next) {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }
        if end > start {
            hashtags.push(prompt[start..end].to_lowercase());
        }
        remainder.push(' ');
    }

    (hashtags, remainder)
}

/// Extract search keywords from a free-text prompt.
///
/// Hashtags come first in order of first appearance, followed by the
/// remaining words that survive filtering. The result is deduplicated,
/// lower-cased and capped at [`MAX_KEYWORDS`].
pub fn extract_keywords(prompt: &str) -> Keywords {
    let (hashtags, remainder) = split_hashtags(prompt);
    let hashtags: Vec<String> = hashtags
        .into_iter()
        .filter(|tag| tag.len() >= MIN_KEYWORD_LENGTH)
        .filter(|tag| !STOP_WORDS.contains(tag.as_str()))
        .unique()
        .collect();

    let words = remainder
        .split(is_word_separator)
        .filter(|token| token.len() >= MIN_KEYWORD_LENGTH)
        .filter(|token| token.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| !STOP_WORDS.contains(token.as_str()))
        .filter(|token| !hashtags.contains(token))
        .unique();

    hashtags
        .iter()
        .cloned()
        .chain(words)
        .take(MAX_KEYWORDS)
        .collect()
}

/// Compiled keyword pattern of a job.
///
/// Matches a keyword only as a whole word: `coin` matches `"coin is money"`
/// and `"my-coin"` but not `"bitcoin"` or `"altcoin"`. Word boundaries are
/// ASCII, like the keywords themselves, so any non-ASCII character ends a
/// word: `coin` matches in `"écoin"`.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    regex: Option<Regex>,
}

impl KeywordMatcher {
    /// A matcher that matches nothing.
    pub fn never() -> Self {
        Self { regex: None }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// The compiled pattern, `None` for a matcher that matches nothing.
    pub fn pattern(&self) -> Option<&str> {
        self.regex.as_ref().map(Regex::as_str)
    }
}

/// Compile `keywords` into a [`KeywordMatcher`].
///
/// An empty keyword list yields a matcher that never matches. Keywords are
/// escaped, so regex metacharacters in prompts are matched literally.
pub fn build_keyword_matcher<S: AsRef<str>>(keywords: &[S]) -> KeywordMatcher {
    if keywords.is_empty() {
        return KeywordMatcher::never();
    }

    let alternation = keywords
        .iter()
        .map(|keyword| regex::escape(keyword.as_ref()))
        .join("|");
    let pattern = format!(r"(?-u:\b)(?:{alternation})(?-u:\b)");

    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(regex) => KeywordMatcher { regex: Some(regex) },
        Err(e) => {
            warn!(%pattern, error = %e, "Failed to compile keyword pattern, job will match nothing");
            KeywordMatcher::never()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_basic_words() {
        let keywords = extract_keywords("bitcoin cryptocurrency");
        assert_eq!(keywords.as_slice(), ["bitcoin", "cryptocurrency"]);
    }

    #[test]
    fn test_extract_hashtags_first() {
        let keywords = extract_keywords("What do people think about Ethereum #Crypto and #web3?");
        assert_eq!(keywords.as_slice(), ["crypto", "web3", "ethereum"]);
    }

    #[test]
    fn test_extract_drops_short_stop_and_duplicate_tokens() {
        let keywords = extract_keywords("AI is the future of AI, the FUTURE is now; crypto #crypto");
        assert_eq!(keywords.as_slice(), ["crypto", "future"]);
    }

    #[test]
    fn test_extract_filters_hashtags_like_words() {
        let keywords = extract_keywords("#the #a bitcoin");
        assert_eq!(keywords.as_slice(), ["bitcoin"]);

        let keywords = extract_keywords("#AI #btc #People #eth");
        assert_eq!(keywords.as_slice(), ["btc", "eth"]);
    }

    #[test]
    fn test_extract_drops_non_ascii_tokens() {
        let keywords = extract_keywords("café culture naïve 🚀rocket");
        assert_eq!(keywords.as_slice(), ["culture"]);
    }

    #[test]
    fn test_extract_caps_keyword_count() {
        let prompt = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima";
        let keywords = extract_keywords(prompt);
        assert_eq!(keywords.len(), MAX_KEYWORDS);
        assert_eq!(keywords[0], "alpha");
        assert_eq!(keywords[MAX_KEYWORDS - 1], "juliet");
    }

    #[test]
    fn test_extract_properties_hold_for_assorted_prompts() {
        let prompts = [
            "",
            "#",
            "## #a #b_c what about the #Moon?",
            "How do people feel about Tesla, tesla and TSLA stock today?",
            "one two three four five six seven eight nine ten eleven twelve #x #y",
            "ok so uh... bitcoin-ETF approval!!!",
            "#the #a #is bitcoin",
        ];
        for prompt in prompts {
            let keywords = extract_keywords(prompt);
            assert!(keywords.len() <= MAX_KEYWORDS, "{prompt}");
            let unique: HashSet<&String> = keywords.iter().collect();
            assert_eq!(unique.len(), keywords.len(), "duplicates for {prompt}");
            for keyword in &keywords {
                assert!(!STOP_WORDS.contains(keyword.as_str()), "{keyword} in {prompt}");
                assert!(keyword.len() >= MIN_KEYWORD_LENGTH, "{keyword} in {prompt}");
            }
            assert_eq!(extract_keywords(prompt), keywords, "not deterministic");
        }
        assert_eq!(
            extract_keywords("## #a #b_c what about the #Moon?").as_slice(),
            ["b_c", "moon"]
        );
        assert_eq!(
            extract_keywords("ok so uh... bitcoin-ETF approval!!!").as_slice(),
            ["bitcoin", "etf", "approval"]
        );
    }

    #[test]
    fn test_matcher_is_word_boundary_exact() {
        let matcher = build_keyword_matcher(&["coin"]);
        assert!(matcher.is_match("coin is money"));
        assert!(matcher.is_match("COIN is money"));
        assert!(!matcher.is_match("bitcoin"));
        assert!(!matcher.is_match("altcoin season"));
        assert!(!matcher.is_match("coinbase"));

        let matcher = build_keyword_matcher(&["bitcoin"]);
        assert!(matcher.is_match("my-bitcoin-wallet"));
        assert!(matcher.is_match("#Bitcoin"));
        assert!(matcher.is_match("I just bought BITCOIN!"));
    }

    #[test]
    fn test_matcher_boundaries_are_ascii() {
        let matcher = build_keyword_matcher(&["coin"]);
        assert!(matcher.is_match("écoin"));
        assert!(matcher.is_match("coinñ"));
        assert!(matcher.is_match("Coin🚀"));
        assert!(!matcher.is_match("coin_base"));
    }

    #[test]
    fn test_matcher_escapes_metacharacters() {
        let matcher = build_keyword_matcher(&["a.b", "c+"]);
        assert!(matcher.is_match("see a.b here"));
        assert!(!matcher.is_match("see axb here"));
        assert_eq!(matcher.pattern(), Some(r"(?-u:\b)(?:a\.b|c\+)(?-u:\b)"));
    }

    #[test]
    fn test_empty_keywords_never_match() {
        let empty: [&str; 0] = [];
        let matcher = build_keyword_matcher(&empty);
        assert!(matcher.pattern().is_none());
        assert!(!matcher.is_match(""));
        assert!(!matcher.is_match("anything at all"));
    }
}
