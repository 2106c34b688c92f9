//! Repetition-loop detection for generated text.
//!
//! Vision-language models occasionally fall into degenerate loops, emitting
//! the same sentence, syllable or character until the token budget runs out.
//! [`RepetitionDetector`] flags such output with three strategies, tried in
//! order (first hit wins):
//!
//! 1. repeated word n-grams (3..=50 words),
//! 2. repeated short character patterns (2..=19 chars), including
//!    single-character runs long enough to repeat such a pattern,
//! 3. long single-character runs.
//!
//! All lengths are measured in Unicode scalar values, so CJK and other
//! multi-byte scripts are treated the same as ASCII.

use serde::{Deserialize, Serialize};

/// Default minimum length of a repeated unit, in characters.
pub const DEFAULT_MIN_LENGTH: usize = 10;

/// Default number of consecutive repeats that counts as a loop.
pub const DEFAULT_THRESHOLD: usize = 3;

/// Smallest word n-gram considered.
const MIN_NGRAM_WORDS: usize = 3;

/// Largest word n-gram considered.
const MAX_NGRAM_WORDS: usize = 50;

/// Word n-gram scanning only runs on texts with at least this many words.
const MIN_WORDS_FOR_NGRAMS: usize = 5;

/// Character pattern lengths scanned by the second strategy.
const CHAR_PATTERN_LENGTHS: std::ops::Range<usize> = 2..20;

/// A single non-whitespace character repeated this many times is a loop.
const CHAR_RUN_LIMIT: usize = 30;

/// Outcome of a repetition check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub is_repetitive: bool,
    /// The repeated unit, when one was found.
    pub pattern: Option<String>,
    /// Number of consecutive occurrences of `pattern`.
    pub count: usize,
}

impl Detection {
    /// A detection reporting clean text.
    pub fn clean() -> Self {
        Self {
            is_repetitive: false,
            pattern: None,
            count: 0,
        }
    }

    fn hit(pattern: String, count: usize) -> Self {
        Self {
            is_repetitive: true,
            pattern: Some(pattern),
            count,
        }
    }
}

/// Anything that can judge whether generated text is degenerate.
///
/// The retry engine depends on this trait rather than on the concrete
/// detector so callers can substitute their own policy.
pub trait RepetitionCheck: Send + Sync {
    fn check(&self, text: &str) -> Detection;
}

/// Detects repetition loops in generated text.
#[derive(Debug, Clone, Copy)]
pub struct RepetitionDetector {
    min_length: usize,
    threshold: usize,
}

impl Default for RepetitionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LENGTH, DEFAULT_THRESHOLD)
    }
}

impl RepetitionDetector {
    /// Creates a detector. A threshold of zero is treated as one.
    pub fn new(min_length: usize, threshold: usize) -> Self {
        Self {
            min_length,
            threshold: threshold.max(1),
        }
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Runs all strategies against `text`.
    pub fn detect(&self, text: &str) -> Detection {
        if text.is_empty() {
            return Detection::clean();
        }

        let chars: Vec<char> = text.chars().collect();
        if chars.len() < self.min_length.saturating_mul(self.threshold) {
            return Detection::clean();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() >= MIN_WORDS_FOR_NGRAMS {
            if let Some(detection) = self.find_repeated_ngram(&words) {
                return detection;
            }
        }

        if let Some(detection) = self.find_repeated_char_pattern(&chars) {
            return detection;
        }

        if chars.len() >= CHAR_RUN_LIMIT {
            if let Some(detection) = find_char_run(&chars) {
                return detection;
            }
        }

        Detection::clean()
    }

    /// Strategy 1: a phrase of `n` words repeated back to back.
    fn find_repeated_ngram(&self, words: &[&str]) -> Option<Detection> {
        let word_lens: Vec<usize> = words.iter().map(|w| w.chars().count()).collect();
        let max_n = MAX_NGRAM_WORDS.min(words.len() / self.threshold);

        for n in MIN_NGRAM_WORDS..=max_n {
            let span = n * self.threshold;
            for start in 0..=words.len() - span {
                // joined with single spaces
                let phrase_len = word_lens[start..start + n].iter().sum::<usize>() + n - 1;
                if phrase_len < self.min_length {
                    continue;
                }

                let unit = &words[start..start + n];
                let count = count_consecutive(words, start, n, |candidate| candidate == unit);
                if count >= self.threshold {
                    return Some(Detection::hit(unit.join(" "), count));
                }
            }
        }
        None
    }

    /// Strategy 2: a short character pattern repeated back to back.
    ///
    /// A pattern made of one repeated character is reported as that
    /// character with the length of its whole run, the same shape strategy 3
    /// uses. Whitespace runs are never reported.
    fn find_repeated_char_pattern(&self, chars: &[char]) -> Option<Detection> {
        let required = self.threshold * 2;

        for len in CHAR_PATTERN_LENGTHS {
            let span = len * required;
            if span > chars.len() {
                break;
            }
            for start in 0..=chars.len() - span {
                let unit = &chars[start..start + len];
                let first = unit[0];
                if unit.iter().all(|c| *c == first) {
                    if first.is_whitespace() {
                        continue;
                    }
                    let run = chars[start..].iter().take_while(|c| **c == first).count();
                    if run >= span {
                        return Some(Detection::hit(first.to_string(), run));
                    }
                    continue;
                }

                let count = count_consecutive(chars, start, len, |candidate| candidate == unit);
                if count >= required {
                    return Some(Detection::hit(unit.iter().collect(), count));
                }
            }
        }
        None
    }
}

impl RepetitionCheck for RepetitionDetector {
    fn check(&self, text: &str) -> Detection {
        self.detect(text)
    }
}

/// Strategy 3: the first non-whitespace run of [`CHAR_RUN_LIMIT`] or more.
fn find_char_run(chars: &[char]) -> Option<Detection> {
    let mut start = 0;
    while start < chars.len() {
        let c = chars[start];
        let mut end = start + 1;
        while end < chars.len() && chars[end] == c {
            end += 1;
        }
        let run = end - start;
        if run >= CHAR_RUN_LIMIT && !c.is_whitespace() {
            return Some(Detection::hit(c.to_string(), run));
        }
        start = end;
    }
    None
}

/// Counts how many times the `len`-long unit at `start` repeats without gaps.
fn count_consecutive<T, F>(items: &[T], start: usize, len: usize, same: F) -> usize
where
    F: Fn(&[T]) -> bool,
{
    let mut count = 1;
    let mut next = start + len;
    while next + len <= items.len() && same(&items[next..next + len]) {
        count += 1;
        next += len;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(text: &str) -> Detection {
        RepetitionDetector::default().detect(text)
    }

    #[test]
    fn test_empty_text_is_clean() {
        assert_eq!(detect(""), Detection::clean());
    }

    #[test]
    fn test_short_text_is_never_repetitive() {
        // below min_length * threshold = 30 chars, even when obviously looping
        for text in ["aaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "ha ha ha ha ha", "ababababababab"] {
            assert!(text.chars().count() < 30);
            assert!(!detect(text).is_repetitive, "flagged {text:?}");
        }
    }

    #[test]
    fn test_repeated_sentence() {
        let text = "The image shows a cat. ".repeat(10);
        let detection = detect(&text);

        assert!(detection.is_repetitive);
        assert_eq!(detection.pattern.as_deref(), Some("The image shows a cat."));
        assert_eq!(detection.count, 10);
    }

    #[test]
    fn test_repeated_ellipsis_tokens() {
        let detection = detect(&"... ".repeat(20));
        assert!(detection.is_repetitive);
        assert!(detection.count >= 3);
    }

    #[test]
    fn test_alphabet_is_clean() {
        let alphabet: Vec<String> = ('A'..='Z').map(|c| c.to_string()).collect();
        assert!(!detect(&alphabet.join(" ")).is_repetitive);
    }

    #[test]
    fn test_sentence_twice_is_below_threshold() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(2);
        assert!(!detect(&text).is_repetitive);
    }

    #[test]
    fn test_single_character_run() {
        let detection = detect(&"x".repeat(100));
        assert!(detection.is_repetitive);
        assert_eq!(detection.pattern.as_deref(), Some("x"));
        assert_eq!(detection.count, 100);
    }

    #[test]
    fn test_short_punctuation_run_after_sentence() {
        let text = format!("The girl shouts loudly at the sky{}", "!".repeat(20));
        let detection = detect(&text);
        assert!(detection.is_repetitive);
        assert_eq!(detection.pattern.as_deref(), Some("!"));
        assert_eq!(detection.count, 20);
    }

    #[test]
    fn test_run_too_short_for_pattern_threshold() {
        // 11 chars cannot hold six copies of a two-char unit
        let text = format!("The girl shouts loudly at the sky{}", "!".repeat(11));
        assert!(!detect(&text).is_repetitive);
    }

    #[test]
    fn test_single_multibyte_character_run() {
        let detection = detect(&"パ".repeat(100));
        assert!(detection.is_repetitive);
        assert_eq!(detection.pattern.as_deref(), Some("パ"));
        assert_eq!(detection.count, 100);
    }

    #[test]
    fn test_short_pattern_loop() {
        // 3 words only, so n-gram scanning is skipped
        let text = format!("Result: {} end", "ab".repeat(20));
        let detection = detect(&text);
        assert!(detection.is_repetitive);
        assert!(detection.count >= 6);
        let pattern = detection.pattern.expect("pattern");
        assert!(pattern == "ab" || pattern == "ba", "unexpected pattern {pattern}");
    }

    #[test]
    fn test_cjk_syllable_loop() {
        let text = format!("{}です", "ありがとう".repeat(8));
        let detection = detect(&text);
        assert!(detection.is_repetitive);
        assert_eq!(detection.pattern.as_deref(), Some("ありがとう"));
        assert_eq!(detection.count, 8);
    }

    #[test]
    fn test_whitespace_runs_are_ignored() {
        let text = format!("A caption{}with a wide gap in the middle of it.", " ".repeat(60));
        assert!(!detect(&text).is_repetitive);
    }

    #[test]
    fn test_natural_caption_is_clean() {
        let caption = "A young woman with long silver hair stands on a rooftop at dusk, \
            wearing a navy school uniform with a red ribbon. The city skyline glows \
            behind her and a few pigeons sit on the railing to her left. Her expression \
            is calm, and the soft orange light gives the scene a nostalgic mood.";
        assert!(!detect(caption).is_repetitive);
    }

    #[test]
    fn test_loop_after_clean_prefix() {
        let text = format!(
            "The character is sitting at a desk. {}",
            "She is holding a pen and ".repeat(6)
        );
        let detection = detect(&text);
        assert!(detection.is_repetitive);
        assert!(detection.count >= 3);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let inputs = [
            "The image shows a cat. ".repeat(10),
            "パ".repeat(100),
            "plain text with nothing odd about it at all, truly".to_string(),
        ];
        for input in &inputs {
            assert_eq!(detect(input), detect(input));
        }
    }

    #[test]
    fn test_threshold_controls_sensitivity() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(2);
        let strict = RepetitionDetector::new(10, 2);
        let detection = strict.detect(&text);
        assert!(detection.is_repetitive);
        assert_eq!(detection.count, 2);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let detector = RepetitionDetector::new(10, 0);
        assert_eq!(detector.threshold(), 1);
        // must not panic on arbitrary input
        let _ = detector.detect("some text that is long enough to be scanned at all");
    }

    #[test]
    fn test_short_texts_below_bound_never_flag() {
        let detector = RepetitionDetector::new(5, 4);
        for len in 0..20 {
            let text = "z".repeat(len);
            assert!(!detector.detect(&text).is_repetitive, "len {len}");
        }
    }
}
