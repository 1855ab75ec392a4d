use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// Share of the threshold below which the cheap estimate is trusted.
const ESTIMATE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMethod {
    Estimated,
    Precise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub method: CountMethod,
    pub tokens: u64,
}

/// Fast character-based estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as u64).div_ceil(4)
}

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// Exact token count. The encoder is initialized lazily and reused across
/// calls; if it cannot be built the estimate is returned instead.
pub fn count_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => estimate_tokens(text),
    }
}

/// Cheap estimate while it is safely below the threshold, exact count once
/// the estimate comes within 80% of it.
pub fn smart_count(text: &str, threshold: u64) -> TokenCount {
    let estimate = estimate_tokens(text);
    if (estimate as f64) < ESTIMATE_CONFIDENCE * threshold as f64 {
        TokenCount {
            method: CountMethod::Estimated,
            tokens: estimate,
        }
    } else {
        TokenCount {
            method: CountMethod::Precise,
            tokens: count_tokens(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_estimates_zero() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[test]
    fn smart_count_uses_estimate_below_threshold() {
        // 40 chars → estimate 10, threshold 100 → 10 < 80
        let text = "x".repeat(40);
        let count = smart_count(&text, 100);
        assert_eq!(count.method, CountMethod::Estimated);
        assert_eq!(count.tokens, 10);
    }

    #[test]
    fn smart_count_switches_to_precise_near_threshold() {
        // 400 chars → estimate 100, threshold 100 → 100 >= 80
        let text = "hello world ".repeat(34);
        let count = smart_count(&text, 100);
        assert_eq!(count.method, CountMethod::Precise);
        assert!(count.tokens > 0);
    }

    #[test]
    fn smart_count_empty_is_estimated_zero() {
        let count = smart_count("", 100);
        assert_eq!(count.method, CountMethod::Estimated);
        assert_eq!(count.tokens, 0);
    }

    #[test]
    fn precise_count_is_stable_across_calls() {
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(count_tokens(text), count_tokens(text));
    }
}
