//! Per-language length and script policy used by the translation retry
//! sub-protocol.
//!
//! Chinese counts Han characters, Korean counts Hangul syllable blocks,
//! Japanese counts kana+kanji code points, everything else counts
//! whitespace-delimited tokens.

use super::punctuation::clean_punctuation;

const DEFAULT_RATIO: f64 = 1.2;
const COMPACT_SCRIPT_RATIO: f64 = 2.5;

/// `ratio(target_language)`: `2.5` for Japanese/Korean, `1.2` otherwise.
pub fn length_ratio_limit(lang: &str) -> f64 {
    match lang {
        "ja" | "ko" => COMPACT_SCRIPT_RATIO,
        _ => DEFAULT_RATIO,
    }
}

fn is_han(c: char) -> bool {
    ('\u{4E00}'..='\u{9FFF}').contains(&c)
}

fn is_kana(c: char) -> bool {
    ('\u{3040}'..='\u{309F}').contains(&c) || ('\u{30A0}'..='\u{30FF}').contains(&c)
}

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// Count of code points that fall in the Han/CJK Unified Ideographs block.
/// Used for both Chinese unit counting and Japanese script enforcement.
pub fn han_character_count(text: &str) -> usize {
    text.chars().filter(|c| is_han(*c)).count()
}

/// Normalized length of `text` under `lang`'s counting rule, after stripping
/// punctuation (the allowed-set collapsing of [`clean_punctuation`]) and
/// whitespace.
pub fn normalized_length(lang: &str, text: &str) -> usize {
    let cleaned = clean_punctuation(text);

    match lang {
        "zh" | "zh-cn" | "zh-tw" => cleaned.chars().filter(|c| is_han(*c)).count(),
        "ko" => cleaned.chars().filter(|c| is_hangul_syllable(*c)).count(),
        "ja" => cleaned
            .chars()
            .filter(|c| is_han(*c) || is_kana(*c))
            .count(),
        _ => cleaned.split_whitespace().count(),
    }
}

/// Outcome of checking one translated cue against the length/script policy.
/// `Accepted` covers both "never flagged" and "flagged then exhausted
/// retries" — the retry bookkeeping (attempts, K=3) lives with the
/// translation retry sub-protocol, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted,
    FlaggedLong { ratio: f64, limit: f64 },
    FlaggedScript { reason: String },
}

/// Check a single cue's translation against `lang`'s length ratio and, for
/// Japanese, the kana-preferred script rule. Length is checked first: a cue
/// that is both too long and script-violating is reported as `FlaggedLong`
/// so the stricter-prompt retry addresses length before script.
///
/// `source_text` is always counted by the Han-character rule regardless of
/// `lang` — the source subtitle is always Chinese, so its length never
/// depends on which language it's being translated into.
pub fn validate(lang: &str, source_text: &str, target_text: &str) -> ValidationOutcome {
    let source_len = han_character_count(&clean_punctuation(source_text)).max(1);
    let target_len = normalized_length(lang, target_text);
    let ratio = target_len as f64 / source_len as f64;
    let limit = length_ratio_limit(lang);

    if ratio > limit {
        return ValidationOutcome::FlaggedLong { ratio, limit };
    }

    if lang == "ja" && han_character_count(target_text) > 0 {
        return ValidationOutcome::FlaggedScript {
            reason: "translation contains Han characters; kana-preferred output required"
                .to_string(),
        };
    }

    ValidationOutcome::Accepted
}
