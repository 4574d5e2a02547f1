//! Punctuation normalization applied before length counting and to final
//! rendered subtitles.
//!
//! Rules:
//! 1. Drop any punctuation before the first non-punctuation character
//!    (including Spanish inverted `¿`/`¡`).
//! 2. Keep only `{. , ? ! 。 ， ？ ！}`; drop everything else that is
//!    punctuation (by Unicode punctuation class).
//! 3. Collapse runs of allowed punctuation to the first occurrence.

const ALLOWED: &[char] = &['.', ',', '?', '!', '。', '，', '？', '！'];

fn is_allowed(c: char) -> bool {
    ALLOWED.contains(&c)
}

/// True for characters this function treats as punctuation to strip,
/// including ASCII/CJK punctuation and the Spanish inverted marks.
fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '。' | '，' | '？' | '！' | '、' | '～' | '：' | '；' | '¿' | '¡'
        )
}

pub fn clean_punctuation(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();

    // Rule 1: find the first non-punctuation character; everything before
    // it (punctuation only) is dropped. Non-punctuation, non-whitespace
    // content starts the kept region; leading whitespace before it is also
    // preserved verbatim (tests keep interior/leading whitespace).
    let first_content = chars
        .iter()
        .position(|c| !is_punctuation(*c) && !c.is_whitespace());

    let Some(first_content) = first_content else {
        // Entirely punctuation/whitespace: nothing survives.
        return String::new();
    };

    // Rule 1 strips everything through the LAST punctuation character
    // found anywhere before the first real content, not just a contiguous
    // run touching it — whitespace interleaved with leading punctuation is
    // dropped along with it, but whitespace that follows the last leading
    // punctuation mark is preserved verbatim.
    let strip_from = (0..first_content)
        .rev()
        .find(|&i| is_punctuation(chars[i]))
        .map(|p| p + 1)
        .unwrap_or(0);

    let kept: Vec<char> = chars[strip_from..].to_vec();

    // Rules 2 + 3 over the kept slice.
    let mut out = String::with_capacity(kept.len());
    let mut last_was_allowed_punct = false;
    for c in kept {
        if is_punctuation(c) {
            if is_allowed(c) {
                if !last_was_allowed_punct {
                    out.push(c);
                }
                last_was_allowed_punct = true;
            }
            // disallowed punctuation: dropped entirely
        } else {
            out.push(c);
            last_was_allowed_punct = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_leading_punctuation() {
        assert_eq!(clean_punctuation("，你好，世界。"), "你好，世界。");
    }

    #[test]
    fn keeps_comma_and_bang() {
        assert_eq!(clean_punctuation("Hello, world!"), "Hello, world!");
    }

    #[test]
    fn collapses_runs_to_first() {
        assert_eq!(clean_punctuation("！！！测试！！！"), "测试！");
    }

    #[test]
    fn drops_disallowed_symbols() {
        assert_eq!(clean_punctuation("你好~世界@测试#"), "你好世界测试");
    }

    #[test]
    fn all_punctuation_collapses_to_empty() {
        assert_eq!(clean_punctuation("...,..."), "");
    }

    #[test]
    fn no_punctuation_is_unchanged() {
        assert_eq!(clean_punctuation("test"), "test");
    }

    #[test]
    fn drops_spanish_inverted_marks_at_start() {
        assert_eq!(
            clean_punctuation("¿No es tarde para volver a comprometerse?"),
            "No es tarde para volver a comprometerse?"
        );
        assert_eq!(
            clean_punctuation("¡Hola! ¿Cómo estás?"),
            "Hola! Cómo estás?"
        );
    }

    #[test]
    fn drops_japanese_interpunct_but_keeps_period() {
        assert_eq!(clean_punctuation("こんにちは、世界。"), "こんにちは世界。");
    }
}
