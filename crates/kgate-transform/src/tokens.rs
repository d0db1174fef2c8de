//! Token estimation used when the upstream omits output token counts.

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{F900}'..='\u{FAFF}')
}

/// Rough token count: CJK-heavy words weigh per character, latin words per
/// length bucket, whitespace half a token each. Never zero for non-empty
/// input.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut total = 0.0f64;
    let mut whitespace = 0usize;

    for word in text.split_whitespace() {
        let cjk = word.chars().filter(|c| is_cjk(*c)).count();
        if cjk > 0 {
            let other = word.chars().count() - cjk;
            total += cjk as f64 * 1.2 + other as f64 * 0.5;
        } else {
            let len = word.chars().count();
            total += if len <= 4 {
                1.0
            } else {
                (len as f64 / 3.5).ceil()
            };
        }
    }
    for c in text.chars() {
        if c.is_whitespace() {
            whitespace += 1;
        }
    }
    total += whitespace as f64 * 0.5;

    (total.round() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn tiny_input_is_at_least_one() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens(" "), 1);
    }

    #[test]
    fn short_words_count_one() {
        // Two short words plus one separating space.
        assert_eq!(estimate_tokens("hi you"), 3);
    }

    #[test]
    fn long_words_scale_by_length() {
        // ceil(10 / 3.5) == 3
        assert_eq!(estimate_tokens("encyclopae"), 3);
    }

    #[test]
    fn cjk_weighs_per_char() {
        // 4 CJK chars * 1.2 = 4.8 -> 5
        assert_eq!(estimate_tokens("你好世界"), 5);
    }

    #[test]
    fn mixed_cjk_segment() {
        // 2 CJK * 1.2 + 2 ascii * 0.5 = 3.4 -> 3
        assert_eq!(estimate_tokens("你好ab"), 3);
    }
}
