/// Token estimate for accounting: CJK characters weigh 1/1.5 of a token,
/// everything else 1/4, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut cjk = 0u64;
    let mut other = 0u64;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 4.0).ceil() as u32
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{2E80}'..='\u{9FFF}'        // radicals, kana, CJK unified
        | '\u{AC00}'..='\u{D7A3}'      // hangul syllables
        | '\u{F900}'..='\u{FAFF}'      // compatibility ideographs
        | '\u{FF00}'..='\u{FFEF}'      // fullwidth forms
        | '\u{20000}'..='\u{2FA1F}'    // extension planes
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_counts_quarters() {
        // 8 chars / 4 = 2.
        assert_eq!(estimate_tokens("12345678"), 2);
        // 9 chars / 4 = 2.25 -> 3.
        assert_eq!(estimate_tokens("123456789"), 3);
    }

    #[test]
    fn cjk_counts_twothirds() {
        // 3 / 1.5 = 2.
        assert_eq!(estimate_tokens("你好吗"), 2);
    }

    #[test]
    fn mixed_text_sums_both() {
        // 2 cjk / 1.5 + 4 ascii / 4 = 1.33 + 1 = 2.33 -> 3.
        assert_eq!(estimate_tokens("你好abcd"), 3);
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }
}
