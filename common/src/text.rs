use unicode_normalization::UnicodeNormalization;

pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut result = String::new();
    for c in text.chars().take(max_len.saturating_sub(3)) {
        result.push(c);
    }
    result.push_str("...");
    result
}

/// 去掉首尾空白并转为 NFC，保证同一表情的不同编码比较相等
pub fn normalize_emoji(raw: &str) -> String {
    raw.trim().nfc().collect()
}
