//! Render keys and values for logs and conflict prompts.
//!
//! Mostly-printable bytes (more than 80%) render as text and anything else renders as `0x` hex.

fn is_text(bytes: &[u8]) -> bool {
    let printable = bytes
        .iter()
        .filter(|b| matches!(**b, 32..=126 | b'\t' | b'\n' | b'\r'))
        .count();
    printable * 5 > bytes.len() * 4
}

/// Render a key, truncated to roughly `max` characters.
///
/// Long hex keys keep their head and tail (`0xabcd...ef01`).
pub fn format_key(key: &[u8], max: usize) -> String {
    if key.is_empty() {
        return "<empty>".into();
    }
    if is_text(key) {
        let text = String::from_utf8_lossy(key);
        if key.len() <= max {
            return text.into_owned();
        }
        return format!("{}...", String::from_utf8_lossy(&key[..max]));
    }

    let hex = hex::encode(key);
    if hex.len() <= max {
        return format!("0x{hex}");
    }
    let half = max.saturating_sub(8) / 2;
    if half == 0 {
        return format!("0x{}", &hex[..max.saturating_sub(2).min(hex.len())]);
    }
    format!("0x{}...{}", &hex[..half], &hex[hex.len() - half..])
}

/// Render a value, truncated to `max` characters with a note on what was cut.
pub fn format_value(value: &[u8], max: usize) -> String {
    if value.is_empty() {
        return "<empty>".into();
    }
    if is_text(value) {
        if value.len() <= max {
            return String::from_utf8_lossy(value).into_owned();
        }
        return format!(
            "{}... ({} more bytes)",
            String::from_utf8_lossy(&value[..max]),
            value.len() - max
        );
    }

    let hex = hex::encode(value);
    if hex.len() <= max {
        return format!("0x{hex}");
    }
    format!("0x{}... ({} total bytes)", &hex[..max], value.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_key_text() {
        assert_eq!(format_key(b"tx.height/123/123/0", 80), "tx.height/123/123/0");
        assert_eq!(format_key(b"H:123456", 4), "H:12...");
        assert_eq!(format_key(b"", 10), "<empty>");
    }

    #[test]
    fn test_format_key_binary() {
        assert_eq!(format_key(&[0x00, 0xff], 80), "0x00ff");
        let hash = [0xAB; 32];
        assert_eq!(format_key(&hash, 24), "0xabababab...abababab");
        assert_eq!(format_key(&hash, 6), "0xabab");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(b"hello", 10), "hello");
        assert_eq!(format_value(b"hello world", 5), "hello... (6 more bytes)");
        assert_eq!(format_value(&[0x01, 0x02], 10), "0x0102");
        assert_eq!(format_value(&[0x01; 10], 4), "0x0101... (10 total bytes)");
    }
}
