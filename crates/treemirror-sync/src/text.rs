//! Text detection for the buffered upload fallback

/// Number of leading bytes inspected for NUL bytes
const SNIFF_LEN: usize = 8 * 1024;

/// Returns true if `bytes` looks like text
///
/// Text means no NUL byte in the first 8 KiB and valid UTF-8 overall.
/// Binary files never take the buffered text path.
pub fn is_text_like(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    if head.contains(&0) {
        return false;
    }
    std::str::from_utf8(bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        assert!(is_text_like(b"hello\nworld\n"));
        assert!(is_text_like("grüße, 世界".as_bytes()));
        assert!(is_text_like(b""));
    }

    #[test]
    fn test_nul_byte_is_binary() {
        assert!(!is_text_like(b"abc\0def"));
    }

    #[test]
    fn test_invalid_utf8_is_binary() {
        assert!(!is_text_like(&[0xff, 0xfe, 0x41]));
    }

    #[test]
    fn test_nul_after_sniff_window_still_fails_utf8_check() {
        let mut bytes = vec![b'a'; SNIFF_LEN + 10];
        bytes.push(0xff);
        assert!(!is_text_like(&bytes));
    }
}
