//! Charset detection and conversion for the edit engine.
//!
//! Detection is deliberately simple: honor a BOM when present, otherwise
//! treat valid UTF-8 as UTF-8 and fall back to windows-1252 for arbitrary
//! byte soup. The edit engine upgrades a file to UTF-8 when its original
//! charset cannot represent new content.

use encoding_rs::Encoding;
use encoding_rs::UTF_8;
use encoding_rs::WINDOWS_1252;

/// Bytes examined when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8192;

pub fn detect(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        return encoding;
    }
    if std::str::from_utf8(bytes).is_ok() {
        UTF_8
    } else {
        WINDOWS_1252
    }
}

pub fn by_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.as_bytes())
}

pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Encode `text` with `encoding`, or `None` if the charset cannot represent
/// some character. The caller is expected to retry with UTF-8.
pub fn encode(text: &str, encoding: &'static Encoding) -> Option<Vec<u8>> {
    if encoding == UTF_8 {
        return Some(text.as_bytes().to_vec());
    }
    let (bytes, _, had_errors) = encoding.encode(text);
    if had_errors {
        None
    } else {
        Some(bytes.into_owned())
    }
}

/// A NUL byte in the leading window is taken as binary content.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .take(BINARY_SNIFF_LEN)
        .any(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_detects_without_bom() {
        assert_eq!(detect("héllo".as_bytes()), UTF_8);
    }

    #[test]
    fn invalid_utf8_falls_back_to_windows_1252() {
        let bytes = [0x68, 0xe9, 0x6c]; // "hél" in latin-1
        assert_eq!(detect(&bytes), WINDOWS_1252);
        assert_eq!(decode(&bytes, WINDOWS_1252), "hél");
    }

    #[test]
    fn windows_1252_cannot_encode_cjk() {
        assert!(encode("日本語", WINDOWS_1252).is_none());
        assert!(encode("plain ascii", WINDOWS_1252).is_some());
    }

    #[test]
    fn nul_byte_marks_binary() {
        assert!(looks_binary(b"ab\0cd"));
        assert!(!looks_binary(b"plain text\n"));
    }
}
