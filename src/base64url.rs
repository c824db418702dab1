//! URL-safe, no-padding base64 used to embed a binary DNS message into an
//! RFC 8484 GET request's query parameter.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_without_padding_or_reserved_chars() {
        let out = encode(b"\x00\x01\x02\x03dns query bytes");
        assert!(!out.contains('='));
        assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn empty_input() {
        assert_eq!(encode(b""), "");
    }
}
