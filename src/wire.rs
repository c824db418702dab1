//! DNS wire format: qname label encoding/decoding, a minimal query builder,
//! and the handful of constants the rest of the crate needs (qtype values,
//! header layout). Compression-aware decoding matches RFC1035 section 4.1.4.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::Cursor;

use crate::error::{HardDnsError, HardDnsResult};

pub const DNS_MAX_LABEL: usize = 63;
pub const DNS_MAX_NAME: usize = 255;
pub const MAX_COMPRESS_DEPTH: u8 = 10;
pub const DNS_HEADER_LEN: usize = 12;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_PTR: u16 = 12;
pub const QTYPE_MX: u16 = 15;
pub const QTYPE_AAAA: u16 = 28;
pub const QCLASS_IN: u16 = 1;

/// "foo.bar" -> "\x03foo\x03bar\x00", splitting any dot-delimited piece over
/// 63 bytes into consecutive sub-labels (including a trailing piece with no
/// dot after it), the way a zone owner name would never naturally need to.
pub fn encode_labels(host: &str) -> HardDnsResult<Vec<u8>> {
    if host.len() >= 2048 {
        return Err(HardDnsError::parse("host name too long"));
    }

    let mut out = Vec::with_capacity(host.len() + 2);
    for piece in host.split('.') {
        if piece.is_empty() {
            continue;
        }
        let bytes = piece.as_bytes();
        for chunk in bytes.chunks(DNS_MAX_LABEL) {
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
    }
    out.push(0);
    Ok(out)
}

/// Decodes a (possibly compressed) label sequence starting at `offset` within
/// `msg`. `offset == 0` means "this is a bare qname, not a full message" and a
/// compression pointer at that position is rejected, matching the convention
/// the proxy/NSS callers rely on when decoding a standalone qname buffer.
///
/// Returns the dotted name (trailing dot included) and the number of bytes
/// consumed from `offset` in the *original* buffer (a compression pointer
/// counts as exactly two bytes, regardless of how many hops it triggers).
pub fn decode_labels(msg: &[u8], offset: usize) -> HardDnsResult<(String, usize)> {
    let mut i = offset;
    let mut r: usize = 0;
    let mut compress_depth: u8 = 0;
    let mut s = String::new();

    loop {
        if i >= msg.len() {
            return Err(HardDnsError::parse("label offset out of bounds"));
        }
        let len = msg[i];
        if len == 0 {
            break;
        }

        if len as usize > DNS_MAX_LABEL {
            if offset == 0 {
                return Err(HardDnsError::parse("compression pointer in bare qname"));
            }
            compress_depth += 1;
            if compress_depth > MAX_COMPRESS_DEPTH {
                return Err(HardDnsError::parse("compression pointer depth exceeded"));
            }
            if len & 0xc0 != 0xc0 {
                return Err(HardDnsError::parse("invalid label length"));
            }
            if i + 1 >= msg.len() {
                return Err(HardDnsError::parse("truncated compression pointer"));
            }
            let target = msg[i + 1] as usize;
            if target >= msg.len() {
                return Err(HardDnsError::parse("compression pointer out of bounds"));
            }
            i = target;
            if compress_depth <= 1 {
                r += 1;
            }
            continue;
        }

        let len = len as usize;
        if i + len + 1 > msg.len() {
            return Err(HardDnsError::parse("truncated label"));
        }
        s.push_str(std::str::from_utf8(&msg[i + 1..i + 1 + len]).map_err(|e| HardDnsError::parse(e.to_string()))?);
        s.push('.');

        i += len + 1;
        if compress_depth == 0 {
            r += len + 1;
        }
    }

    if s.is_empty() {
        return Ok((s, r + 1));
    }
    if s.len() > DNS_MAX_NAME {
        return Err(HardDnsError::parse("decoded name exceeds 255 bytes"));
    }

    Ok((s, r + 1))
}

/// ASCII lowercase, used wherever names are compared for equality.
pub fn lowercase(s: &str) -> String {
    s.chars().map(|c| c.to_ascii_lowercase()).collect()
}

/// Reads a big-endian u16 from an arbitrary byte offset without alignment
/// assumptions (mirrors the original's unaligned-access helper).
pub fn unaligned_u16(buf: &[u8]) -> HardDnsResult<u16> {
    let mut cur = Cursor::new(buf);
    cur.read_u16::<BigEndian>().map_err(HardDnsError::from)
}

/// Builds a minimal 12-byte DNS header plus question section for `name`/`qtype`.
pub fn build_query(name: &str, qtype: u16) -> HardDnsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(DNS_HEADER_LEN + name.len() + 8);
    let id: u16 = rand::thread_rng().gen();

    out.write_u16::<BigEndian>(id)?;
    // qr=0, opcode=0, aa=0, tc=0, rd=1
    out.write_u8(0x01)?;
    // ra=0, z=0, ad=0, cd=0, rcode=0
    out.write_u8(0x00)?;
    out.write_u16::<BigEndian>(1)?; // qdcount
    out.write_u16::<BigEndian>(0)?; // ancount
    out.write_u16::<BigEndian>(0)?; // nscount
    out.write_u16::<BigEndian>(0)?; // arcount

    out.extend_from_slice(&encode_labels(name)?);
    out.write_u16::<BigEndian>(qtype)?;
    out.write_u16::<BigEndian>(QCLASS_IN)?;

    Ok(out)
}

/// Builds the `in-addr.arpa` PTR fqdn from raw 4-byte A rdata.
pub fn a2ptr_fqdn(rdata: &[u8]) -> HardDnsResult<String> {
    if rdata.len() != 4 {
        return Err(HardDnsError::parse("A rdata must be 4 bytes for PTR construction"));
    }
    let mut out = String::new();
    for b in rdata.iter().rev() {
        out.push_str(&format!("{}.", b));
    }
    out.push_str("in-addr.arpa");
    Ok(out)
}

/// Builds the `ip6.arpa` PTR fqdn from raw 16-byte AAAA rdata.
pub fn aaaa2ptr_fqdn(rdata: &[u8]) -> HardDnsResult<String> {
    if rdata.len() != 16 {
        return Err(HardDnsError::parse("AAAA rdata must be 16 bytes for PTR construction"));
    }
    let mut out = String::new();
    for b in rdata.iter().rev() {
        out.push_str(&format!("{:x}.{:x}.", b & 0xf, (b & 0xf0) >> 4));
    }
    out.push_str("ip6.arpa");
    Ok(out)
}

/// Charset/length validation only; does not check individual label sizes.
pub fn valid_name(name: &str) -> bool {
    let len = name.len();
    if !(2..=254).contains(&len) {
        return false;
    }
    name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_name() {
        let encoded = encode_labels("example.com").unwrap();
        let (decoded, consumed) = decode_labels(&encoded, 0).unwrap();
        assert_eq!(decoded, "example.com.");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn roundtrip_trailing_dot() {
        let encoded = encode_labels("example.com.").unwrap();
        let (decoded, _) = decode_labels(&encoded, 0).unwrap();
        assert_eq!(decoded, "example.com.");
    }

    #[test]
    fn splits_long_labels() {
        let long_label = "a".repeat(200);
        let encoded = encode_labels(&long_label).unwrap();
        // every sub-label must be <= 63 bytes
        let mut i = 0;
        while encoded[i] != 0 {
            assert!(encoded[i] as usize <= DNS_MAX_LABEL);
            i += encoded[i] as usize + 1;
        }
    }

    #[test]
    fn bare_qname_rejects_compression() {
        let buf = [0xc0u8, 0x00];
        assert!(decode_labels(&buf, 0).is_err());
    }

    #[test]
    fn compression_pointer_is_followed() {
        // message: [00]="\x03com\x00"(at 0), then a name pointing at offset 0
        let mut msg = vec![3, b'c', b'o', b'm', 0];
        let base = msg.len();
        msg.extend_from_slice(&[3, b'w', b'w', b'w']);
        msg.push(0xc0);
        msg.push(0x00);
        let (decoded, consumed) = decode_labels(&msg, base).unwrap();
        assert_eq!(decoded, "www.com.");
        assert_eq!(consumed, 4 + 2);
    }

    #[test]
    fn ptr_fqdn_helpers() {
        assert_eq!(a2ptr_fqdn(&[93, 184, 216, 34]).unwrap(), "34.216.184.93.in-addr.arpa");
    }

    #[test]
    fn valid_name_rejects_bad_charset() {
        assert!(valid_name("example.com"));
        assert!(!valid_name("exa mple.com"));
        assert!(!valid_name("x"));
    }
}
