//! The DoH client: walks the upstream pool, speaks either the RFC 8484
//! binary dialect or the JSON "Google-style" dialect over HTTP/1.1 GET, and
//! decodes CNAME chains into an ordered answer sequence.
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::answer::{DohOutcome, Record};
use crate::base64url;
use crate::error::{HardDnsError, HardDnsResult};
use crate::tls::TlsTransport;
use crate::upstream::UpstreamPool;
use crate::wire::{self, QCLASS_IN, QTYPE_A, QTYPE_AAAA, QTYPE_CNAME, QTYPE_MX, QTYPE_NS};

const MIN_REQUEST_PADDING: usize = 450;
const MAX_BODY_LEN: usize = 65535;
const MAX_RECV_ROUNDS: usize = 3;
const USER_AGENT: &str = "harddns";

pub struct DohClient {
    transport: TlsTransport,
    timeout: Duration,
}

impl DohClient {
    pub fn new(transport: TlsTransport, timeout: Duration) -> Self {
        DohClient { transport, timeout }
    }

    /// Resolves `name`/`qtype` against the upstream pool, appending any
    /// decoded records to `reply_out` (the caller decides whether to clear it
    /// first; back-to-back A/AAAA lookups rely on this to merge results).
    pub fn get(
        &mut self,
        pool: &mut UpstreamPool,
        name: &str,
        qtype: u16,
        reply_out: &mut Vec<Record>,
        raw_out: &mut String,
    ) -> HardDnsResult<DohOutcome> {
        if !wire::valid_name(name) {
            return Err(HardDnsError::parse(format!("invalid fqdn: {}", name)));
        }
        if !matches!(qtype, QTYPE_A | QTYPE_AAAA | QTYPE_NS | QTYPE_MX) {
            return Err(HardDnsError::parse(format!("unsupported qtype: {}", qtype)));
        }

        if pool.is_empty() {
            return Err(HardDnsError::config("upstream pool is empty"));
        }

        let mut last_err: Option<HardDnsError> = None;

        for _ in 0..pool.len() {
            let ip = match self.transport.peer() {
                Some(ip) if pool.descriptor(&ip).is_some() => ip,
                _ => match pool.rotate() {
                    Some(ip) => ip,
                    None => break,
                },
            };

            let desc = match pool.descriptor(&ip) {
                Some(d) => d.clone(),
                None => continue,
            };

            if self.transport.peer() != Some(ip) {
                if let Err(e) = self.transport.connect(&desc, self.timeout) {
                    warn!("connect to {} failed: {}", ip, e);
                    last_err = Some(e);
                    continue;
                }
            }

            let request = build_http_request(&desc, name, qtype)?;

            if let Err(e) = self.transport.send(request.as_bytes(), self.timeout) {
                warn!("send to {} failed, retrying once: {}", ip, e);
                if self.transport.connect(&desc, self.timeout).is_err()
                    || self.transport.send(request.as_bytes(), self.timeout).is_err()
                {
                    self.transport.close();
                    last_err = Some(e);
                    continue;
                }
            }

            let body = match self.read_response(&desc) {
                Ok(b) => b,
                Err(e) => {
                    warn!("response from {} failed: {}", ip, e);
                    self.transport.close();
                    last_err = Some(e);
                    continue;
                }
            };

            let parsed = if desc.rfc8484 {
                *raw_out = "rfc8484-binary".to_string();
                parse_binary(name, qtype, &body)
            } else {
                let body_str = String::from_utf8_lossy(&body).to_string();
                *raw_out = body_str.clone();
                parse_json(name, qtype, &body_str)
            };

            match parsed {
                Ok((records, outcome)) => {
                    reply_out.extend(records);
                    debug!("doh {} {} -> {:?}", name, qtype, outcome);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!("parse from {} failed: {}", ip, e);
                    self.transport.close();
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| HardDnsError::protocol("no upstream answered")))
    }

    /// Accumulates raw bytes across up to 3 reads. Kept as bytes (not `String`)
    /// throughout framing so an RFC 8484 binary body is never lossy-UTF8
    /// mangled before `parse_binary` sees it.
    fn read_response(&mut self, desc: &crate::upstream::UpstreamDescriptor) -> HardDnsResult<Vec<u8>> {
        let mut acc: Vec<u8> = Vec::new();
        for _ in 0..MAX_RECV_ROUNDS {
            let chunk = self.transport.recv(self.timeout)?;
            if chunk.is_empty() && acc.is_empty() {
                continue;
            }
            acc.extend_from_slice(&chunk);

            if acc.len() > 15 && !acc.starts_with(b"HTTP/1.1 200 OK") {
                return Err(HardDnsError::protocol("non-200 HTTP status"));
            }

            if let Some(body) = extract_body(&acc)? {
                return Ok(body);
            }
        }
        let _ = desc;
        Err(HardDnsError::protocol("incomplete response after maximum read rounds"))
    }
}

/// Returns `Some(body)` once the response is fully framed, else `None` to
/// keep accumulating.
fn extract_body(acc: &[u8]) -> HardDnsResult<Option<Vec<u8>>> {
    let header_end = match find_subslice(acc, b"\r\n\r\n") {
        Some(i) => i,
        None => return Ok(None),
    };
    let headers = String::from_utf8_lossy(&acc[..header_end]);
    let body = &acc[header_end + 4..];

    let chunked = headers
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:") && l.to_ascii_lowercase().contains("chunked"));

    if chunked {
        if body.ends_with(b"0\r\n\r\n") {
            return Ok(Some(dechunk(body)?));
        }
        return Ok(None);
    }

    if let Some(te) = headers.lines().find(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:")) {
        return Err(HardDnsError::protocol(format!("unsupported transfer-encoding: {}", te)));
    }

    let content_length = headers
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .ok_or_else(|| HardDnsError::protocol("response has neither Content-Length nor chunked framing"))?
        .parse::<usize>()
        .map_err(|_| HardDnsError::protocol("invalid Content-Length"))?;

    if content_length > MAX_BODY_LEN {
        return Err(HardDnsError::protocol("Content-Length too large"));
    }

    if body.len() >= content_length {
        Ok(Some(body[..content_length].to_vec()))
    } else {
        Ok(None)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(body: &[u8]) -> HardDnsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let line_end = find_subslice(rest, b"\r\n").ok_or_else(|| HardDnsError::protocol("malformed chunk size line"))?;
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| HardDnsError::protocol("malformed chunk size"))?
            .trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| HardDnsError::protocol("malformed chunk size"))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if size > rest.len() {
            return Err(HardDnsError::protocol("truncated chunk body"));
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
    Ok(out)
}

fn build_http_request(desc: &crate::upstream::UpstreamDescriptor, name: &str, qtype: u16) -> HardDnsResult<String> {
    let path = if desc.rfc8484 {
        let query = wire::build_query(name, qtype)?;
        format!("{}{}", desc.get_path, base64url::encode(&query))
    } else {
        format!("{}{}&type={}", desc.get_path, name, mnemonic(qtype)?)
    };

    let accept = if desc.rfc8484 {
        "application/dns-message"
    } else {
        "application/dns-json"
    };

    let mut req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Keep-Alive\r\nUser-Agent: {}\r\nAccept: {}\r\n",
        path, desc.host, USER_AGENT, accept
    );

    let base_len = req.len() + "X-Igno: \r\n\r\n".len();
    if base_len < MIN_REQUEST_PADDING {
        let pad_len = MIN_REQUEST_PADDING - base_len;
        req.push_str(&format!("X-Igno: {}\r\n", "x".repeat(pad_len)));
    }
    req.push_str("\r\n");
    Ok(req)
}

fn mnemonic(qtype: u16) -> HardDnsResult<&'static str> {
    match qtype {
        QTYPE_A => Ok("A"),
        QTYPE_AAAA => Ok("AAAA"),
        QTYPE_NS => Ok("NS"),
        QTYPE_MX => Ok("MX"),
        _ => Err(HardDnsError::parse("qtype has no JSON mnemonic")),
    }
}

/// RFC 8484 binary reply parser. A nonzero rcode is `NoAnswer`, not an error.
fn parse_binary(name: &str, qtype: u16, body: &[u8]) -> HardDnsResult<(Vec<Record>, DohOutcome)> {
    if body.len() < wire::DNS_HEADER_LEN + 5 {
        return Err(HardDnsError::parse("reply shorter than minimum DNS message"));
    }

    let flags1 = body[2];
    let qr = (flags1 & 0x80) != 0;
    if !qr {
        return Err(HardDnsError::parse("reply has qr=0"));
    }
    let rcode = body[3] & 0x0f;
    if rcode != 0 {
        return Ok((Vec::new(), DohOutcome::NoAnswer));
    }

    let qdcount = BigEndian::read_u16(&body[4..6]);
    let ancount = BigEndian::read_u16(&body[6..8]);
    if qdcount != 1 {
        return Err(HardDnsError::parse("reply does not echo exactly one question"));
    }

    let (qname, qname_len) = wire::decode_labels(body, wire::DNS_HEADER_LEN)?;
    if wire::lowercase(&qname) != wire::lowercase(&format!("{}.", name)) {
        return Err(HardDnsError::parse("reply question does not match request"));
    }

    let mut idx = wire::DNS_HEADER_LEN + qname_len + 4; // qtype + qclass

    let mut fqdns: std::collections::HashSet<String> = std::collections::HashSet::new();
    fqdns.insert(wire::lowercase(&qname));

    let mut records = Vec::new();

    // First pass: build the CNAME closure, emitting synthetic markers.
    let mut scan_idx = idx;
    for _ in 0..ancount {
        let (owner, owner_len) = wire::decode_labels(body, scan_idx)?;
        scan_idx += owner_len;
        if scan_idx + 10 > body.len() {
            return Err(HardDnsError::parse("truncated resource record"));
        }
        let rtype = BigEndian::read_u16(&body[scan_idx..scan_idx + 2]);
        let rclass = BigEndian::read_u16(&body[scan_idx + 2..scan_idx + 4]);
        let ttl = BigEndian::read_u32(&body[scan_idx + 4..scan_idx + 8]);
        let rdlen = BigEndian::read_u16(&body[scan_idx + 8..scan_idx + 10]) as usize;
        let rdata_start = scan_idx + 10;
        if rclass != QCLASS_IN || rdata_start + rdlen > body.len() {
            return Err(HardDnsError::parse("malformed resource record"));
        }
        if rdlen == 0 && matches!(rtype, QTYPE_CNAME | QTYPE_NS | QTYPE_MX) {
            return Err(HardDnsError::parse("zero-length rdata on a record of interest"));
        }

        if rtype == QTYPE_CNAME && fqdns.contains(&wire::lowercase(&owner)) {
            let (target, _) = wire::decode_labels(body, rdata_start)?;
            fqdns.insert(wire::lowercase(&target));
            records.push(Record::nss_marker(&target, ttl.to_be()));
        }

        scan_idx = rdata_start + rdlen;
    }

    // Second pass: emit A/AAAA/CNAME/NS/MX owned by a name in the closure.
    for _ in 0..ancount {
        let (owner, owner_len) = wire::decode_labels(body, idx)?;
        idx += owner_len;
        let rtype = BigEndian::read_u16(&body[idx..idx + 2]);
        let rclass = BigEndian::read_u16(&body[idx + 2..idx + 4]);
        let ttl = BigEndian::read_u32(&body[idx + 4..idx + 8]);
        let rdlen = BigEndian::read_u16(&body[idx + 8..idx + 10]) as usize;
        let rdata_start = idx + 10;
        let rdata = &body[rdata_start..rdata_start + rdlen];

        if fqdns.contains(&wire::lowercase(&owner)) {
            let owner_wire = wire::encode_labels(&owner)?;
            match rtype {
                QTYPE_A if rdlen == 4 => {
                    records.push(Record::new(owner_wire, rtype, ttl.to_be(), rdata.to_vec()));
                }
                QTYPE_AAAA if rdlen == 16 => {
                    records.push(Record::new(owner_wire, rtype, ttl.to_be(), rdata.to_vec()));
                }
                QTYPE_CNAME => {
                    let (target, _) = wire::decode_labels(body, rdata_start)?;
                    let target_wire = wire::encode_labels(&target)?;
                    records.push(Record::new(owner_wire, rtype, ttl.to_be(), target_wire));
                }
                rt if rt == qtype && matches!(rt, QTYPE_NS | QTYPE_MX) => {
                    records.push(Record::new(owner_wire, rtype, ttl.to_be(), rdata.to_vec()));
                }
                _ => {}
            }
        }

        idx = rdata_start + rdlen;
    }

    let has_answer = records.iter().any(|r| !r.is_synthetic());
    let outcome = if has_answer { DohOutcome::Answered } else { DohOutcome::NoAnswer };
    Ok((records, outcome))
}

/// JSON "Google-style" reply parser: a deliberately hand-rolled substring
/// scanner rather than a generic JSON library, matching the narrow contract
/// this format actually needs (case folding, bounded body size, field order
/// is never relied on beyond what's scanned for here).
fn parse_json(name: &str, qtype: u16, body: &str) -> HardDnsResult<(Vec<Record>, DohOutcome)> {
    if body.len() > MAX_BODY_LEN {
        return Err(HardDnsError::parse("JSON body too large"));
    }
    let lowered: String = body.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_ascii_lowercase();

    if !lowered.starts_with("{\"status\":0") {
        return Ok((Vec::new(), DohOutcome::NoAnswer));
    }
    if !lowered.contains("\"answer\":[") {
        return Ok((Vec::new(), DohOutcome::NoAnswer));
    }

    let mut records = Vec::new();
    let mut fqdns: Vec<String> = vec![wire::lowercase(name) + "."];
    let mut current = fqdns[0].clone();

    for _ in 0..10 {
        let needle = format!("\"name\":\"{}\",\"type\":5,\"ttl\":", current);
        let pos = match lowered.find(&needle) {
            Some(p) => p,
            None => break,
        };
        let after = &lowered[pos + needle.len()..];
        let ttl = take_decimal(after)?;
        let data = take_quoted_field(after, "\"data\":\"")?;
        let target = format!("{}.", data.trim_end_matches('.'));

        let owner_wire = wire::encode_labels(&current)?;
        let target_wire = wire::encode_labels(&target)?;
        records.push(Record::new(owner_wire, QTYPE_CNAME, ttl.to_be(), target_wire));
        records.push(Record::nss_marker(&target, ttl.to_be()));

        fqdns.push(target.clone());
        current = target;
    }

    for fqdn in &fqdns {
        let needle = format!("\"name\":\"{}\",\"type\":", fqdn);
        let mut search_from = 0usize;
        while let Some(rel) = lowered[search_from..].find(&needle) {
            let pos = search_from + rel;
            let after = &lowered[pos + needle.len()..];
            let atype = take_decimal(after)?;
            let after_ttl = &after[skip_decimal(after)..];
            let after_ttl = after_ttl
                .strip_prefix(",\"ttl\":")
                .ok_or_else(|| HardDnsError::parse("expected ttl field after type"))?;
            let ttl = take_decimal(after_ttl)?;
            let data = take_quoted_field(after_ttl, "\"data\":\"")?;

            let owner_wire = wire::encode_labels(fqdn)?;
            match atype {
                1 => {
                    let octets: Vec<u8> = data
                        .split('.')
                        .map(|p| p.parse::<u8>())
                        .collect::<Result<_, _>>()
                        .map_err(|_| HardDnsError::parse("invalid IPv4 literal in JSON answer"))?;
                    if octets.len() == 4 {
                        records.push(Record::new(owner_wire, QTYPE_A, ttl.to_be(), octets));
                    }
                }
                28 => {
                    let addr: std::net::Ipv6Addr = data
                        .parse()
                        .map_err(|_| HardDnsError::parse("invalid IPv6 literal in JSON answer"))?;
                    records.push(Record::new(owner_wire, QTYPE_AAAA, ttl.to_be(), addr.octets().to_vec()));
                }
                2 if qtype == QTYPE_NS => {
                    if !wire::valid_name(&data) {
                        return Err(HardDnsError::parse("invalid NS target in JSON answer"));
                    }
                    let target_wire = wire::encode_labels(&data)?;
                    records.push(Record::new(owner_wire, QTYPE_NS, ttl.to_be(), target_wire));
                }
                _ => {}
            }

            search_from = pos + needle.len();
        }
    }

    let has_answer = records.iter().any(|r| !r.is_synthetic());
    let outcome = if has_answer { DohOutcome::Answered } else { DohOutcome::NoAnswer };
    Ok((records, outcome))
}

fn skip_decimal(s: &str) -> usize {
    s.bytes().take_while(|b| b.is_ascii_digit()).count()
}

fn take_decimal(s: &str) -> HardDnsResult<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u32>().map_err(|_| HardDnsError::parse("expected decimal field"))
}

fn take_quoted_field<'a>(s: &'a str, prefix: &str) -> HardDnsResult<&'a str> {
    let pos = s.find(prefix).ok_or_else(|| HardDnsError::parse(format!("missing field {}", prefix)))?;
    let start = pos + prefix.len();
    let end = s[start..].find('"').ok_or_else(|| HardDnsError::parse("unterminated string field"))?;
    Ok(&s[start..start + end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_reply_with_cname_rdlen(rdlen: u16) -> Vec<u8> {
        let mut body = vec![0u8; 12];
        body[2] = 0x80; // qr=1
        BigEndian::write_u16(&mut body[4..6], 1); // qdcount
        BigEndian::write_u16(&mut body[6..8], 1); // ancount

        let qname = wire::encode_labels("example.com").unwrap();
        body.extend_from_slice(&qname);
        body.extend(QTYPE_A.to_be_bytes());
        body.extend(QCLASS_IN.to_be_bytes());

        body.extend_from_slice(&qname);
        body.extend(QTYPE_CNAME.to_be_bytes());
        body.extend(QCLASS_IN.to_be_bytes());
        body.extend(300u32.to_be_bytes());
        body.extend(rdlen.to_be_bytes());
        if rdlen > 0 {
            body.extend(std::iter::repeat(0u8).take(rdlen as usize));
        }
        body
    }

    #[test]
    fn parse_binary_rejects_zero_length_cname_rdata() {
        let body = binary_reply_with_cname_rdlen(0);
        assert!(parse_binary("example.com", QTYPE_A, &body).is_err());
    }

    #[test]
    fn extracts_content_length_body() {
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let body = extract_body(resp).unwrap().unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn waits_for_full_content_length_body() {
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello";
        assert!(extract_body(resp).unwrap().is_none());
    }

    #[test]
    fn dechunks_body() {
        let resp = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let body = extract_body(resp).unwrap().unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn rejects_unknown_transfer_encoding() {
        let resp = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\nabc";
        assert!(extract_body(resp).is_err());
    }

    #[test]
    fn json_parser_simple_a_record() {
        let body = r#"{"status":0,"answer":[{"name":"example.com.","type":1,"ttl":300,"data":"93.184.216.34"}]}"#;
        let (records, outcome) = parse_json("example.com", QTYPE_A, body).unwrap();
        assert_eq!(outcome, DohOutcome::Answered);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rdata, vec![93, 184, 216, 34]);
    }

    #[test]
    fn json_parser_nxdomain() {
        let body = r#"{"status":0,"comment":"no data"}"#;
        let (records, outcome) = parse_json("nope.example", QTYPE_A, body).unwrap();
        assert!(records.is_empty());
        assert_eq!(outcome, DohOutcome::NoAnswer);
    }

    #[test]
    fn build_request_has_minimum_padding() {
        let desc = crate::upstream::UpstreamDescriptor {
            ip: "1.1.1.1".parse().unwrap(),
            port: 443,
            cn: "cloudflare-dns.com".into(),
            host: "cloudflare-dns.com".into(),
            get_path: "/dns-query?name=".into(),
            rfc8484: false,
        };
        let req = build_http_request(&desc, "a.com", QTYPE_A).unwrap();
        assert!(req.len() >= MIN_REQUEST_PADDING);
    }
}
