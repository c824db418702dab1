//! Stub-resolver proxy: a single-threaded UDP/53 front end that answers
//! plain DNS queries from the cache or the DoH client, and transparently
//! forwards queries under configured internal domains to an internal
//! nameserver.
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};

use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};

use crate::answer::Record;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::doh::DohClient;
use crate::error::{HardDnsError, HardDnsResult};
use crate::wire::{self, QCLASS_IN, QTYPE_A, QTYPE_AAAA};

const RCODE_OK: u8 = 0;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_NXDOMAIN: u8 = 3;

/// Key for an outstanding query forwarded to an internal nameserver:
/// (lowercased fqdn, transaction id, internal nameserver address).
type ForwardKey = (String, u16, SocketAddr);

pub struct Proxy {
    socket: UdpSocket,
    cache: TtlCache,
    forward_pending: HashMap<ForwardKey, SocketAddr>,
}

impl Proxy {
    pub fn bind(local_addr: &str, local_port: u16) -> HardDnsResult<Self> {
        let socket = UdpSocket::bind((local_addr, local_port))
            .map_err(|e| HardDnsError::internal(format!("bind {}:{}: {}", local_addr, local_port, e)))?;
        Ok(Proxy {
            socket,
            cache: TtlCache::new(),
            forward_pending: HashMap::new(),
        })
    }

    /// Runs the event loop forever. Every iteration handles exactly one
    /// inbound datagram; malformed datagrams are dropped silently.
    pub fn run(&mut self, config: &Config, dns: &mut DohClient, upstreams: &mut crate::upstream::UpstreamPool) -> HardDnsResult<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!("recvfrom failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..len], src, config, dns, upstreams) {
                warn!("proxy: {}", e);
            }
        }
    }

    fn handle_datagram(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        config: &Config,
        dns: &mut DohClient,
        upstreams: &mut crate::upstream::UpstreamPool,
    ) -> HardDnsResult<()> {
        if datagram.len() < wire::DNS_HEADER_LEN + 5 {
            return Ok(());
        }

        let qdcount = BigEndian::read_u16(&datagram[4..6]);
        if qdcount != 1 {
            return Ok(());
        }

        let id = BigEndian::read_u16(&datagram[0..2]);
        let flags1 = datagram[2];
        let qr = (flags1 & 0x80) != 0;
        let opcode = (flags1 >> 3) & 0x0f;

        // Decoded from a slice starting exactly at the qname, at offset 0, so
        // that a compressed label here is rejected rather than silently
        // resolved against the wrong buffer.
        let (qname, qname_len) = match wire::decode_labels(&datagram[wire::DNS_HEADER_LEN..], 0) {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let fqdn = qname.trim_end_matches('.').to_string();

        if qr {
            self.dispatch_answer(&fqdn, id, src, datagram);
            return Ok(());
        }

        if opcode != 0 {
            return Ok(());
        }

        if let Some(route) = config
            .internal_domains
            .iter()
            .find(|r| fqdn.len() >= r.suffix.len() && fqdn[fqdn.len() - r.suffix.len()..] == r.suffix)
        {
            self.forward_query(route, &fqdn, id, src, datagram, config)?;
            return Ok(());
        }

        let qtype_off = wire::DNS_HEADER_LEN + qname_len;
        if qtype_off + 4 > datagram.len() {
            return Ok(());
        }
        let qtype = wire::unaligned_u16(&datagram[qtype_off..qtype_off + 2])?;
        let qclass = wire::unaligned_u16(&datagram[qtype_off + 2..qtype_off + 4])?;

        if !matches!(qtype, QTYPE_A | QTYPE_AAAA) || qclass != QCLASS_IN {
            return Ok(());
        }

        let question = &datagram[wire::DNS_HEADER_LEN..qtype_off + 4];

        let (result, from_cache) = match self.cache.lookup(&fqdn, qtype) {
            Some(r) => (Some(r), true),
            None => {
                let mut records = Vec::new();
                let mut raw = String::new();
                match dns.get(upstreams, &fqdn, qtype, &mut records, &mut raw) {
                    Ok(crate::answer::DohOutcome::Answered) => (Some(records), false),
                    Ok(crate::answer::DohOutcome::NoAnswer) => (None, false),
                    Err(e) => {
                        info!("proxy {} -> {}", fqdn, e);
                        self.send_error_reply(id, question, src, RCODE_SERVFAIL)?;
                        return Ok(());
                    }
                }
            }
        };

        let records = match result {
            Some(r) => r,
            None => {
                self.send_error_reply(id, question, src, RCODE_NXDOMAIN)?;
                return Ok(());
            }
        };

        if config.log_requests {
            info!(
                "proxy {} {}? -> {}",
                fqdn,
                if qtype == QTYPE_A { "A" } else { "AAAA" },
                if from_cache { "(cached)" } else { "fresh" }
            );
        }

        if !from_cache {
            self.cache.insert(&fqdn, qtype, records.clone());
        }

        self.send_answer_reply(id, question, src, &records)
    }

    fn dispatch_answer(&mut self, fqdn: &str, id: u16, src: SocketAddr, datagram: &[u8]) {
        let key = (wire::lowercase(fqdn), id, src);
        if let Some(client) = self.forward_pending.remove(&key) {
            let _ = self.socket.send_to(datagram, client);
        }
    }

    fn forward_query(
        &mut self,
        route: &crate::config::InternalDomainRoute,
        fqdn: &str,
        id: u16,
        src: SocketAddr,
        datagram: &[u8],
        config: &Config,
    ) -> HardDnsResult<()> {
        let ns_addr: SocketAddr = format!("{}:53", route.nameserver_ip)
            .parse()
            .map_err(|_| HardDnsError::config(format!("bad internal nameserver ip: {}", route.nameserver_ip)))?;

        self.socket
            .send_to(datagram, ns_addr)
            .map_err(|e| HardDnsError::internal(format!("forward_query sendto: {}", e)))?;

        self.forward_pending.insert((wire::lowercase(fqdn), id, ns_addr), src);

        if config.log_requests {
            info!("proxy fwd {} to {}", fqdn, route.nameserver_ip);
        }
        Ok(())
    }

    fn send_error_reply(&self, id: u16, question: &[u8], dst: SocketAddr, rcode: u8) -> HardDnsResult<()> {
        let mut reply = build_reply_header(id, 0, rcode);
        reply.extend_from_slice(question);
        self.socket
            .send_to(&reply, dst)
            .map_err(|e| HardDnsError::internal(format!("sendto: {}", e)))?;
        Ok(())
    }

    fn send_answer_reply(&self, id: u16, question: &[u8], dst: SocketAddr, records: &[Record]) -> HardDnsResult<()> {
        let mut body = Vec::new();
        let mut n_answers: u16 = 0;

        for rec in records.iter().filter(|r| !r.is_synthetic()) {
            body.extend_from_slice(&rec.name_wire);
            let mut tmp = [0u8; 2];
            BigEndian::write_u16(&mut tmp, rec.qtype);
            body.extend_from_slice(&tmp);
            BigEndian::write_u16(&mut tmp, rec.qclass);
            body.extend_from_slice(&tmp);
            // ttl_netorder's native bytes are already the wire bytes; writing
            // it through another BigEndian conversion would byte-swap twice
            // on a little-endian host.
            body.extend_from_slice(&rec.ttl_netorder.to_ne_bytes());
            BigEndian::write_u16(&mut tmp, rec.rdata.len() as u16);
            body.extend_from_slice(&tmp);
            body.extend_from_slice(&rec.rdata);
            n_answers += 1;
        }

        let mut reply = build_reply_header(id, n_answers, RCODE_OK);
        reply.extend_from_slice(question);
        reply.extend_from_slice(&body);

        self.socket
            .send_to(&reply, dst)
            .map_err(|e| HardDnsError::internal(format!("sendto: {}", e)))?;
        Ok(())
    }
}

fn build_reply_header(id: u16, a_count: u16, rcode: u8) -> Vec<u8> {
    let mut header = vec![0u8; wire::DNS_HEADER_LEN];
    BigEndian::write_u16(&mut header[0..2], id);
    header[2] = 0x80; // qr=1, opcode=0, aa=0, tc=0, rd=0 (echoed separately by caller if needed)
    header[3] = 0x80 | (rcode & 0x0f); // ra=1
    BigEndian::write_u16(&mut header[4..6], 1); // qdcount
    BigEndian::write_u16(&mut header[6..8], a_count);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_header_has_expected_bits() {
        let h = build_reply_header(0x1234, 2, RCODE_NXDOMAIN);
        assert_eq!(BigEndian::read_u16(&h[0..2]), 0x1234);
        assert_eq!(h[2] & 0x80, 0x80); // qr=1
        assert_eq!(h[3] & 0x0f, RCODE_NXDOMAIN);
        assert_eq!(BigEndian::read_u16(&h[6..8]), 2);
    }

    #[test]
    fn send_answer_reply_writes_ttl_in_network_order() {
        let proxy = Proxy::bind("127.0.0.1", 0).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client_addr = client.local_addr().unwrap();

        let ttl_netorder = 300u32.to_be();
        let rec = Record::new(vec![3, b'f', b'o', b'o', 0], QTYPE_A, ttl_netorder, vec![1, 2, 3, 4]);
        let question = wire::build_query("foo", QTYPE_A).unwrap();
        let question = &question[wire::DNS_HEADER_LEN..];

        proxy.send_answer_reply(0x1234, question, client_addr, &[rec]).unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = &buf[..len];

        let answer_start = wire::DNS_HEADER_LEN + question.len();
        let ttl_start = answer_start + 5 + 2 + 2; // owner "\x03foo\x00" + type + class
        let ttl_bytes = &reply[ttl_start..ttl_start + 4];
        assert_eq!(BigEndian::read_u32(ttl_bytes), 300);
    }
}
