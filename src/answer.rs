//! The answer sequence shared by the DoH client, the cache, and the proxy:
//! an ordered list of resource records, plus the synthetic "NSS CNAME"
//! marker entries used to carry alias chains to the host name-service
//! adaptor without a second decode pass.
use crate::wire::QCLASS_IN;

pub const NSS_MARKER_PREFIX: &str = "NSS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Owner name, wire-encoded labels (not a compression pointer).
    pub name_wire: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
    /// Network-order TTL, as it will appear on the wire.
    pub ttl_netorder: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    pub fn new(name_wire: Vec<u8>, qtype: u16, ttl_netorder: u32, rdata: Vec<u8>) -> Self {
        Record {
            name_wire,
            qtype,
            qclass: QCLASS_IN,
            ttl_netorder,
            rdata,
        }
    }

    /// A synthetic marker carrying an alias fqdn to the NSS adaptor. Skipped
    /// by the cache's min-TTL computation and by the proxy's reply builder.
    pub fn nss_marker(alias_fqdn: &str, ttl_netorder: u32) -> Self {
        Record {
            name_wire: format!("{}{}", NSS_MARKER_PREFIX, " CNAME").into_bytes(),
            qtype: 0,
            qclass: 0,
            ttl_netorder,
            rdata: alias_fqdn.as_bytes().to_vec(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.name_wire.starts_with(NSS_MARKER_PREFIX.as_bytes())
    }
}

pub type AnswerSet = Vec<Record>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohOutcome {
    /// Well-formed reply, but no usable A/AAAA/NS/MX record (includes a
    /// nonzero rcode — that is not treated as a transport error).
    NoAnswer,
    Answered,
}
