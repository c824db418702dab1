//! Host name-service adaptor: the contract a libc NSS module's
//! `gethostbyname3_r`/`gethostbyname4_r` entry points call into. Packing the
//! result into glibc's `hostent`/`gaih_addrtuple` buffer layout is the OS
//! integration glue this crate treats as out of scope; what's in scope is
//! everything up to that point — serialized single-flight access to the TLS
//! session, CNAME chasing capped at 3 levels (tighter than the 10-level cap
//! the wire parser itself enforces), the `nss_aaaa` gate, and bypassing the
//! cache entirely since the real libc resolver caches this for us.
use std::net::IpAddr;
use std::sync::Mutex;

use log::info;

use crate::answer::Record;
use crate::config::Config;
use crate::doh::DohClient;
use crate::error::{HardDnsError, HardDnsResult};
use crate::upstream::UpstreamPool;
use crate::wire::{QTYPE_A, QTYPE_AAAA, QTYPE_CNAME};

/// Serializes every call into the adaptor; at most one question is ever in
/// flight on the shared TLS session.
static SSL_MTX: Mutex<()> = Mutex::new(());

const MAX_ADAPTOR_CNAME_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct HostEntry {
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub addresses: Vec<IpAddr>,
    pub ttl: u32,
}

/// Equivalent of `gethostbyname3_r`: resolves a single address family.
pub fn by_name(
    config: &Config,
    dns: &mut DohClient,
    upstreams: &mut UpstreamPool,
    name: &str,
    family: IpAddr,
) -> HardDnsResult<HostEntry> {
    let qtype = match family {
        IpAddr::V4(_) => QTYPE_A,
        IpAddr::V6(_) => {
            if !config.nss_aaaa {
                return Err(HardDnsError::config("AAAA disabled by configuration"));
            }
            QTYPE_AAAA
        }
    };

    let _guard = SSL_MTX.lock().unwrap();

    let mut current = name.to_string();
    let mut records: Vec<Record> = Vec::new();
    let mut raw = String::new();

    for _ in 0..MAX_ADAPTOR_CNAME_DEPTH {
        if current.is_empty() {
            break;
        }
        records.clear();
        dns.get(upstreams, &current, qtype, &mut records, &mut raw)?;

        let has_address = records.iter().any(|r| !r.is_synthetic() && r.qtype == qtype);
        if has_address {
            break;
        }

        current = next_cname_target(&records).unwrap_or_default();
    }

    if config.log_requests {
        info!("{} {:?}? -> {}", name, family, raw);
    }

    entry_from_records(name, qtype, &records)
}

/// Equivalent of `gethostbyname4_r`: resolves both families in one call,
/// deliberately not clearing the answer sequence between the A and AAAA
/// lookups so addresses from both accumulate together.
pub fn by_name_both_families(
    config: &Config,
    dns: &mut DohClient,
    upstreams: &mut UpstreamPool,
    name: &str,
) -> HardDnsResult<HostEntry> {
    let _guard = SSL_MTX.lock().unwrap();

    let mut current = name.to_string();
    let mut records: Vec<Record> = Vec::new();
    let mut raw = String::new();

    for _ in 0..MAX_ADAPTOR_CNAME_DEPTH {
        if current.is_empty() {
            break;
        }
        dns.get(upstreams, &current, QTYPE_A, &mut records, &mut raw)?;
        if config.nss_aaaa {
            dns.get(upstreams, &current, QTYPE_AAAA, &mut records, &mut raw)?;
        }

        let has_address = records
            .iter()
            .any(|r| !r.is_synthetic() && matches!(r.qtype, QTYPE_A | QTYPE_AAAA));
        if has_address {
            break;
        }

        current = next_cname_target(&records).unwrap_or_default();
    }

    if config.log_requests {
        info!("{} ANY? -> {}", name, raw);
    }

    entry_from_records(name, 0, &records)
}

fn next_cname_target(records: &[Record]) -> Option<String> {
    records.iter().find(|r| r.qtype == QTYPE_CNAME && !r.is_synthetic()).and_then(|r| {
        crate::wire::decode_labels(&r.rdata, 0).ok().map(|(name, _)| name)
    })
}

fn entry_from_records(name: &str, qtype: u16, records: &[Record]) -> HardDnsResult<HostEntry> {
    let mut addresses = Vec::new();
    let mut aliases = Vec::new();
    let mut ttl = 0u32;

    for rec in records {
        if rec.is_synthetic() {
            if let Ok(alias) = String::from_utf8(rec.rdata.clone()) {
                aliases.push(alias);
            }
            continue;
        }
        match rec.qtype {
            QTYPE_A if rec.rdata.len() == 4 && (qtype == 0 || qtype == QTYPE_A) => {
                addresses.push(IpAddr::V4(std::net::Ipv4Addr::new(
                    rec.rdata[0],
                    rec.rdata[1],
                    rec.rdata[2],
                    rec.rdata[3],
                )));
                ttl = u32::from_be(rec.ttl_netorder);
            }
            QTYPE_AAAA if rec.rdata.len() == 16 && (qtype == 0 || qtype == QTYPE_AAAA) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rec.rdata);
                addresses.push(IpAddr::V6(std::net::Ipv6Addr::from(octets)));
                ttl = u32::from_be(rec.ttl_netorder);
            }
            _ => {}
        }
    }

    if addresses.is_empty() {
        return Err(HardDnsError::protocol(format!("no address records for {}", name)));
    }

    Ok(HostEntry {
        canonical_name: name.to_string(),
        aliases,
        addresses,
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::QTYPE_A;

    #[test]
    fn entry_from_records_collects_addresses() {
        let rec = Record::new(vec![3, b'f', b'o', b'o', 0], QTYPE_A, 300u32.to_be(), vec![1, 2, 3, 4]);
        let entry = entry_from_records("foo", QTYPE_A, &[rec]).unwrap();
        assert_eq!(entry.addresses.len(), 1);
        assert_eq!(entry.ttl, 300);
    }

    #[test]
    fn entry_from_records_fails_with_no_addresses() {
        let synth = Record::nss_marker("bar.", 10u32.to_be());
        assert!(entry_from_records("foo", QTYPE_A, &[synth]).is_err());
    }
}
