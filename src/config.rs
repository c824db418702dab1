//! Parses `harddns.conf` into the immutable `Config` value every component
//! is handed at start. The directive grammar is intentionally tolerant:
//! unrecognised lines and blank lines are ignored rather than rejected, and
//! all whitespace is stripped from each line before matching, mirroring the
//! original daemon's forgiving parser.
use std::fs;
use std::path::Path;

use crate::error::{HardDnsError, HardDnsResult};
use crate::upstream::{PinnedKeySet, UpstreamDescriptor, UpstreamPool};

#[derive(Debug, Clone)]
pub struct InternalDomainRoute {
    pub suffix: String,
    pub nameserver_ip: String,
}

pub struct Config {
    pub upstreams: UpstreamPool,
    pub internal_domains: Vec<InternalDomainRoute>,
    pub log_requests: bool,
    pub nss_aaaa: bool,
    pub cache_ptr: bool,
    pub pinned: PinnedKeySet,
}

impl Config {
    pub fn parse(text: &str) -> HardDnsResult<(UpstreamPool, Vec<InternalDomainRoute>, bool, bool, bool)> {
        let mut upstreams = UpstreamPool::new();
        let mut internal_domains = Vec::new();
        let mut log_requests = false;
        let mut nss_aaaa = false;
        let mut cache_ptr = false;
        let mut current: Option<UpstreamDescriptor> = None;

        for raw_line in text.lines() {
            let line: String = raw_line.chars().filter(|c| !c.is_whitespace()).collect();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line == "log_requests" {
                log_requests = true;
            } else if line == "nss_aaaa" {
                nss_aaaa = true;
            } else if line == "cache_PTR" {
                cache_ptr = true;
            } else if line == "rfc8484" {
                if let Some(desc) = current.as_mut() {
                    desc.rfc8484 = true;
                }
            } else if let Some(v) = line.strip_prefix("nameserver=") {
                if let Some(desc) = current.take() {
                    upstreams.push(desc);
                }
                let ip = v.parse().map_err(|_| HardDnsError::config(format!("bad nameserver ip: {}", v)))?;
                current = Some(UpstreamDescriptor::new(ip));
            } else if let Some(v) = line.strip_prefix("cn=") {
                if let Some(desc) = current.as_mut() {
                    desc.cn = v.to_string();
                }
            } else if let Some(v) = line.strip_prefix("host=") {
                if let Some(desc) = current.as_mut() {
                    desc.host = v.to_string();
                }
            } else if let Some(v) = line.strip_prefix("get=") {
                if let Some(desc) = current.as_mut() {
                    desc.get_path = v.to_string();
                }
            } else if let Some(v) = line.strip_prefix("port=") {
                if let Some(desc) = current.as_mut() {
                    desc.port = v.parse().map_err(|_| HardDnsError::config(format!("bad port: {}", v)))?;
                }
            } else if let Some(v) = line.strip_prefix("internal_domain=") {
                let mut parts = v.splitn(2, ',');
                let suffix = parts.next().unwrap_or_default().to_string();
                let ns = parts.next().unwrap_or_default().to_string();
                if suffix.is_empty() || ns.is_empty() {
                    return Err(HardDnsError::config(format!("malformed internal_domain directive: {}", v)));
                }
                internal_domains.push(InternalDomainRoute { suffix, nameserver_ip: ns });
            }
            // unrecognised directives fall through silently
        }

        if let Some(desc) = current.take() {
            upstreams.push(desc);
        }

        Ok((upstreams, internal_domains, log_requests, nss_aaaa, cache_ptr))
    }

    /// Reads `conf_path` and walks `pinned_dir` (if it exists) for PEM
    /// certificates contributing to the pinned-key set.
    pub fn load(conf_path: &Path, pinned_dir: &Path) -> HardDnsResult<Config> {
        let text = fs::read_to_string(conf_path)
            .map_err(|e| HardDnsError::config(format!("reading {}: {}", conf_path.display(), e)))?;
        let (upstreams, internal_domains, log_requests, nss_aaaa, cache_ptr) = Config::parse(&text)?;
        let pinned = load_pinned_keys(pinned_dir);

        Ok(Config {
            upstreams,
            internal_domains,
            log_requests,
            nss_aaaa,
            cache_ptr,
            pinned,
        })
    }
}

fn load_pinned_keys(dir: &Path) -> PinnedKeySet {
    let mut set = PinnedKeySet::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return set,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let pem_text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let der = match pem_to_der(&pem_text) {
            Some(d) => d,
            None => continue,
        };
        if let Ok((_, cert)) = x509_parser::parse_x509_certificate(&der) {
            set.add(cert.public_key().raw.to_vec());
        }
    }
    set
}

fn pem_to_der(pem_text: &str) -> Option<Vec<u8>> {
    let start = pem_text.find("-----BEGIN CERTIFICATE-----")?;
    let end = pem_text.find("-----END CERTIFICATE-----")?;
    let body = &pem_text[start..end];
    let b64: String = body.lines().filter(|l| !l.starts_with("-----")).collect();
    base64::engine::general_purpose::STANDARD.decode(b64).ok()
}

use base64::Engine as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_upstream_block() {
        let conf = "\
log_requests
nameserver=1.1.1.1
cn=cloudflare-dns.com
host=cloudflare-dns.com
get=/dns-query?name=
port=443
";
        let (pool, _routes, log_requests, _, _) = Config::parse(conf).unwrap();
        assert!(log_requests);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn parses_internal_domain_routes() {
        let conf = "internal_domain=corp.local,10.0.0.1\n";
        let (_pool, routes, ..) = Config::parse(conf).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].suffix, "corp.local");
        assert_eq!(routes[0].nameserver_ip, "10.0.0.1");
    }

    #[test]
    fn ignores_unknown_directives() {
        let conf = "totally_unknown_directive=xyz\nnameserver=8.8.8.8\n";
        let (pool, ..) = Config::parse(conf).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn strips_whitespace_per_line() {
        let conf = "  log_requests  \n  nameserver = 1.1.1.1  \n";
        // note: stripping all whitespace turns "nameserver = 1.1.1.1" into
        // "nameserver=1.1.1.1", matching the original's behavior
        let (pool, _routes, log_requests, ..) = Config::parse(conf).unwrap();
        assert!(log_requests);
        assert_eq!(pool.len(), 1);
    }
}
