//! TTL-driven answer cache, keyed by (lowercased fqdn, network-order qtype).
//! Expiry is computed from the minimum TTL across non-synthetic records;
//! on lookup every returned TTL is rewritten to the residual so clients
//! observe TTLs that count down rather than a series of identical values.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::answer::Record;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

struct CacheEntry {
    answer: Vec<Record>,
    valid_until: u64,
}

#[derive(Default)]
pub struct TtlCache {
    entries: HashMap<(String, u16), CacheEntry>,
}

impl TtlCache {
    pub fn new() -> Self {
        TtlCache { entries: HashMap::new() }
    }

    /// Returns a copy of the cached answer with TTLs rewritten to the
    /// residual, or `None` on miss or expiry (an expired entry is evicted).
    pub fn lookup(&mut self, fqdn: &str, qtype_netorder: u16) -> Option<Vec<Record>> {
        let key = (crate::wire::lowercase(fqdn), qtype_netorder);
        let now = now_secs();

        let entry = self.entries.get(&key)?;
        if entry.valid_until <= now {
            self.entries.remove(&key);
            return None;
        }

        let residual = (entry.valid_until - now) as u32;
        let mut out = entry.answer.clone();
        for rec in out.iter_mut() {
            if !rec.is_synthetic() {
                rec.ttl_netorder = residual.to_be();
            }
        }
        Some(out)
    }

    /// Overwrites any existing entry for this key. Does nothing if the
    /// answer carries no non-synthetic record (nothing to derive a TTL from).
    pub fn insert(&mut self, fqdn: &str, qtype_netorder: u16, answer: Vec<Record>) {
        let min_ttl = answer
            .iter()
            .filter(|r| !r.is_synthetic())
            .map(|r| u32::from_be(r.ttl_netorder))
            .min();

        let min_ttl = match min_ttl {
            Some(t) => t,
            None => return,
        };

        let key = (crate::wire::lowercase(fqdn), qtype_netorder);
        self.entries.insert(
            key,
            CacheEntry {
                answer,
                valid_until: now_secs() + min_ttl as u64,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::QTYPE_A;

    #[test]
    fn insert_then_lookup_rewrites_ttl() {
        let mut cache = TtlCache::new();
        let rec = Record::new(vec![3, b'f', b'o', b'o', 0], QTYPE_A, 300u32.to_be(), vec![1, 2, 3, 4]);
        cache.insert("foo", QTYPE_A, vec![rec]);

        let got = cache.lookup("foo", QTYPE_A).unwrap();
        assert_eq!(got.len(), 1);
        assert!(u32::from_be(got[0].ttl_netorder) <= 300);
    }

    #[test]
    fn expired_entry_is_evicted() {
        let mut cache = TtlCache::new();
        let rec = Record::new(vec![3, b'f', b'o', b'o', 0], QTYPE_A, 0u32.to_be(), vec![1, 2, 3, 4]);
        cache.insert("foo", QTYPE_A, vec![rec]);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.lookup("foo", QTYPE_A).is_none());
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn min_ttl_ignores_synthetic_records() {
        let mut cache = TtlCache::new();
        let real = Record::new(vec![3, b'f', b'o', b'o', 0], QTYPE_A, 300u32.to_be(), vec![1, 2, 3, 4]);
        let synthetic = Record::nss_marker("bar.", 1u32.to_be());
        cache.insert("foo", QTYPE_A, vec![real, synthetic]);
        let got = cache.lookup("foo", QTYPE_A).unwrap();
        let real_rec = got.iter().find(|r| !r.is_synthetic()).unwrap();
        assert!(u32::from_be(real_rec.ttl_netorder) <= 300);
    }

    #[test]
    fn insert_with_only_synthetic_records_is_noop() {
        let mut cache = TtlCache::new();
        cache.insert("foo", QTYPE_A, vec![Record::nss_marker("bar.", 10u32.to_be())]);
        assert!(cache.lookup("foo", QTYPE_A).is_none());
    }
}
