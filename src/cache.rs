//! The resource record cache.
//!
//! Answers are memoized under their `(name, type)` key for as long as the
//! shortest TTL among their records allows. Negative answers, NXDOMAIN or
//! NoData, are stored as an empty record list with a fixed short lifetime.
//! Readers run in parallel under a shared lock; expired entries are simply
//! misses and get dropped by the next writer that trips over them.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::time::{Duration, Instant};

use crate::base::{Record, Rtype};

/// Longest time a record is served from the cache, in seconds.
///
/// TTLs beyond this are clamped; they are almost certainly junk.
const MAX_VALIDITY: u32 = 1_000_000;

//------------ ResourceCache -------------------------------------------------

/// A TTL-bounded store of previous answers.
#[derive(Debug)]
pub struct ResourceCache {
    /// The cached entries.
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,

    /// Number of entries kept before eviction sets in.
    capacity: usize,

    /// Lifetime of a cached negative answer, in seconds.
    ///
    /// Zero disables negative caching.
    negative_ttl: u32,
}

impl ResourceCache {
    /// Creates a new cache.
    pub fn new(capacity: usize, negative_ttl: u32) -> Self {
        ResourceCache {
            entries: RwLock::new(HashMap::new()),
            capacity,
            negative_ttl,
        }
    }

    /// Returns the stored records for a name and type.
    ///
    /// An empty list is a cached negative answer. `None` means the cache
    /// has nothing useful and the query has to go out on the wire.
    pub fn get_records(
        &self,
        name: &str,
        rtype: Rtype,
    ) -> Option<Vec<Record>> {
        let key = CacheKey::new(name, rtype);
        let expired = {
            let entries = self.entries.read();
            match entries.get(&key) {
                None => return None,
                Some(entry) => {
                    if entry.expires_at > Instant::now() {
                        return Some(entry.records.clone());
                    }
                    true
                }
            }
        };
        if expired {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get(&key) {
                if entry.expires_at <= Instant::now() {
                    entries.remove(&key);
                }
            }
        }
        None
    }

    /// Returns the first stored record for a name and type.
    pub fn get_record(&self, name: &str, rtype: Rtype) -> Option<Record> {
        self.get_records(name, rtype)
            .and_then(|records| records.into_iter().next())
    }

    /// Stores the records for a name and type, replacing any prior entry.
    ///
    /// The entry lives for the smallest TTL among the records. A smallest
    /// TTL of zero stores nothing. An empty record list is stored as a
    /// negative answer with the configured negative TTL.
    pub fn put(&self, name: &str, rtype: Rtype, records: Vec<Record>) {
        let ttl = match records.iter().map(|record| record.ttl).min() {
            Some(ttl) => ttl.min(MAX_VALIDITY),
            None => self.negative_ttl,
        };
        let key = CacheKey::new(name, rtype);
        let mut entries = self.entries.write();
        entries.remove(&key);
        if ttl == 0 {
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                records,
                expires_at: Instant::now()
                    + Duration::from_secs(u64::from(ttl)),
            },
        );
        if entries.len() > self.capacity {
            Self::evict(&mut entries, self.capacity);
        }
    }

    /// Drops entries until at most `capacity` remain.
    ///
    /// Expired entries go first, then whichever expire earliest.
    fn evict(entries: &mut HashMap<CacheKey, CacheEntry>, capacity: usize) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        while entries.len() > capacity {
            let key = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
                .expect("the map cannot be empty while over capacity");
            entries.remove(&key);
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

//------------ CacheKey ------------------------------------------------------

/// The key a cache entry is stored under.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct CacheKey {
    /// The lookup name in lowercase.
    name: String,

    /// The record type.
    rtype: Rtype,
}

impl CacheKey {
    /// Creates a key, lowercasing the name if necessary.
    fn new(name: &str, rtype: Rtype) -> Self {
        let name = if name.bytes().any(|ch| ch.is_ascii_uppercase()) {
            name.to_ascii_lowercase()
        } else {
            name.into()
        };
        CacheKey { name, rtype }
    }
}

//------------ CacheEntry ----------------------------------------------------

/// A stored answer.
#[derive(Clone, Debug)]
struct CacheEntry {
    /// The records of the answer. Empty for a negative answer.
    records: Vec<Record>,

    /// When the entry stops being served.
    expires_at: Instant,
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::RecordData;
    use std::net::Ipv4Addr;

    fn a_record(name: &str, ttl: u32, addr: [u8; 4]) -> Record {
        Record {
            name: name.into(),
            rtype: Rtype::A,
            ttl,
            data: RecordData::A(Ipv4Addr::from(addr)),
        }
    }

    #[test]
    fn hit_and_miss() {
        let cache = ResourceCache::new(16, 15);
        cache.put(
            "example.com",
            Rtype::A,
            vec![a_record("example.com", 300, [93, 184, 216, 34])],
        );
        let records = cache.get_records("example.com", Rtype::A).unwrap();
        assert_eq!(records.len(), 1);
        assert!(cache.get_records("example.com", Rtype::AAAA).is_none());
        assert!(cache.get_records("other.example", Rtype::A).is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let cache = ResourceCache::new(16, 15);
        cache.put(
            "example.com",
            Rtype::A,
            vec![a_record("example.com", 300, [93, 184, 216, 34])],
        );
        assert!(cache.get_record("Example.COM", Rtype::A).is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn entries_expire_by_min_ttl() {
        let cache = ResourceCache::new(16, 15);
        cache.put(
            "example.com",
            Rtype::A,
            vec![
                a_record("example.com", 60, [93, 184, 216, 34]),
                a_record("example.com", 600, [93, 184, 216, 35]),
            ],
        );
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get_records("example.com", Rtype::A).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get_records("example.com", Rtype::A).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_never_stored() {
        let cache = ResourceCache::new(16, 15);
        cache.put(
            "example.com",
            Rtype::A,
            vec![a_record("example.com", 0, [93, 184, 216, 34])],
        );
        assert!(cache.get_records("example.com", Rtype::A).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn negative_entries_use_the_negative_ttl() {
        let cache = ResourceCache::new(16, 15);
        cache.put("nope.example", Rtype::A, Vec::new());
        assert_eq!(
            cache.get_records("nope.example", Rtype::A).unwrap(),
            Vec::new()
        );
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(cache.get_records("nope.example", Rtype::A).is_none());
    }

    #[test]
    fn put_replaces_prior_entry() {
        let cache = ResourceCache::new(16, 15);
        cache.put(
            "example.com",
            Rtype::A,
            vec![a_record("example.com", 300, [93, 184, 216, 34])],
        );
        cache.put(
            "example.com",
            Rtype::A,
            vec![a_record("example.com", 300, [93, 184, 216, 35])],
        );
        let records = cache.get_records("example.com", Rtype::A).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].data,
            RecordData::A(Ipv4Addr::new(93, 184, 216, 35))
        );
    }

    #[test]
    fn eviction_drops_the_earliest_expiry() {
        let cache = ResourceCache::new(2, 15);
        cache.put(
            "a.example",
            Rtype::A,
            vec![a_record("a.example", 100, [1, 1, 1, 1])],
        );
        cache.put(
            "b.example",
            Rtype::A,
            vec![a_record("b.example", 50, [2, 2, 2, 2])],
        );
        cache.put(
            "c.example",
            Rtype::A,
            vec![a_record("c.example", 200, [3, 3, 3, 3])],
        );
        assert_eq!(cache.len(), 2);
        assert!(cache.get_records("b.example", Rtype::A).is_none());
        assert!(cache.get_records("a.example", Rtype::A).is_some());
        assert!(cache.get_records("c.example", Rtype::A).is_some());
    }
}
