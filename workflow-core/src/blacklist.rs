use crate::types::{BlacklistStatus, BucketPrefix, CacheHitId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime cache of known-forbidden cache sources and buckets.
///
/// Two independent maps, each keyed at a different granularity. Writes are
/// monotonic toward `Bad`: a `Good`/`Untested` entry may be downgraded to
/// `Bad` on the first forbidden response, but `Bad` never becomes `Good`
/// again within the process lifetime. Thread-safe for concurrent readers and
/// writers via `dashmap`, the way `golem-worker-executor` caches component
/// metadata.
pub struct BlacklistCache {
    hits: DashMap<CacheHitId, BlacklistStatus>,
    buckets: DashMap<BucketPrefix, BlacklistStatus>,
    hit_enabled: bool,
    bucket_enabled: bool,
    bad_writes: AtomicU64,
}

impl BlacklistCache {
    pub fn new(hit_enabled: bool, bucket_enabled: bool) -> Self {
        Self {
            hits: DashMap::new(),
            buckets: DashMap::new(),
            hit_enabled,
            bucket_enabled,
            bad_writes: AtomicU64::new(0),
        }
    }

    pub fn hit_status(&self, id: &CacheHitId) -> BlacklistStatus {
        if !self.hit_enabled {
            return BlacklistStatus::Untested;
        }
        self.hits
            .get(id)
            .map(|e| *e)
            .unwrap_or(BlacklistStatus::Untested)
    }

    pub fn bucket_status(&self, prefix: &BucketPrefix) -> BlacklistStatus {
        if !self.bucket_enabled {
            return BlacklistStatus::Untested;
        }
        self.buckets
            .get(prefix)
            .map(|e| *e)
            .unwrap_or(BlacklistStatus::Untested)
    }

    /// Record an observation for a cache hit. `Bad` is sticky; writing `Good`
    /// or `Untested` over an existing `Bad` entry is a no-op.
    pub fn mark_hit(&self, id: CacheHitId, status: BlacklistStatus) {
        self.write_monotonic(&self.hits, id, status);
    }

    pub fn mark_bucket(&self, prefix: BucketPrefix, status: BlacklistStatus) {
        self.write_monotonic(&self.buckets, prefix, status);
    }

    fn write_monotonic<K: std::hash::Hash + Eq>(
        &self,
        map: &DashMap<K, BlacklistStatus>,
        key: K,
        status: BlacklistStatus,
    ) {
        let mut became_bad = false;
        map.entry(key)
            .and_modify(|existing| {
                if *existing != BlacklistStatus::Bad && status == BlacklistStatus::Bad {
                    became_bad = true;
                }
                if *existing != BlacklistStatus::Bad {
                    *existing = status;
                }
            })
            .or_insert_with(|| {
                if status == BlacklistStatus::Bad {
                    became_bad = true;
                }
                status
            });
        if became_bad {
            self.bad_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total number of transitions into `Bad`, for metrics export. Monotonic,
    /// never double-counted within a single transition.
    pub fn bad_write_count(&self) -> u64 {
        self.bad_writes.load(Ordering::Relaxed)
    }
}

impl Default for BlacklistCache {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Derive the bucket/prefix a path lives under. Grounded on object-storage
/// URI conventions (`scheme://bucket/...`); falls back to the path's parent
/// directory for local filesystem paths.
pub fn extract_blacklist_prefix(path: &str) -> BucketPrefix {
    if let Some(scheme_end) = path.find("://") {
        let rest = &path[scheme_end + 3..];
        let bucket = rest.split('/').next().unwrap_or(rest);
        return BucketPrefix(format!("{}://{}", &path[..scheme_end], bucket));
    }
    match path.rfind('/') {
        Some(i) => BucketPrefix(path[..i].to_string()),
        None => BucketPrefix(path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_untested() {
        let cache = BlacklistCache::default();
        assert_eq!(
            cache.hit_status(&CacheHitId("h1".into())),
            BlacklistStatus::Untested
        );
    }

    #[test]
    fn bad_is_sticky() {
        let cache = BlacklistCache::default();
        let id = CacheHitId("h1".into());
        cache.mark_hit(id.clone(), BlacklistStatus::Good);
        assert_eq!(cache.hit_status(&id), BlacklistStatus::Good);
        cache.mark_hit(id.clone(), BlacklistStatus::Bad);
        assert_eq!(cache.hit_status(&id), BlacklistStatus::Bad);
        // Good never overwrites Bad again.
        cache.mark_hit(id.clone(), BlacklistStatus::Good);
        assert_eq!(cache.hit_status(&id), BlacklistStatus::Bad);
    }

    #[test]
    fn bad_write_counted_once() {
        let cache = BlacklistCache::default();
        let id = CacheHitId("h1".into());
        cache.mark_hit(id.clone(), BlacklistStatus::Bad);
        cache.mark_hit(id.clone(), BlacklistStatus::Bad);
        assert_eq!(cache.bad_write_count(), 1);
    }

    #[test]
    fn disabled_lookup_always_untested() {
        let cache = BlacklistCache::new(false, true);
        let id = CacheHitId("h1".into());
        cache.mark_hit(id.clone(), BlacklistStatus::Bad);
        assert_eq!(cache.hit_status(&id), BlacklistStatus::Untested);
    }

    #[test]
    fn prefix_extraction() {
        assert_eq!(
            extract_blacklist_prefix("gs://bad-bucket/path/to/file").0,
            "gs://bad-bucket"
        );
        assert_eq!(
            extract_blacklist_prefix("/local/root/call/out.txt").0,
            "/local/root/call"
        );
    }
}
