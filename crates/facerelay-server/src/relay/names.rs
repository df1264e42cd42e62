//! Translates recognition identities into display names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::directory::Directory;

/// Identity the recognition service reports for a face it does not know
pub const NO_MATCH_IDENTITY: &str = "unknown";

/// Display name published for [`NO_MATCH_IDENTITY`]
pub const NO_MATCH_NAME: &str = "Unknown";

/// Eviction policy for the name cache. With neither bound set the cache grows
/// for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameCachePolicy {
    pub max_entries: Option<usize>,
    pub ttl: Option<Duration>,
}

struct CachedName {
    name: String,
    inserted_at: Instant,
}

#[derive(Default)]
struct NameCache {
    entries: HashMap<String, CachedName>,
}

impl NameCache {
    fn get(&mut self, identity: &str, policy: &NameCachePolicy) -> Option<String> {
        let entry = self.entries.get(identity)?;

        if let Some(ttl) = policy.ttl {
            if entry.inserted_at.elapsed() >= ttl {
                self.entries.remove(identity);
                return None;
            }
        }

        Some(entry.name.clone())
    }

    fn insert(&mut self, identity: String, name: String, policy: &NameCachePolicy) {
        if let Some(max) = policy.max_entries {
            if max == 0 {
                return;
            }
            while self.entries.len() >= max && !self.entries.contains_key(&identity) {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, cached)| cached.inserted_at)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        self.entries.remove(&key);
                    }
                    None => break,
                }
            }
        }

        self.entries.insert(
            identity,
            CachedName {
                name,
                inserted_at: Instant::now(),
            },
        );
    }
}

/// Cached lookup of person names by recognition identity
pub struct PersonNameResolver {
    directory: Arc<dyn Directory>,
    cache: Mutex<NameCache>,
    policy: NameCachePolicy,
}

impl PersonNameResolver {
    pub fn new(directory: Arc<dyn Directory>, policy: NameCachePolicy) -> Self {
        Self {
            directory,
            cache: Mutex::new(NameCache::default()),
            policy,
        }
    }

    /// Resolve an identity to a display name, falling back to the identity itself
    pub async fn resolve(&self, identity: &str) -> String {
        if identity == NO_MATCH_IDENTITY {
            return NO_MATCH_NAME.to_string();
        }

        if let Some(name) = self.lock_cache().get(identity, &self.policy) {
            return name;
        }

        match self.directory.person_name(identity).await {
            Ok(found) => {
                // Misses are cached too, as the identity itself
                let name = found.unwrap_or_else(|| identity.to_string());
                self.lock_cache()
                    .insert(identity.to_string(), name.clone(), &self.policy);
                name
            }
            Err(e) => {
                tracing::warn!("Name lookup failed for {}: {}", identity, e);
                identity.to_string()
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.lock_cache().entries.len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, NameCache> {
        // A panic while holding the lock cannot leave the map half-updated
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
