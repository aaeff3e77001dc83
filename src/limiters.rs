use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;
use crate::util::lock_unpoisoned;

const HOST_ENTRY_TTL: Duration = Duration::from_secs(300);
const MAX_HOST_ENTRIES: usize = 1024;

struct HostEntry {
    semaphore: Arc<Semaphore>,
    limit: usize,
    last_used_at: Instant,
}

impl HostEntry {
    fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == self.limit
    }
}

/// Bounds concurrent exchanges per `host:port`. A permit is released when the
/// response body that carries it is dropped.
#[derive(Clone)]
pub(crate) struct HostLimiters {
    limit: usize,
    hosts: Arc<Mutex<BTreeMap<String, HostEntry>>>,
}

impl HostLimiters {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            hosts: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub(crate) async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit, Error> {
        let semaphore = {
            let mut hosts = lock_unpoisoned(&self.hosts);
            let now = Instant::now();
            evict_stale(&mut hosts, now, HOST_ENTRY_TTL, MAX_HOST_ENTRIES);
            let entry = hosts
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| HostEntry {
                    semaphore: Arc::new(Semaphore::new(self.limit)),
                    limit: self.limit,
                    last_used_at: now,
                });
            entry.last_used_at = now;
            Arc::clone(&entry.semaphore)
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::ConcurrencyLimitClosed)
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        lock_unpoisoned(&self.hosts).len()
    }
}

// Entries with permits in use are never evicted, even past the TTL or capacity.
fn evict_stale(
    hosts: &mut BTreeMap<String, HostEntry>,
    now: Instant,
    ttl: Duration,
    max_entries: usize,
) {
    hosts.retain(|_, entry| !entry.is_idle() || now.duration_since(entry.last_used_at) <= ttl);

    while hosts.len() > max_entries {
        let oldest = hosts
            .iter()
            .filter(|(_, entry)| entry.is_idle())
            .min_by_key(|(_, entry)| entry.last_used_at)
            .map(|(host, _)| host.clone());
        let Some(oldest) = oldest else {
            break;
        };
        hosts.remove(&oldest);
    }
}
