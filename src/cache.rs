//! Per-interface cache of live records heard on the network.
//!
//! Every entry carries a TTL schedule: reissue notifications at 80, 85,
//! 90 and 95 percent of the TTL (with a little jitter so queriers across
//! the network do not fire in lockstep) and removal at 100 percent.
//! Resolvers watch the reissue events to refresh records that are about
//! to go stale; everything reading the cache gets clones with the TTL
//! decremented by the time already spent.

use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::{NameKey, RecordKey, ResourceRecord};

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Fraction of the original TTL below which `find` stops returning a
/// record; queriers should be re-asking by then.
pub(crate) const FIND_CUTOFF: f64 = 0.25;
/// Grace period before goodbye and cache-flush victims disappear,
/// letting stragglers of the same record set arrive.
const EXPIRE_GRACE: Duration = Duration::from_secs(1);
/// Records older than this are fair game for a cache flush.
const FLUSH_AGE: Duration = Duration::from_secs(1);

const REISSUE_POINTS: [f64; 4] = [0.80, 0.85, 0.90, 0.95];
/// Jitter added on top of each reissue point.
const REISSUE_JITTER: f64 = 0.02;

#[derive(Debug, Clone)]
pub(crate) enum CacheEvent {
    /// A record is getting close to expiry and is worth re-querying.
    Reissue(ResourceRecord),
    /// A record reached the end of its TTL or was removed.
    Expired(ResourceRecord),
}

#[derive(Clone)]
pub(crate) struct RecordCache {
    shared: Arc<CacheShared>,
}

struct CacheShared {
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<RecordKey, CacheEntry>,
    /// Records grouped by name/type/class, e.g. all the PTR targets of
    /// one service type.
    related: HashMap<NameKey, HashSet<RecordKey>>,
}

struct CacheEntry {
    record: ResourceRecord,
    inserted: Instant,
    /// Reissue and end-of-TTL timers.
    schedule: Vec<JoinHandle<()>>,
    /// Pending 1 s removal from a goodbye or a cache flush.
    pending_expiry: Option<JoinHandle<()>>,
}

impl CacheEntry {
    fn abort_timers(&mut self) {
        for handle in self.schedule.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.pending_expiry.take() {
            handle.abort();
        }
    }
}

#[derive(Clone, Copy)]
enum TimerKind {
    Reissue,
    Expire,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Insert a record, or refresh its timers when it is already known.
    pub fn add(&self, record: &ResourceRecord) {
        if record.ttl == 0 {
            return;
        }
        let key = record.record_key();
        let mut state = self.shared.state.lock().unwrap();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.abort_timers();
            entry.record = record.clone();
            entry.inserted = Instant::now();
            entry.schedule = self.schedule_for(&key, record.ttl);
            return;
        }

        state
            .related
            .entry(record.name_key())
            .or_default()
            .insert(key.clone());
        state.entries.insert(
            key.clone(),
            CacheEntry {
                record: record.clone(),
                inserted: Instant::now(),
                schedule: self.schedule_for(&key, record.ttl),
                pending_expiry: None,
            },
        );
    }

    /// Remove immediately, emitting `Expired`.
    pub fn delete(&self, record: &ResourceRecord) {
        let expired = {
            let mut state = self.shared.state.lock().unwrap();
            remove_entry(&mut state, &record.record_key())
        };
        if let Some(record) = expired {
            let _ = self.shared.events.send(CacheEvent::Expired(record));
        }
    }

    /// Schedule removal after the 1 s grace period. Scheduling twice does
    /// not push the deadline out.
    pub fn set_to_expire(&self, record: &ResourceRecord) {
        let key = record.record_key();
        let mut state = self.shared.state.lock().unwrap();
        self.expire_later(&mut state, &key);
    }

    /// A record arrived with the cache-flush bit: everything sharing its
    /// name/type/class that was inserted more than a second ago goes away
    /// after the grace period.
    pub fn flush_related(&self, record: &ResourceRecord) {
        let mut state = self.shared.state.lock().unwrap();
        let keys: Vec<RecordKey> = state
            .related
            .get(&record.name_key())
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            let old_enough = state
                .entries
                .get(&key)
                .map(|entry| entry.inserted.elapsed() > FLUSH_AGE)
                .unwrap_or(false);
            if old_enough {
                self.expire_later(&mut state, &key);
            }
        }
    }

    /// Cached answers to a question, cloned with their TTL decremented.
    /// Records below `cutoff` of their original TTL are withheld.
    pub fn find(&self, question: &QueryRecord, cutoff: f64) -> Vec<ResourceRecord> {
        let state = self.shared.state.lock().unwrap();
        state
            .entries
            .values()
            .filter(|entry| entry.record.answers(question))
            .filter_map(|entry| clone_with_remaining_ttl(entry, cutoff))
            .collect()
    }

    /// Every record above `cutoff` of its original TTL.
    pub fn get_above_ttl(&self, cutoff: f64) -> Vec<ResourceRecord> {
        let state = self.shared.state.lock().unwrap();
        state
            .entries
            .values()
            .filter_map(|entry| clone_with_remaining_ttl(entry, cutoff))
            .collect()
    }

    pub fn has(&self, record: &ResourceRecord) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.entries.contains_key(&record.record_key())
    }

    /// Cached records that conflict with any of the given ones.
    pub fn conflicting_with(&self, records: &[ResourceRecord]) -> Vec<ResourceRecord> {
        let state = self.shared.state.lock().unwrap();
        let mut out = Vec::new();
        for ours in records {
            if !ours.unique() {
                continue;
            }
            if let Some(keys) = state.related.get(&ours.name_key()) {
                for key in keys {
                    if let Some(entry) = state.entries.get(key) {
                        if entry.record.conflicts_with(ours) {
                            out.push(entry.record.clone());
                        }
                    }
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().unwrap().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.shared.state.lock().unwrap();
        for entry in state.entries.values_mut() {
            entry.abort_timers();
        }
        state.entries.clear();
        state.related.clear();
    }

    fn schedule_for(&self, key: &RecordKey, ttl: u32) -> Vec<JoinHandle<()>> {
        let ttl = Duration::from_secs(ttl as u64);
        let mut rng = rand::thread_rng();
        let mut handles = Vec::with_capacity(REISSUE_POINTS.len() + 1);
        for point in REISSUE_POINTS {
            let jittered = point + rng.gen_range(0.0..REISSUE_JITTER);
            handles.push(self.timer(key.clone(), ttl.mul_f64(jittered), TimerKind::Reissue));
        }
        handles.push(self.timer(key.clone(), ttl, TimerKind::Expire));
        handles
    }

    fn timer(&self, key: RecordKey, delay: Duration, kind: TimerKind) -> JoinHandle<()> {
        let weak: Weak<CacheShared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_timer(&key, kind);
            }
        })
    }

    /// Arm the 1 s expiry for an entry, if not already pending.
    fn expire_later(&self, state: &mut CacheState, key: &RecordKey) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.pending_expiry.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let key = key.clone();
        entry.pending_expiry = Some(tokio::spawn(async move {
            tokio::time::sleep(EXPIRE_GRACE).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_timer(&key, TimerKind::Expire);
            }
        }));
    }
}

impl CacheShared {
    fn on_timer(&self, key: &RecordKey, kind: TimerKind) {
        let event = {
            let mut state = self.state.lock().unwrap();
            match kind {
                TimerKind::Reissue => state
                    .entries
                    .get(key)
                    .map(|entry| CacheEvent::Reissue(entry.record.clone())),
                TimerKind::Expire => remove_entry(&mut state, key).map(CacheEvent::Expired),
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}

fn remove_entry(state: &mut CacheState, key: &RecordKey) -> Option<ResourceRecord> {
    let mut entry = state.entries.remove(key)?;
    entry.abort_timers();
    if let Some(keys) = state.related.get_mut(&key.name) {
        keys.remove(key);
        if keys.is_empty() {
            state.related.remove(&key.name);
        }
    }
    Some(entry.record)
}

fn clone_with_remaining_ttl(entry: &CacheEntry, cutoff: f64) -> Option<ResourceRecord> {
    let original = entry.record.ttl as f64;
    let elapsed = entry.inserted.elapsed().as_secs_f64();
    let remaining = original - elapsed;
    if remaining < cutoff * original {
        return None;
    }
    Some(entry.record.clone().with_ttl(remaining as u32))
}

#[cfg(test)]
mod tests {
    use super::{CacheEvent, RecordCache};
    use dnssd_proto::packet::question::QueryRecord;
    use dnssd_proto::packet::record::ResourceRecord;
    use dnssd_proto::packet::RecordType;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn a_record(ttl: u32) -> ResourceRecord {
        ResourceRecord::a("box.local.", Ipv4Addr::new(10, 0, 0, 1)).with_ttl(ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn should_store_and_find() {
        let cache = RecordCache::new();
        cache.add(&a_record(100));
        assert!(cache.has(&a_record(100)));

        let found = cache.find(&QueryRecord::new("box.local.", RecordType::A), 0.25);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ttl, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn should_decrement_ttl_on_read() {
        let cache = RecordCache::new();
        cache.add(&a_record(100));
        tokio::time::sleep(Duration::from_secs(40)).await;

        let found = cache.find(&QueryRecord::new("box.local.", RecordType::A), 0.25);
        assert_eq!(found.len(), 1);
        assert!(found[0].ttl <= 60);
        assert!(found[0].ttl >= 59);
    }

    #[tokio::test(start_paused = true)]
    async fn should_withhold_records_below_cutoff() {
        let cache = RecordCache::new();
        cache.add(&a_record(100));
        tokio::time::sleep(Duration::from_secs(80)).await;

        let found = cache.find(&QueryRecord::new("box.local.", RecordType::A), 0.25);
        assert!(found.is_empty());
        // still cached, just too stale to answer with
        assert!(cache.has(&a_record(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_reissue_points_then_expire() {
        let cache = RecordCache::new();
        let mut events = cache.subscribe();
        cache.add(&a_record(100));

        // all four reissue points land inside [80%, 97%]
        tokio::time::sleep(Duration::from_secs(98)).await;
        let mut reissues = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CacheEvent::Reissue(record) => {
                    assert_eq!(record.name, "box.local.");
                    reissues += 1;
                }
                CacheEvent::Expired(_) => panic!("expired before the ttl ran out"),
            }
        }
        assert_eq!(reissues, 4);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(events.try_recv(), Ok(CacheEvent::Expired(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_refresh_timers_on_re_add() {
        let cache = RecordCache::new();
        let mut events = cache.subscribe();
        cache.add(&a_record(100));

        tokio::time::sleep(Duration::from_secs(70)).await;
        cache.add(&a_record(100));

        // old schedule is gone; nothing fires before the new 80% point
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn should_expire_after_grace_when_told() {
        let cache = RecordCache::new();
        let mut events = cache.subscribe();
        cache.add(&a_record(100));
        cache.set_to_expire(&a_record(100));
        cache.set_to_expire(&a_record(100));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(events.try_recv(), Ok(CacheEvent::Expired(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_flush_older_related_records() {
        let cache = RecordCache::new();
        let old = ResourceRecord::a("box.local.", Ipv4Addr::new(10, 0, 0, 1));
        let newer = ResourceRecord::a("box.local.", Ipv4Addr::new(10, 0, 0, 2));

        cache.add(&old);
        tokio::time::sleep(Duration::from_secs(5)).await;
        cache.add(&newer);
        cache.flush_related(&newer);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!cache.has(&old));
        assert!(cache.has(&newer));
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_flush_fresh_records() {
        let cache = RecordCache::new();
        let one = ResourceRecord::a("box.local.", Ipv4Addr::new(10, 0, 0, 1));
        let two = ResourceRecord::a("box.local.", Ipv4Addr::new(10, 0, 0, 2));

        cache.add(&one);
        cache.add(&two);
        cache.flush_related(&two);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.has(&one));
        assert!(cache.has(&two));
    }

    #[tokio::test(start_paused = true)]
    async fn should_list_records_above_a_ttl_fraction() {
        let cache = RecordCache::new();
        cache.add(&a_record(100));
        cache.add(
            &ResourceRecord::a("other.local.", Ipv4Addr::new(10, 0, 0, 2)).with_ttl(1000),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        // 40% and 94% remaining respectively
        assert_eq!(cache.get_above_ttl(0.5).len(), 1);
        assert_eq!(cache.get_above_ttl(0.25).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_expired_on_delete() {
        let cache = RecordCache::new();
        let mut events = cache.subscribe();
        cache.add(&a_record(100));
        cache.delete(&a_record(100));
        assert!(matches!(events.try_recv(), Ok(CacheEvent::Expired(_))));
    }
}
