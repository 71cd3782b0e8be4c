//! The bucketed address reservoir: placement, promotion, eviction, biased
//! selection, and the persistence lifecycle.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng, RngCore};
use sha3::{Digest, Sha3_256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, trace, warn};

use crate::address::{unix_now, NetAddress, ServiceFlags};
use crate::error::{Error, Result};
use crate::known::KnownAddress;
use crate::local::{self, AddressPriority, LocalAddress, LocalAddressTable};
use crate::network::Reach;
use crate::store::{
    SerializedAddressBook, SerializedKnownAddress, PEERS_FILENAME, SERIALIZATION_VERSION,
};

/// Number of new buckets in the reservoir.
pub const NEW_BUCKET_COUNT: usize = 1024;

/// Capacity of a single new bucket.
pub const NEW_BUCKET_SIZE: usize = 64;

/// Number of tried buckets in the reservoir.
pub const TRIED_BUCKET_COUNT: usize = 64;

/// Capacity of a single tried bucket.
pub const TRIED_BUCKET_SIZE: usize = 64;

/// Below this many known addresses the book asks for more gossip.
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;

/// New buckets an address group may spread over for a given source group.
const NEW_BUCKETS_PER_GROUP: u64 = 64;

/// Tried buckets an address group may spread over.
const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// Maximum new-bucket slots a single address may occupy.
const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// Share of the index returned by a gossip reply, in percent.
const GET_ADDRESS_PERCENT: usize = 23;

/// Hard cap on the size of a gossip reply.
const GET_ADDRESS_MAX: usize = 2500;

/// Biased-selection attempts before falling back to any occupied slot.
const SELECT_TRIES: usize = 1000;

/// Timestamps further in the future than this are clamped on add.
const FUTURE_CLAMP_SECS: u64 = 10 * 60;

/// Clamped timestamps land this far in the past: stale, but adjustable.
const STALE_STAMP_SECS: u64 = 5 * 24 * 60 * 60;

/// An incoming timestamp newer by more than this refreshes the stored one.
const TIMESTAMP_REFRESH_SECS: u64 = 60 * 60;

/// A stored timestamp older than this always refreshes.
const TIMESTAMP_STALE_SECS: u64 = 24 * 60 * 60;

/// `connected` refreshes the endpoint timestamp at most this often.
const CONNECTED_REFRESH_SECS: u64 = 20 * 60;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const STATE_COLD: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Reservoir geometry and housekeeping cadence. The defaults match the
/// widely deployed discipline; tests shrink the buckets to force the
/// overflow paths.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of new buckets.
    pub new_bucket_count: usize,
    /// Capacity of each new bucket.
    pub new_bucket_size: usize,
    /// Number of tried buckets.
    pub tried_bucket_count: usize,
    /// Capacity of each tried bucket.
    pub tried_bucket_size: usize,
    /// How often the housekeeping task flushes a dirty reservoir.
    pub flush_interval: Duration,
    /// How often the housekeeping task sweeps new buckets and dumps.
    pub dump_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            new_bucket_count: NEW_BUCKET_COUNT,
            new_bucket_size: NEW_BUCKET_SIZE,
            tried_bucket_count: TRIED_BUCKET_COUNT,
            tried_bucket_size: TRIED_BUCKET_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            dump_interval: DEFAULT_DUMP_INTERVAL,
        }
    }
}

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;
type NewBucketFn = Box<dyn Fn(&[u8; 32], &NetAddress, &NetAddress) -> usize + Send + Sync>;
type TriedBucketFn = Box<dyn Fn(&[u8; 32], &NetAddress) -> usize + Send + Sync>;

/// A bounded, bias-resistant reservoir of peer addresses.
///
/// All operations are safe to call concurrently; a single mutex covers the
/// reservoir and the local-address table, and no I/O happens under it.
/// Selection handles ([`KnownAddress`]) stay live after return: callers
/// observe subsequent mutations, and must copy if they want a snapshot.
pub struct AddressBook {
    peers_file: PathBuf,
    inner: Arc<Mutex<Inner>>,
    state: AtomicU8,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    /// Per-instance hash seed; persisted so bucket placement survives
    /// restarts.
    key: [u8; 32],
    index: HashMap<String, Arc<KnownAddress>>,
    new_buckets: Vec<HashMap<String, Arc<KnownAddress>>>,
    tried_buckets: Vec<Vec<Arc<KnownAddress>>>,
    n_new: usize,
    n_tried: usize,
    dirty: bool,
    clock: Clock,
    new_bucket_fn: NewBucketFn,
    tried_bucket_fn: TriedBucketFn,
    local: LocalAddressTable,
}

impl AddressBook {
    /// Creates an address book persisting to `peers.json` inside
    /// `data_dir`. The book is usable immediately; [`AddressBook::start`]
    /// additionally loads the persisted state and begins housekeeping.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_config(data_dir, Config::default())
    }

    /// Creates an address book with explicit reservoir geometry.
    pub fn with_config(data_dir: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            peers_file: data_dir.into().join(PEERS_FILENAME),
            inner: Arc::new(Mutex::new(Inner::new(config))),
            state: AtomicU8::new(STATE_COLD),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Loads persisted addresses and spawns the housekeeping task.
    /// Idempotent; must be called from within a tokio runtime.
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(STATE_COLD, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.load_peers();

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        let (flush_every, dump_every) = {
            let inner = self.inner.lock();
            (inner.config.flush_interval, inner.config.dump_interval)
        };
        let handle = tokio::spawn(housekeeping(
            Arc::clone(&self.inner),
            self.peers_file.clone(),
            flush_every,
            dump_every,
            rx,
        ));
        *self.task.lock() = Some(handle);
        debug!("address book started");
    }

    /// Signals the housekeeping task, waits for it, and flushes a final
    /// snapshot. Idempotent: a second call returns without reissuing work.
    pub async fn stop(&self) -> Result<()> {
        let previous = self.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if previous == STATE_STOPPED {
            return Ok(());
        }

        if previous == STATE_RUNNING {
            if let Some(tx) = self.shutdown.lock().take() {
                let _ = tx.send(true);
            }
            let handle = self.task.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        self.save_peers()?;
        debug!("address book stopped");
        Ok(())
    }

    /// Adds an address heard about through `src`, or refreshes the stored
    /// record. Unroutable addresses are dropped silently.
    pub fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().add_or_update(addr, src);
        Ok(())
    }

    /// Adds a batch of addresses from a single source.
    pub fn add_addresses(&self, addrs: &[NetAddress], src: &NetAddress) -> Result<()> {
        self.ensure_not_stopped()?;
        let mut inner = self.inner.lock();
        for addr in addrs {
            inner.add_or_update(addr, src);
        }
        Ok(())
    }

    /// Marks an address as successfully connected and handshaked,
    /// promoting it into the tried reservoir.
    pub fn good(&self, addr: &NetAddress) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().good(addr)
    }

    /// Records a dial attempt against an address.
    pub fn attempt(&self, addr: &NetAddress) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().attempt(addr)
    }

    /// Records that a connection to the address is live, refreshing its
    /// timestamp at most every 20 minutes to limit persistence churn.
    pub fn connected(&self, addr: &NetAddress) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().connected(addr)
    }

    /// Merges service flags into the stored endpoint. Flags only ever
    /// accumulate; previously returned endpoint values are unaffected.
    pub fn set_services(&self, addr: &NetAddress, services: ServiceFlags) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().set_services(addr, services)
    }

    /// Picks an address to dial next: a biased random draw that favors
    /// tried, recently seen, and rarely failing records. `None` when the
    /// reservoir is empty.
    pub fn select_address(&self) -> Option<Arc<KnownAddress>> {
        self.inner.lock().select_address()
    }

    /// A shuffled sample of shareable addresses for a gossip reply.
    /// `None` when there is nothing worth sharing.
    pub fn address_cache(&self) -> Option<Vec<Arc<NetAddress>>> {
        self.inner.lock().address_cache()
    }

    /// Number of addresses in the reservoir.
    pub fn num_addresses(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether the reservoir wants more gossip.
    pub fn need_more_addresses(&self) -> bool {
        self.num_addresses() < NEED_ADDRESS_THRESHOLD
    }

    /// Registers one of our own endpoints for advertising. Fails with
    /// [`Error::UnroutableAddress`] for private or local endpoints.
    pub fn add_local_address(&self, addr: &NetAddress, priority: AddressPriority) -> Result<()> {
        self.ensure_not_stopped()?;
        self.inner.lock().local.add(Arc::new(addr.clone()), priority)
    }

    /// Whether the endpoint is registered as one of ours.
    pub fn has_local_address(&self, addr: &NetAddress) -> bool {
        self.inner.lock().local.contains(&addr.key())
    }

    /// Snapshot of the registered local endpoints.
    pub fn local_addresses(&self) -> Vec<LocalAddress> {
        self.inner.lock().local.snapshot()
    }

    /// The local endpoint best suited for advertising to `remote`.
    pub fn best_local_address(&self, remote: &NetAddress) -> Arc<NetAddress> {
        self.inner.lock().local.best_for(remote)
    }

    /// Whether `local`, as reported by `remote`, is a plausible external
    /// address for this node, along with the computed reach.
    pub fn is_external_addr_candidate(
        &self,
        local: &NetAddress,
        remote: &NetAddress,
    ) -> (bool, Reach) {
        local::is_external_addr_candidate(local, remote)
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_STOPPED {
            return Err(Error::ManagerStopped);
        }
        Ok(())
    }

    fn load_peers(&self) {
        let loaded = SerializedAddressBook::load(&self.peers_file).and_then(|doc| match doc {
            Some(doc) => self.inner.lock().restore(&doc).map(Some),
            None => Ok(None),
        });
        match loaded {
            Ok(Some(count)) => debug!(count, "loaded peer addresses"),
            Ok(None) => {}
            Err(error) => {
                warn!(%error, path = %self.peers_file.display(), "discarding corrupt peers file");
                if let Err(error) = fs::remove_file(&self.peers_file) {
                    warn!(%error, "failed to remove corrupt peers file");
                }
            }
        }
    }

    fn save_peers(&self) -> Result<()> {
        save_snapshot(&self.inner, &self.peers_file)
    }
}

/// Snapshots the reservoir under the lock and writes it out with the lock
/// released.
fn save_snapshot(inner: &Mutex<Inner>, peers_file: &Path) -> Result<()> {
    let doc = {
        let mut inner = inner.lock();
        inner.dirty = false;
        inner.snapshot()
    };
    if let Err(error) = doc.write_atomic(peers_file) {
        inner.lock().dirty = true;
        return Err(error);
    }
    trace!(count = doc.addresses.len(), "saved peer addresses");
    Ok(())
}

/// Background task: flushes a dirty reservoir on a short cadence and, on a
/// longer one, sweeps every new bucket for expired entries before dumping.
async fn housekeeping(
    inner: Arc<Mutex<Inner>>,
    peers_file: PathBuf,
    flush_every: Duration,
    dump_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut flush = interval_at(start + flush_every, flush_every);
    let mut sweep = interval_at(start + dump_every, dump_every);

    loop {
        tokio::select! {
            _ = flush.tick() => {
                if inner.lock().dirty {
                    if let Err(error) = save_snapshot(&inner, &peers_file) {
                        warn!(%error, "failed to flush peer addresses");
                    }
                }
            }
            _ = sweep.tick() => {
                inner.lock().sweep_expired();
                if let Err(error) = save_snapshot(&inner, &peers_file) {
                    warn!(%error, "failed to dump peer addresses");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

impl Inner {
    fn new(config: Config) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self {
            key,
            index: HashMap::new(),
            new_buckets: vec![HashMap::new(); config.new_bucket_count],
            tried_buckets: vec![Vec::new(); config.tried_bucket_count],
            n_new: 0,
            n_tried: 0,
            dirty: false,
            clock: Box::new(unix_now),
            new_bucket_fn: default_new_bucket_fn(config.new_bucket_count),
            tried_bucket_fn: default_tried_bucket_fn(config.tried_bucket_count),
            local: LocalAddressTable::default(),
            config,
        }
    }

    fn add_or_update(&mut self, addr: &NetAddress, src: &NetAddress) {
        if !addr.is_routable() {
            trace!(addr = %addr, "ignoring unroutable address");
            return;
        }

        let now = (self.clock)();
        let mut addr = addr.clone();
        if addr.timestamp == 0 || addr.timestamp > now + FUTURE_CLAMP_SECS {
            addr.timestamp = now.saturating_sub(STALE_STAMP_SECS);
        }

        let key = addr.key();
        if let Some(ka) = self.index.get(&key).cloned() {
            let stored = ka.net_address();
            let refresh = addr.timestamp > stored.timestamp.saturating_add(TIMESTAMP_REFRESH_SECS)
                || stored.timestamp < now.saturating_sub(TIMESTAMP_STALE_SECS);
            let merged = stored.services | addr.services;
            if merged != stored.services || refresh {
                let mut updated = stored.with_services_added(addr.services);
                if refresh {
                    updated.timestamp = addr.timestamp;
                }
                ka.set_net_address(Arc::new(updated));
                self.dirty = true;
            }

            if ka.is_tried() {
                return;
            }
            let refs = ka.refs();
            if refs >= NEW_BUCKETS_PER_ADDRESS {
                return;
            }
            // The more slots a record occupies, the less likely it gains
            // another: probability 1/2^refs.
            if refs > 0 && thread_rng().gen_range(0..1u32 << refs.min(16)) != 0 {
                return;
            }
            self.place_new(&ka, &key);
        } else {
            let ka = Arc::new(KnownAddress::new(Arc::new(addr), Arc::new(src.clone())));
            self.index.insert(key.clone(), Arc::clone(&ka));
            self.n_new += 1;
            self.dirty = true;
            trace!(%key, "new address");
            self.place_new(&ka, &key);
        }
    }

    fn place_new(&mut self, ka: &Arc<KnownAddress>, key: &str) {
        let na = ka.net_address();
        let bucket =
            (self.new_bucket_fn)(&self.key, &na, ka.src_address()) % self.new_buckets.len();
        if self.new_buckets[bucket].contains_key(key) {
            return;
        }
        if self.new_buckets[bucket].len() >= self.config.new_bucket_size {
            self.expire_new(bucket);
        }
        self.new_buckets[bucket].insert(key.to_string(), Arc::clone(ka));
        ka.incr_refs();
        self.dirty = true;
    }

    /// Removes bad records from the bucket. When nothing is bad and the
    /// bucket is at capacity, the entry with the oldest timestamp is
    /// evicted to make room.
    fn expire_new(&mut self, bucket: usize) {
        let now = (self.clock)();
        let bad: Vec<String> = self.new_buckets[bucket]
            .iter()
            .filter(|(_, ka)| ka.is_bad(now))
            .map(|(key, _)| key.clone())
            .collect();
        if !bad.is_empty() {
            for key in bad {
                trace!(%key, bucket, "expiring bad address");
                self.drop_new_ref(bucket, &key);
            }
            return;
        }

        if self.new_buckets[bucket].len() < self.config.new_bucket_size {
            return;
        }
        let oldest = self.new_buckets[bucket]
            .iter()
            .min_by_key(|(_, ka)| ka.net_address().timestamp)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!(%key, bucket, "new bucket full, evicting oldest entry");
            self.drop_new_ref(bucket, &key);
        }
    }

    fn sweep_expired(&mut self) {
        for bucket in 0..self.new_buckets.len() {
            self.expire_new(bucket);
        }
    }

    fn drop_new_ref(&mut self, bucket: usize, key: &str) {
        if let Some(ka) = self.new_buckets[bucket].remove(key) {
            ka.decr_refs();
            if ka.refs() == 0 && !ka.is_tried() {
                self.index.remove(key);
                self.n_new -= 1;
            }
            self.dirty = true;
        }
    }

    fn good(&mut self, addr: &NetAddress) -> Result<()> {
        let key = addr.key();
        let ka = self
            .index
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::AddressNotFound { key: key.clone() })?;
        if ka.is_tried() {
            return Ok(());
        }
        if ka.refs() == 0 {
            return Err(Error::AddressNotNew { key });
        }

        let now = (self.clock)();
        ka.mark_success(now);

        let na = ka.net_address();
        let bucket = (self.tried_bucket_fn)(&self.key, &na) % self.tried_buckets.len();
        if self.tried_buckets[bucket].len() >= self.config.tried_bucket_size {
            self.evict_tried(bucket);
        }

        // Flip before clearing references so the zero-ref record is not
        // reaped from the index.
        ka.set_tried(true);
        for new_bucket in &mut self.new_buckets {
            if new_bucket.remove(&key).is_some() {
                ka.decr_refs();
            }
        }
        self.n_new -= 1;
        self.n_tried += 1;
        self.tried_buckets[bucket].push(ka);
        self.dirty = true;
        debug!(%key, bucket, "promoted address to tried");
        Ok(())
    }

    /// Evicts the stalest record from a full tried bucket and demotes it
    /// back into its new bucket.
    fn evict_tried(&mut self, bucket: usize) {
        let slot = self.tried_buckets[bucket]
            .iter()
            .enumerate()
            .min_by_key(|(_, ka)| (ka.last_success(), ka.last_attempt()))
            .map(|(slot, _)| slot);
        let Some(slot) = slot else { return };
        let victim = self.tried_buckets[bucket].remove(slot);
        self.n_tried -= 1;

        let key = victim.key();
        victim.set_tried(false);
        let na = victim.net_address();
        let new_bucket =
            (self.new_bucket_fn)(&self.key, &na, victim.src_address()) % self.new_buckets.len();
        if self.new_buckets[new_bucket].len() >= self.config.new_bucket_size {
            self.expire_new(new_bucket);
        }
        if self.new_buckets[new_bucket].len() >= self.config.new_bucket_size {
            debug!(%key, "no room to demote evicted address, dropping");
            self.index.remove(&key);
            self.dirty = true;
            return;
        }
        victim.set_refs(1);
        self.new_buckets[new_bucket].insert(key.clone(), victim);
        self.n_new += 1;
        self.dirty = true;
        debug!(%key, bucket = new_bucket, "demoted tried address back to new");
    }

    fn attempt(&mut self, addr: &NetAddress) -> Result<()> {
        let key = addr.key();
        let ka = self
            .index
            .get(&key)
            .ok_or_else(|| Error::AddressNotFound { key: key.clone() })?;
        ka.mark_attempt((self.clock)());
        self.dirty = true;
        Ok(())
    }

    fn connected(&mut self, addr: &NetAddress) -> Result<()> {
        let key = addr.key();
        let ka = self
            .index
            .get(&key)
            .ok_or_else(|| Error::AddressNotFound { key: key.clone() })?;
        let now = (self.clock)();
        let stored = ka.net_address();
        if stored.timestamp.saturating_add(CONNECTED_REFRESH_SECS) < now {
            let mut updated = (*stored).clone();
            updated.timestamp = now;
            ka.set_net_address(Arc::new(updated));
            self.dirty = true;
        }
        Ok(())
    }

    fn set_services(&mut self, addr: &NetAddress, services: ServiceFlags) -> Result<()> {
        let key = addr.key();
        let ka = self
            .index
            .get(&key)
            .ok_or_else(|| Error::AddressNotFound { key: key.clone() })?;
        let stored = ka.net_address();
        if stored.services | services != stored.services {
            ka.set_net_address(Arc::new(stored.with_services_added(services)));
            self.dirty = true;
        }
        Ok(())
    }

    fn select_address(&self) -> Option<Arc<KnownAddress>> {
        if self.index.is_empty() {
            return None;
        }
        let mut rng = thread_rng();
        let now = (self.clock)();
        let use_tried = self.n_tried > 0 && (self.n_new == 0 || rng.gen::<bool>());

        if use_tried {
            let mut fallback = None;
            for _ in 0..SELECT_TRIES {
                let bucket = &self.tried_buckets[rng.gen_range(0..self.tried_buckets.len())];
                if bucket.is_empty() {
                    continue;
                }
                let ka = &bucket[rng.gen_range(0..bucket.len())];
                let max_chance = bucket.iter().map(|k| k.chance(now)).fold(0.0, f64::max);
                fallback = Some(Arc::clone(ka));
                if max_chance <= 0.0 || rng.gen::<f64>() < ka.chance(now) / max_chance {
                    return Some(Arc::clone(ka));
                }
            }
            fallback.or_else(|| {
                self.tried_buckets
                    .iter()
                    .flat_map(|bucket| bucket.iter())
                    .next()
                    .cloned()
            })
        } else {
            let mut fallback = None;
            for _ in 0..SELECT_TRIES {
                let bucket = &self.new_buckets[rng.gen_range(0..self.new_buckets.len())];
                if bucket.is_empty() {
                    continue;
                }
                let Some(ka) = bucket.values().nth(rng.gen_range(0..bucket.len())) else {
                    continue;
                };
                let max_chance = bucket.values().map(|k| k.chance(now)).fold(0.0, f64::max);
                fallback = Some(Arc::clone(ka));
                if max_chance <= 0.0 || rng.gen::<f64>() < ka.chance(now) / max_chance {
                    return Some(Arc::clone(ka));
                }
            }
            fallback.or_else(|| {
                self.new_buckets
                    .iter()
                    .flat_map(|bucket| bucket.values())
                    .next()
                    .cloned()
            })
        }
    }

    fn address_cache(&self) -> Option<Vec<Arc<NetAddress>>> {
        if self.index.is_empty() {
            return None;
        }
        let now = (self.clock)();
        let mut shareable: Vec<Arc<NetAddress>> = self
            .index
            .values()
            .filter(|ka| !ka.is_bad(now) && (ka.is_tried() || ka.attempts() > 0))
            .map(|ka| ka.net_address())
            .collect();

        let count = (self.index.len() * GET_ADDRESS_PERCENT / 100)
            .min(GET_ADDRESS_MAX)
            .min(shareable.len());
        if count == 0 {
            return None;
        }
        let (picked, _) = shareable.partial_shuffle(&mut thread_rng(), count);
        Some(picked.to_vec())
    }

    fn snapshot(&self) -> SerializedAddressBook {
        let mut new_refs: HashMap<&str, Vec<usize>> = HashMap::new();
        for (bucket, entries) in self.new_buckets.iter().enumerate() {
            for key in entries.keys() {
                new_refs.entry(key.as_str()).or_default().push(bucket);
            }
        }

        let mut addresses: Vec<SerializedKnownAddress> = self
            .index
            .iter()
            .map(|(key, ka)| {
                let na = ka.net_address();
                let src = ka.src_address();
                let mut bucket_refs = new_refs.get(key.as_str()).cloned().unwrap_or_default();
                bucket_refs.sort_unstable();
                SerializedKnownAddress {
                    key: key.clone(),
                    addr_type: na.addr_type,
                    timestamp: na.timestamp,
                    services: na.services.0,
                    src_key: src.key(),
                    src_addr_type: src.addr_type,
                    src_services: src.services.0,
                    last_attempt: ka.last_attempt(),
                    last_success: ka.last_success(),
                    attempts: ka.attempts(),
                    tried: ka.is_tried(),
                    ref_count: ka.refs(),
                    bucket_refs,
                }
            })
            .collect();
        addresses.sort_by(|a, b| a.key.cmp(&b.key));

        let new_buckets = self
            .new_buckets
            .iter()
            .map(|entries| {
                let mut keys: Vec<String> = entries.keys().cloned().collect();
                keys.sort_unstable();
                keys
            })
            .collect();
        let tried_buckets = self
            .tried_buckets
            .iter()
            .map(|entries| entries.iter().map(|ka| ka.key()).collect())
            .collect();

        SerializedAddressBook {
            version: SERIALIZATION_VERSION,
            key: hex::encode(self.key),
            addresses,
            new_buckets,
            tried_buckets,
        }
    }

    /// Rebuilds the reservoir from a persisted document. State is only
    /// replaced once the whole document reconstitutes cleanly.
    fn restore(&mut self, doc: &SerializedAddressBook) -> Result<usize> {
        doc.validate(self.config.new_bucket_count, self.config.tried_bucket_count)?;

        let mut key = [0u8; 32];
        match hex::decode(&doc.key) {
            Ok(bytes) if bytes.len() == 32 => key.copy_from_slice(&bytes),
            _ => {
                debug!("peers file has no usable hash seed, generating a fresh one");
                OsRng.fill_bytes(&mut key);
            }
        }

        let mut index: HashMap<String, Arc<KnownAddress>> = HashMap::new();
        for sa in &doc.addresses {
            let na = NetAddress::from_string(&sa.key, sa.timestamp, ServiceFlags(sa.services))
                .map_err(|e| Error::PersistenceCorrupt {
                    reason: format!("address {}: {e}", sa.key),
                })?;
            if na.addr_type != sa.addr_type || na.key() != sa.key {
                return Err(Error::PersistenceCorrupt {
                    reason: format!("address {} does not round-trip", sa.key),
                });
            }
            let src = NetAddress::from_string(&sa.src_key, 0, ServiceFlags(sa.src_services))
                .map_err(|e| Error::PersistenceCorrupt {
                    reason: format!("source of {}: {e}", sa.key),
                })?;
            if src.addr_type != sa.src_addr_type {
                return Err(Error::PersistenceCorrupt {
                    reason: format!("source of {} does not round-trip", sa.key),
                });
            }
            let ka = KnownAddress::restore(
                Arc::new(na),
                Arc::new(src),
                sa.last_attempt,
                sa.last_success,
                sa.attempts,
                sa.tried,
            );
            index.insert(sa.key.clone(), Arc::new(ka));
        }

        let mut new_buckets: Vec<HashMap<String, Arc<KnownAddress>>> =
            vec![HashMap::new(); self.config.new_bucket_count];
        for (bucket, keys) in doc.new_buckets.iter().enumerate() {
            for k in keys {
                let ka = index.get(k).ok_or_else(|| Error::PersistenceCorrupt {
                    reason: format!("new bucket {bucket} references unknown {k}"),
                })?;
                ka.incr_refs();
                new_buckets[bucket].insert(k.clone(), Arc::clone(ka));
            }
        }

        let mut tried_buckets: Vec<Vec<Arc<KnownAddress>>> =
            vec![Vec::new(); self.config.tried_bucket_count];
        for (bucket, keys) in doc.tried_buckets.iter().enumerate() {
            for k in keys {
                let ka = index.get(k).ok_or_else(|| Error::PersistenceCorrupt {
                    reason: format!("tried bucket {bucket} references unknown {k}"),
                })?;
                tried_buckets[bucket].push(Arc::clone(ka));
            }
        }

        let n_tried = index.values().filter(|ka| ka.is_tried()).count();
        let count = index.len();
        self.key = key;
        self.n_new = count - n_tried;
        self.n_tried = n_tried;
        self.index = index;
        self.new_buckets = new_buckets;
        self.tried_buckets = tried_buckets;
        self.dirty = false;
        Ok(count)
    }
}

fn hash_to_u64(key: &[u8; 32], parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha3_256::new();
    hasher.update(key);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(eight)
}

/// Production new-bucket placement: a keyed double hash over the address
/// group and the source group, so one source can spray an address over at
/// most [`NEW_BUCKETS_PER_GROUP`] buckets.
fn default_new_bucket_fn(bucket_count: usize) -> NewBucketFn {
    Box::new(move |key, addr, src| {
        let addr_group = addr.group_key();
        let src_group = src.group_key();
        let spread = hash_to_u64(key, &[addr_group.as_bytes(), src_group.as_bytes()])
            % NEW_BUCKETS_PER_GROUP;
        let mix = hash_to_u64(key, &[src_group.as_bytes(), &spread.to_le_bytes()]);
        (mix % bucket_count.max(1) as u64) as usize
    })
}

/// Production tried-bucket placement: keyed double hash over the address
/// key and its group.
fn default_tried_bucket_fn(bucket_count: usize) -> TriedBucketFn {
    Box::new(move |key, addr| {
        let spread = hash_to_u64(key, &[addr.key().as_bytes()]) % TRIED_BUCKETS_PER_GROUP;
        let group = addr.group_key();
        let mix = hash_to_u64(key, &[group.as_bytes(), &spread.to_le_bytes()]);
        (mix % bucket_count.max(1) as u64) as usize
    })
}

#[cfg(test)]
impl AddressBook {
    fn set_clock(&self, clock: impl Fn() -> u64 + Send + Sync + 'static) {
        self.inner.lock().clock = Box::new(clock);
    }

    fn set_bucket_fns(
        &self,
        new_fn: impl Fn(&[u8; 32], &NetAddress, &NetAddress) -> usize + Send + Sync + 'static,
        tried_fn: impl Fn(&[u8; 32], &NetAddress) -> usize + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock();
        inner.new_bucket_fn = Box::new(new_fn);
        inner.tried_bucket_fn = Box::new(tried_fn);
    }

    fn new_bucket_contains(&self, bucket: usize, key: &str) -> bool {
        self.inner.lock().new_buckets[bucket].contains_key(key)
    }

    fn tried_bucket_keys(&self, bucket: usize) -> Vec<String> {
        self.inner.lock().tried_buckets[bucket]
            .iter()
            .map(|ka| ka.key())
            .collect()
    }

    /// Walks the whole reservoir and asserts the structural invariants:
    /// tried records sit in exactly one tried slot with zero references,
    /// new records appear in exactly `refs` new-bucket slots, and no
    /// bucket exceeds its capacity.
    fn assert_invariants(&self) {
        let inner = self.inner.lock();
        for (key, ka) in &inner.index {
            let new_slots = inner
                .new_buckets
                .iter()
                .filter(|bucket| bucket.contains_key(key))
                .count();
            let tried_slots = inner
                .tried_buckets
                .iter()
                .map(|bucket| bucket.iter().filter(|k| &k.key() == key).count())
                .sum::<usize>();
            if ka.is_tried() {
                assert_eq!(ka.refs(), 0, "{key}: tried record with references");
                assert_eq!(new_slots, 0, "{key}: tried record in a new bucket");
                assert_eq!(tried_slots, 1, "{key}: tried record not in exactly one slot");
            } else {
                assert!(new_slots >= 1, "{key}: new record in no bucket");
                assert_eq!(ka.refs() as usize, new_slots, "{key}: reference count mismatch");
                assert_eq!(tried_slots, 0, "{key}: new record in a tried bucket");
            }
        }
        for (i, bucket) in inner.new_buckets.iter().enumerate() {
            assert!(bucket.len() <= inner.config.new_bucket_size, "new bucket {i} over capacity");
            for key in bucket.keys() {
                assert!(inner.index.contains_key(key), "new bucket {i} references unknown {key}");
            }
        }
        for (i, bucket) in inner.tried_buckets.iter().enumerate() {
            assert!(bucket.len() <= inner.config.tried_bucket_size, "tried bucket {i} over capacity");
        }
        assert_eq!(inner.n_new + inner.n_tried, inner.index.len(), "population counters drifted");
    }
}
