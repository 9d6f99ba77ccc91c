use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backend::{Error, FunctionSpec, MetadataStore, Result, Vm, VmBackend, VmState};
use serde::Deserialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, interval, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::singleflight::Singleflight;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Warm VMs unused longer than this are stopped by the janitor.
    pub idle_ttl_s: u64,
    /// Janitor wake interval.
    pub cleanup_interval_s: u64,
    /// Idle-VM ping interval.
    pub health_check_interval_s: u64,
    /// Pre-warmer wake interval.
    pub pre_warm_interval_s: u64,
    /// Concurrent pre-warm creations.
    pub max_pre_warm_workers: usize,
    /// Total live VMs across all functions; 0 means unlimited.
    pub max_global_vms: usize,
    /// How long an acquire may wait on capacity or a cold start.
    pub acquire_timeout_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_s: 300,
            cleanup_interval_s: 30,
            health_check_interval_s: 60,
            pre_warm_interval_s: 30,
            max_pre_warm_workers: 4,
            max_global_vms: 0,
            acquire_timeout_s: 30,
        }
    }
}

/// Invoked after the first successful cold start for a function, while the
/// fresh VM is still warm (pause → snapshot → resume happens inside).
#[async_trait]
pub trait SnapshotHook: Send + Sync {
    async fn snapshot(&self, vm: &Vm, f: &FunctionSpec) -> Result<()>;
}

/// A VM leased out of the pool. Must be given back exactly once with
/// [`VmPool::release`].
#[derive(Debug)]
pub struct PooledVm {
    pub vm: Arc<Vm>,
    fn_id: String,
    code_hash: String,
}

impl PooledVm {
    pub fn function_id(&self) -> &str {
        &self.fn_id
    }
}

struct WarmVm {
    vm: Arc<Vm>,
    code_hash: String,
}

#[derive(Default)]
struct BucketState {
    /// Warm VMs, most recently released at the front.
    warm: VecDeque<WarmVm>,
    /// VMs currently leased to executors.
    leased: usize,
    /// A cold start is in flight.
    creating: bool,
    /// The snapshot hook already ran for the current code version.
    snapshot_taken: bool,
}

impl BucketState {
    fn live(&self) -> usize {
        self.warm.len() + self.leased + usize::from(self.creating)
    }
}

/// One function's pool entry. The state mutex is the per-function lock
/// serializing acquire/release/evict transitions; critical sections never
/// block, so a plain mutex suffices.
#[derive(Default)]
struct Bucket {
    state: StdMutex<BucketState>,
    /// Pinged when this function's capacity may have changed.
    freed: Notify,
}

/// Keeps `creating` accurate even when a cold start's future is dropped
/// mid-flight (caller cancellation).
struct CreatingGuard<'a> {
    bucket: &'a Bucket,
    armed: bool,
}

impl<'a> CreatingGuard<'a> {
    fn arm(bucket: &'a Bucket) -> Self {
        lock(&bucket.state).creating = true;
        Self {
            bucket,
            armed: true,
        }
    }

    /// Success: the created VM transitions straight to leased, in the same
    /// critical section that clears `creating`.
    fn finish_leased(mut self) {
        let mut st = lock(&self.bucket.state);
        st.creating = false;
        st.leased += 1;
        drop(st);
        self.armed = false;
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.bucket.state).creating = false;
            self.bucket.freed.notify_waiters();
        }
    }
}

type CreateResult = std::result::Result<Arc<Vm>, Arc<Error>>;

/// Per-function warm VM pool over a [`VmBackend`].
///
/// Embedders wire crash events to [`purge`](Self::purge) (the backend's
/// supervisor emits them) and start the background loops with
/// [`spawn_maintenance`](Self::spawn_maintenance).
pub struct VmPool {
    backend: Arc<dyn VmBackend>,
    config: PoolConfig,
    buckets: StdMutex<HashMap<String, Arc<Bucket>>>,
    flights: Singleflight<CreateResult>,
    global: Option<Arc<Semaphore>>,
    /// Global-cap permits pinned to VM lifetime, keyed by VM id.
    permits: StdMutex<HashMap<String, OwnedSemaphorePermit>>,
    /// Pinged whenever any VM is released or stopped.
    released: Notify,
    snapshot_hook: StdMutex<Option<Arc<dyn SnapshotHook>>>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl VmPool {
    pub fn new(backend: Arc<dyn VmBackend>, config: PoolConfig) -> Arc<Self> {
        let global = match config.max_global_vms {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Arc::new(Self {
            backend,
            config,
            buckets: StdMutex::new(HashMap::new()),
            flights: Singleflight::new(),
            global,
            permits: StdMutex::new(HashMap::new()),
            released: Notify::new(),
            snapshot_hook: StdMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_snapshot_hook(&self, hook: Arc<dyn SnapshotHook>) {
        *lock(&self.snapshot_hook) = Some(hook);
    }

    fn bucket(&self, fn_id: &str) -> Arc<Bucket> {
        Arc::clone(lock(&self.buckets).entry(fn_id.to_string()).or_default())
    }

    fn get_bucket(&self, fn_id: &str) -> Option<Arc<Bucket>> {
        lock(&self.buckets).get(fn_id).map(Arc::clone)
    }

    fn buckets_snapshot(&self) -> Vec<(String, Arc<Bucket>)> {
        lock(&self.buckets)
            .iter()
            .map(|(id, b)| (id.clone(), Arc::clone(b)))
            .collect()
    }

    // -- acquire / release --

    /// Get a VM for `f`, warm when possible, cold-started otherwise.
    ///
    /// Warm reuse requires a matching `code_hash`; warm VMs from older code
    /// are retired on the spot. Waits on per-function and global capacity
    /// up to the configured deadline.
    pub async fn acquire(self: &Arc<Self>, f: &FunctionSpec, code: &[u8]) -> Result<PooledVm> {
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_timeout_s);

        loop {
            if Instant::now() >= deadline {
                return Err(Error::CapacityExhausted(format!(
                    "acquire deadline elapsed for {}",
                    f.name
                )));
            }

            let bucket = self.bucket(&f.id);
            enum Next {
                Leased(PooledVm),
                Wait,
                Create,
            }

            let mut stale = Vec::new();
            let next = {
                let mut st = lock(&bucket.state);
                if let Some(pos) = st.warm.iter().position(|w| w.code_hash == f.code_hash) {
                    match st.warm.remove(pos) {
                        Some(warm) => {
                            st.leased += 1;
                            Next::Leased(PooledVm {
                                vm: warm.vm,
                                fn_id: f.id.clone(),
                                code_hash: warm.code_hash,
                            })
                        }
                        None => Next::Create,
                    }
                } else {
                    // No match means every warm VM carries an older code
                    // version; none may be reused.
                    stale.extend(st.warm.drain(..));
                    if f.max_replicas > 0 && st.live() >= f.max_replicas as usize {
                        Next::Wait
                    } else {
                        Next::Create
                    }
                }
            };

            for old in stale {
                debug!(id = %old.vm.id, function = %f.name, "retiring warm vm with stale code");
                self.retire(&f.id, old.vm).await;
            }

            match next {
                Next::Leased(lease) => {
                    lease.vm.touch();
                    return Ok(lease);
                }
                Next::Wait => {
                    // Bounded wait: a notification registered after the
                    // capacity check could otherwise be missed, so the
                    // state is re-checked at least every 100 ms.
                    let wait_until = deadline.min(Instant::now() + Duration::from_millis(100));
                    let _ = timeout_at(wait_until, bucket.freed.notified()).await;
                }
                Next::Create => match self.create_via_flight(f, code, deadline).await? {
                    Some(lease) => return Ok(lease),
                    // Waiter on someone else's cold start: proceed as a
                    // normal acquirer.
                    None => {}
                },
            }
        }
    }

    /// Return a leased VM. Healthy VMs go back to the head of the warm
    /// list with `last_used` refreshed; unhealthy ones are stopped.
    pub async fn release(self: &Arc<Self>, lease: PooledVm, healthy: bool) {
        let bucket = self.bucket(&lease.fn_id);
        let healthy = healthy && lease.vm.state() == VmState::Running;

        {
            let mut st = lock(&bucket.state);
            st.leased = st.leased.saturating_sub(1);
            if healthy {
                lease.vm.touch();
                st.warm.push_front(WarmVm {
                    vm: Arc::clone(&lease.vm),
                    code_hash: lease.code_hash.clone(),
                });
            }
        }

        if healthy {
            bucket.freed.notify_waiters();
            self.released.notify_waiters();
        } else {
            info!(id = %lease.vm.id, "released unhealthy, stopping");
            self.retire(&lease.fn_id, lease.vm).await;
        }
    }

    /// Stop all warm VMs for a function (function update or delete) and
    /// re-arm the snapshot hook.
    pub async fn evict(self: &Arc<Self>, fn_id: &str) {
        let Some(bucket) = self.get_bucket(fn_id) else {
            return;
        };
        let drained: Vec<WarmVm> = {
            let mut st = lock(&bucket.state);
            st.snapshot_taken = false;
            st.warm.drain(..).collect()
        };
        info!(function_id = %fn_id, count = drained.len(), "evicting warm vms");
        for w in drained {
            self.retire(fn_id, w.vm).await;
        }
    }

    /// Drop a VM that disappeared underneath the pool (backend crash
    /// event). Frees its global-cap permit and wakes capacity waiters.
    pub async fn purge(self: &Arc<Self>, vm_id: &str) {
        for (_, bucket) in self.buckets_snapshot() {
            let found = {
                let mut st = lock(&bucket.state);
                match st.warm.iter().position(|w| w.vm.id == vm_id) {
                    Some(pos) => {
                        st.warm.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                lock(&self.permits).remove(vm_id);
                bucket.freed.notify_waiters();
                self.released.notify_waiters();
                debug!(id = %vm_id, "purged crashed vm from pool");
                return;
            }
        }
        // Not warm — it was leased or mid-create; still release its permit.
        lock(&self.permits).remove(vm_id);
        self.released.notify_waiters();
    }

    pub fn warm_count(&self, fn_id: &str) -> usize {
        match self.get_bucket(fn_id) {
            Some(bucket) => lock(&bucket.state).warm.len(),
            None => 0,
        }
    }

    pub fn total_live(&self) -> usize {
        self.buckets_snapshot()
            .iter()
            .map(|(_, bucket)| lock(&bucket.state).live())
            .sum()
    }

    // -- cold start --

    async fn create_via_flight(
        self: &Arc<Self>,
        f: &FunctionSpec,
        code: &[u8],
        deadline: Instant,
    ) -> Result<Option<PooledVm>> {
        let pool = Arc::clone(self);
        let f_owned = f.clone();
        let code_owned = code.to_vec();

        let work = move || async move {
            let bucket = pool.bucket(&f_owned.id);
            let guard = CreatingGuard::arm(&bucket);
            let result = pool
                .create_one(&f_owned, &code_owned, deadline)
                .await
                .map_err(Arc::new);
            match &result {
                Ok(_) => guard.finish_leased(),
                Err(_) => drop(guard),
            }
            result
        };

        let (result, led) = self.flights.run(&f.id, work).await;
        match result {
            Ok(vm) if led => {
                self.maybe_snapshot(&vm, f).await;
                Ok(Some(PooledVm {
                    vm,
                    fn_id: f.id.clone(),
                    code_hash: f.code_hash.clone(),
                }))
            }
            Ok(_) => Ok(None),
            // Waiters see the leader's error verbatim.
            Err(shared) => Err(Error::Shared(shared)),
        }
    }

    async fn create_one(
        self: &Arc<Self>,
        f: &FunctionSpec,
        code: &[u8],
        deadline: Instant,
    ) -> Result<Arc<Vm>> {
        let permit = self.global_slot(deadline).await?;
        let vm = self.backend.create_vm(f, code).await?;
        if let Some(permit) = permit {
            lock(&self.permits).insert(vm.id.clone(), permit);
        }
        Ok(vm)
    }

    /// Claim a global-cap slot, retiring the longest-idle warm VM when the
    /// host is full. The permit stays pinned until the VM stops.
    async fn global_slot(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(sem) = self.global.clone() else {
            return Ok(None);
        };

        loop {
            if let Ok(permit) = Arc::clone(&sem).try_acquire_owned() {
                return Ok(Some(permit));
            }

            if self.scavenge_idle().await {
                continue;
            }

            if Instant::now() >= deadline {
                return Err(Error::CapacityExhausted(format!(
                    "global vm capacity ({}) reached",
                    self.config.max_global_vms
                )));
            }

            // Nothing idle to retire; wait for a stop or a release (which
            // may create something scavengeable). Bounded so a
            // notification racing the checks above is never missed for
            // longer than 100 ms.
            let wait_until = deadline.min(Instant::now() + Duration::from_millis(100));
            tokio::select! {
                permit = Arc::clone(&sem).acquire_owned() => {
                    match permit {
                        Ok(permit) => return Ok(Some(permit)),
                        Err(_) => {
                            return Err(Error::CapacityExhausted("vm capacity closed".into()));
                        }
                    }
                }
                _ = self.released.notified() => {}
                _ = sleep_until(wait_until) => {}
            }
        }
    }

    /// Stop the longest-idle warm VM anywhere, freeing its permit.
    async fn scavenge_idle(self: &Arc<Self>) -> bool {
        let mut best: Option<(String, Arc<Bucket>, u64)> = None;
        for (fn_id, bucket) in self.buckets_snapshot() {
            let oldest = lock(&bucket.state)
                .warm
                .iter()
                .map(|w| w.vm.last_used_ms())
                .min();
            if let Some(oldest) = oldest
                && best.as_ref().is_none_or(|(_, _, t)| oldest < *t)
            {
                best = Some((fn_id.clone(), Arc::clone(&bucket), oldest));
            }
        }

        let Some((fn_id, bucket, _)) = best else {
            return false;
        };
        let victim = {
            let mut st = lock(&bucket.state);
            let pos = st
                .warm
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.vm.last_used_ms())
                .map(|(i, _)| i);
            pos.and_then(|i| st.warm.remove(i))
        };
        match victim {
            Some(w) => {
                debug!(id = %w.vm.id, function_id = %fn_id, "scavenging idle vm for capacity");
                self.retire(&fn_id, w.vm).await;
                true
            }
            None => false,
        }
    }

    /// Stop a VM the pool no longer wants and free everything pinned to it.
    async fn retire(&self, fn_id: &str, vm: Arc<Vm>) {
        if let Err(e) = self.backend.stop_vm(&vm.id).await {
            warn!(id = %vm.id, error = %e, "stop failed");
        }
        lock(&self.permits).remove(&vm.id);
        if let Some(bucket) = self.get_bucket(fn_id) {
            bucket.freed.notify_waiters();
        }
        self.released.notify_waiters();
    }

    async fn maybe_snapshot(&self, vm: &Arc<Vm>, f: &FunctionSpec) {
        let hook = lock(&self.snapshot_hook).clone();
        let Some(hook) = hook else {
            return;
        };
        let bucket = self.bucket(&f.id);
        {
            let mut st = lock(&bucket.state);
            if st.snapshot_taken {
                return;
            }
            st.snapshot_taken = true;
        }
        if let Err(e) = hook.snapshot(vm, f).await {
            warn!(function = %f.name, error = %e, "snapshot hook failed");
            // Re-arm so the next cold start tries again.
            lock(&bucket.state).snapshot_taken = false;
        }
    }

    // -- maintenance --

    /// Start the janitor, health checker, and (with a store) the
    /// pre-warmer. They run until [`shutdown`](Self::shutdown).
    pub fn spawn_maintenance(self: &Arc<Self>, store: Option<Arc<dyn MetadataStore>>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(pool.config.cleanup_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = tick.tick() => pool.sweep_idle().await,
                }
            }
        });

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                interval(Duration::from_secs(pool.config.health_check_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = tick.tick() => pool.health_check_once().await,
                }
            }
        });

        if let Some(store) = store {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick =
                    interval(Duration::from_secs(pool.config.pre_warm_interval_s.max(1)));
                loop {
                    tokio::select! {
                        _ = pool.cancel.cancelled() => break,
                        _ = tick.tick() => pool.pre_warm_once(&store).await,
                    }
                }
            });
        }
    }

    /// One janitor pass: stop warm VMs idle beyond the TTL.
    pub async fn sweep_idle(self: &Arc<Self>) {
        let ttl = Duration::from_secs(self.config.idle_ttl_s);
        for (fn_id, bucket) in self.buckets_snapshot() {
            let expired: Vec<WarmVm> = {
                let mut st = lock(&bucket.state);
                let (kept, expired) = st.warm.drain(..).fold(
                    (VecDeque::new(), Vec::new()),
                    |(mut kept, mut expired), w| {
                        if w.vm.idle_for() > ttl {
                            expired.push(w);
                        } else {
                            kept.push_back(w);
                        }
                        (kept, expired)
                    },
                );
                st.warm = kept;
                expired
            };
            for w in expired {
                info!(id = %w.vm.id, function_id = %fn_id, "stopping idle vm");
                self.retire(&fn_id, w.vm).await;
            }
        }
    }

    /// One health pass: ping idle VMs, retire the unresponsive.
    pub async fn health_check_once(self: &Arc<Self>) {
        for (fn_id, bucket) in self.buckets_snapshot() {
            let idle: Vec<Arc<Vm>> = lock(&bucket.state)
                .warm
                .iter()
                .map(|w| Arc::clone(&w.vm))
                .collect();
            for vm in idle {
                let healthy = match self.backend.new_client(&vm) {
                    Ok(client) => client.ping().await.is_ok(),
                    Err(_) => false,
                };
                if healthy {
                    continue;
                }
                warn!(id = %vm.id, function_id = %fn_id, "idle vm failed ping, retiring");
                let removed = {
                    let mut st = lock(&bucket.state);
                    match st.warm.iter().position(|w| w.vm.id == vm.id) {
                        Some(pos) => st.warm.remove(pos),
                        None => None,
                    }
                };
                if let Some(w) = removed {
                    self.retire(&fn_id, w.vm).await;
                }
            }
        }
    }

    /// One pre-warm pass: bring every function with `min_replicas > 0` up
    /// to its floor, bounded by the worker budget and capacity caps.
    pub async fn pre_warm_once(self: &Arc<Self>, store: &Arc<dyn MetadataStore>) {
        let functions = match store.list_functions().await {
            Ok(functions) => functions,
            Err(e) => {
                warn!(error = %e, "pre-warm: listing functions failed");
                return;
            }
        };

        let workers = Arc::new(Semaphore::new(self.config.max_pre_warm_workers.max(1)));
        let mut set = JoinSet::new();
        for f in functions.into_iter().filter(|f| f.min_replicas > 0) {
            let pool = Arc::clone(self);
            let store = Arc::clone(store);
            let workers = Arc::clone(&workers);
            set.spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return;
                };
                pool.ensure_min_warm(&f, &store).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    async fn ensure_min_warm(self: &Arc<Self>, f: &FunctionSpec, store: &Arc<dyn MetadataStore>) {
        let mut code = None;
        loop {
            let bucket = self.bucket(&f.id);
            let (warm_now, live) = {
                let st = lock(&bucket.state);
                let matching = st
                    .warm
                    .iter()
                    .filter(|w| w.code_hash == f.code_hash)
                    .count();
                (matching, st.live())
            };
            if warm_now >= f.min_replicas as usize {
                return;
            }
            if f.max_replicas > 0 && live >= f.max_replicas as usize {
                return;
            }

            // Pre-warming never evicts others to make room.
            let permit = match &self.global {
                Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            if code.is_none() {
                match store.get_function_code(&f.id).await {
                    Ok(c) => code = Some(c),
                    Err(e) => {
                        warn!(function = %f.name, error = %e, "pre-warm: code fetch failed");
                        return;
                    }
                }
            }
            let Some(ref code_ref) = code else { return };

            match self.backend.create_vm(f, code_ref.payload()).await {
                Ok(vm) => {
                    if let Some(permit) = permit {
                        lock(&self.permits).insert(vm.id.clone(), permit);
                    }
                    vm.touch();
                    debug!(id = %vm.id, function = %f.name, "pre-warmed vm");
                    lock(&bucket.state).warm.push_front(WarmVm {
                        vm,
                        code_hash: f.code_hash.clone(),
                    });
                    bucket.freed.notify_waiters();
                }
                Err(e) => {
                    warn!(function = %f.name, error = %e, "pre-warm create failed");
                    return;
                }
            }
        }
    }

    /// Stop background loops and every warm VM. Leased VMs are the
    /// executors' to release; the backend's own shutdown stops stragglers.
    pub async fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();
        for (fn_id, bucket) in self.buckets_snapshot() {
            let drained: Vec<WarmVm> = lock(&bucket.state).warm.drain(..).collect();
            for w in drained {
                self.retire(&fn_id, w.vm).await;
            }
        }
        info!("vm pool shutdown complete");
    }
}
