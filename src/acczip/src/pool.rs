use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::*;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub slots_per_instance: usize,
    pub health_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots_per_instance: 8,
            health_wait: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), AcczipError> {
        if self.slots_per_instance == 0 {
            return Err(AcczipError::InvalidParams(
                "slots_per_instance must be greater than 0",
            ));
        }
        if self.slots_per_instance > MAX_SLOTS_PER_INSTANCE {
            return Err(AcczipError::InvalidParams(
                "slots_per_instance exceeds the supported maximum",
            ));
        }
        if self.health_wait.is_zero() {
            return Err(AcczipError::InvalidParams(
                "health_wait must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct InstanceHealth {
    healthy: AtomicBool,
    generation: AtomicU64,
}

impl InstanceHealth {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Provisioned {
    pub setup: SetupData,
    pub generation: u64,
    pub slots: SlotTable,
}

#[derive(Debug)]
struct InstanceRecord {
    id: InstanceId,
    capabilities: Capabilities,
    busy: AtomicBool,
    provision: Mutex<Option<Arc<Provisioned>>>,
}

pub struct InstancePool {
    backend: Arc<dyn Accelerator>,
    memory: Arc<MemoryTracker>,
    config: PoolConfig,
    instances: Box<[InstanceRecord]>,
    health: Arc<[InstanceHealth]>,
    shutdown: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl InstancePool {
    pub fn start(
        backend: Arc<dyn Accelerator>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, AcczipError> {
        config.validate()?;

        let count = backend.instance_count();
        let instances = (0..count)
            .map(|index| {
                let id = InstanceId(index);
                InstanceRecord {
                    id,
                    capabilities: backend.capabilities(id),
                    busy: AtomicBool::new(false),
                    provision: Mutex::new(None),
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let health: Arc<[InstanceHealth]> = (0..count)
            .map(|_| InstanceHealth::new())
            .collect::<Vec<_>>()
            .into();
        let shutdown = Arc::new(AtomicBool::new(false));

        let watcher = match backend.subscribe() {
            Some(events) => Some(spawn_health_watcher(
                events,
                Arc::clone(&health),
                Arc::clone(&shutdown),
                config.health_wait,
            )?),
            None => None,
        };

        debug!(
            instances = count,
            slots_per_instance = config.slots_per_instance,
            "instance pool started"
        );

        Ok(Arc::new(Self {
            backend,
            memory: MemoryTracker::new(),
            config,
            instances,
            health,
            shutdown,
            watcher,
        }))
    }

    pub fn backend(&self) -> &dyn Accelerator {
        self.backend.as_ref()
    }

    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.health
            .iter()
            .filter(|health| health.healthy.load(Ordering::Acquire))
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|record| record.busy.load(Ordering::Acquire))
            .count()
    }

    pub fn is_healthy(&self, id: InstanceId) -> bool {
        self.health
            .get(id.0)
            .is_some_and(|health| health.healthy.load(Ordering::Acquire))
    }

    pub fn capabilities(&self, id: InstanceId) -> Option<Capabilities> {
        self.instances.get(id.0).map(|record| record.capabilities)
    }

    /// Non-blocking acquire. Scans from `hint`, skipping instances that are
    /// unhealthy, busy or lack the capability, and repeats the scan up to
    /// `retries` more times before giving up.
    pub fn try_acquire(
        self: &Arc<Self>,
        hint: Option<InstanceId>,
        algorithm: Algorithm,
        direction: Direction,
        retries: usize,
    ) -> Option<InstanceLease> {
        let count = self.instances.len();
        if count == 0 {
            return None;
        }
        let start = hint.map(|id| id.0).filter(|&index| index < count).unwrap_or(0);

        for attempt in 0..=retries {
            for offset in 0..count {
                let record = &self.instances[(start + offset) % count];
                if !record.capabilities.supports(algorithm, direction) || !self.is_healthy(record.id)
                {
                    continue;
                }
                if record
                    .busy
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(InstanceLease {
                        pool: Arc::clone(self),
                        id: record.id,
                    });
                }
            }
            if attempt < retries {
                thread::yield_now();
            }
        }
        None
    }

    fn release(&self, id: InstanceId) {
        if let Some(record) = self.instances.get(id.0) {
            record.busy.store(false, Ordering::Release);
        }
    }

    pub(crate) fn ensure_provisioned(
        &self,
        lease: &InstanceLease,
        setup: &SetupData,
    ) -> Result<Arc<Provisioned>, AcczipError> {
        let id = lease.id;
        let record = self
            .instances
            .get(id.0)
            .ok_or(AcczipError::Internal("lease for unknown instance"))?;
        let generation = self
            .health
            .get(id.0)
            .map(|health| health.generation.load(Ordering::Acquire))
            .unwrap_or(0);

        let mut provision = lock(&record.provision)?;
        if let Some(current) = provision.as_ref()
            && current.setup == *setup
            && current.generation == generation
        {
            return Ok(Arc::clone(current));
        }

        if provision.take().is_some() {
            self.backend.teardown(id);
        }
        self.backend.setup(id, setup)?;
        let slots = SlotTable::new(
            &self.memory,
            self.config.slots_per_instance,
            max_block_len(setup.chunk_size),
        )?;
        let provisioned = Arc::new(Provisioned {
            setup: *setup,
            generation,
            slots,
        });
        *provision = Some(Arc::clone(&provisioned));

        debug!(
            instance = id.0,
            algorithm = %setup.algorithm,
            level = setup.level,
            chunk_size = setup.chunk_size,
            "instance provisioned"
        );
        Ok(provisioned)
    }

    pub fn mark_unhealthy(&self, id: InstanceId) {
        if let Some(health) = self.health.get(id.0) {
            health.healthy.store(false, Ordering::Release);
            health.generation.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(record) = self.instances.get(id.0)
            && let Ok(mut provision) = record.provision.lock()
            && provision.take().is_some()
        {
            self.backend.teardown(id);
        }
        warn!(instance = id.0, "instance marked unhealthy");
    }
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("instances", &self.instances.len())
            .field("healthy", &self.healthy_count())
            .field("busy", &self.busy_count())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        for record in self.instances.iter_mut() {
            if let Ok(provision) = record.provision.get_mut()
                && provision.take().is_some()
            {
                self.backend.teardown(record.id);
            }
        }
    }
}

fn spawn_health_watcher(
    events: Receiver<HealthEvent>,
    health: Arc<[InstanceHealth]>,
    shutdown: Arc<AtomicBool>,
    wait: Duration,
) -> Result<JoinHandle<()>, AcczipError> {
    let handle = thread::Builder::new()
        .name("acczip-health".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                match events.recv_timeout(wait) {
                    Ok(event) => apply_health_event(&health, event),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
    Ok(handle)
}

fn apply_health_event(health: &[InstanceHealth], event: HealthEvent) {
    let Some(entry) = health.get(event.instance.0) else {
        warn!(instance = event.instance.0, "health event for unknown instance");
        return;
    };
    match event.kind {
        HealthEventKind::Restarting | HealthEventKind::Fatal => {
            entry.healthy.store(false, Ordering::Release);
            entry.generation.fetch_add(1, Ordering::AcqRel);
            warn!(instance = event.instance.0, kind = ?event.kind, "instance went down");
        }
        HealthEventKind::Restarted => {
            entry.healthy.store(true, Ordering::Release);
            info!(instance = event.instance.0, "instance back in service");
        }
    }
}

pub struct InstanceLease {
    pool: Arc<InstancePool>,
    id: InstanceId,
}

impl InstanceLease {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease").field("id", &self.id).finish()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
