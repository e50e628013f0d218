use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::sync::oneshot;

use super::*;

const WORKER_IDLE_WAIT: Duration = Duration::from_millis(20);

type Callback = Box<dyn FnOnce(AsyncOutcome) + Send + 'static>;

#[derive(Debug)]
pub struct AsyncOutcome {
    pub result: Result<(), AcczipError>,
    pub consumed: usize,
    pub produced: usize,
    pub output: Vec<u8>,
}

/// A self-contained request for [`Session::submit_async`]. Input is owned so
/// the caller is free as soon as the request is queued; output is collected
/// into a buffer of `dst_capacity` bytes.
///
/// Compression requests are complete streams (trailer included) and
/// decompression requests must hold whole streams.
pub struct AsyncRequest {
    pub direction: Direction,
    pub input: Vec<u8>,
    pub dst_capacity: usize,
    callback: Callback,
}

impl AsyncRequest {
    pub fn new(
        direction: Direction,
        input: Vec<u8>,
        dst_capacity: usize,
        callback: impl FnOnce(AsyncOutcome) + Send + 'static,
    ) -> Self {
        Self {
            direction,
            input,
            dst_capacity,
            callback: Box::new(callback),
        }
    }

    pub fn with_reply(
        direction: Direction,
        input: Vec<u8>,
        dst_capacity: usize,
    ) -> (Self, oneshot::Receiver<AsyncOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let request = Self::new(direction, input, dst_capacity, move |outcome| {
            let _ = sender.send(outcome);
        });
        (request, receiver)
    }
}

impl fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("direction", &self.direction)
            .field("input_len", &self.input.len())
            .field("dst_capacity", &self.dst_capacity)
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("async request queue is full")]
pub struct QueueFull(pub AsyncRequest);

impl QueueFull {
    pub fn into_request(self) -> AsyncRequest {
        self.0
    }
}

struct HeldInstance {
    lease: InstanceLease,
    provisioned: Arc<Provisioned>,
}

struct AsyncJob {
    direction: Direction,
    input: Vec<u8>,
    dst_capacity: usize,
    state: RequestState,
    hardware: Option<Arc<HeldInstance>>,
}

struct PendingJob {
    job: Arc<AsyncJob>,
    callback: Callback,
}

struct AsyncShared {
    ring: RequestRing<AsyncRequest>,
    wakeup: Semaphore,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    pool: Option<Arc<InstancePool>>,
    config: SessionConfig,
    software: Mutex<SoftwareStream>,
    counters: Arc<SessionCounters>,
}

pub(crate) struct AsyncControl {
    shared: Arc<AsyncShared>,
    submitter: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl AsyncControl {
    pub fn start(
        pool: Option<Arc<InstancePool>>,
        config: SessionConfig,
        counters: Arc<SessionCounters>,
    ) -> Result<Self, AcczipError> {
        let software = SoftwareStream::new(config.algorithm, config.compression_level)?;
        let shared = Arc::new(AsyncShared {
            ring: RequestRing::new(config.async_queue_depth),
            wakeup: Semaphore::default(),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            pool,
            config,
            software: Mutex::new(software),
            counters,
        });
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();

        // The poll worker exits once the submit worker drops its sender, so
        // it is started first and never leaks if the second spawn fails.
        let poller = thread::Builder::new()
            .name("acczip-async-poll".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || poll_worker(&shared, jobs_rx)
            })?;
        let submitter = thread::Builder::new()
            .name("acczip-async-submit".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || submit_worker(&shared, jobs_tx)
            })?;

        Ok(Self {
            shared,
            submitter: Some(submitter),
            poller: Some(poller),
        })
    }

    pub fn enqueue(&self, request: AsyncRequest) -> Result<(), QueueFull> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(QueueFull(request));
        }
        self.shared.ring.enqueue(request).map_err(QueueFull)?;
        self.shared.wakeup.post();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.post();
        for handle in [self.submitter.take(), self.poller.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("async worker panicked");
            }
        }
    }
}

impl Drop for AsyncControl {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncShared {
    fn context<'a>(
        &'a self,
        direction: Direction,
        hardware: Option<&'a HeldInstance>,
    ) -> RequestContext<'a> {
        RequestContext {
            direction,
            config: &self.config,
            software: &self.software,
            counters: &self.counters,
            hardware: hardware.map(|held| Hardware::new(&held.lease, &held.provisioned)),
        }
    }

    fn hold_instance(
        &self,
        held: &mut Option<Arc<HeldInstance>>,
        direction: Direction,
        len: usize,
    ) -> Option<Arc<HeldInstance>> {
        let config = &self.config;
        if !config.hw_enabled || len == 0 || (config.sw_backup && len < config.min_hw_input) {
            return None;
        }
        let pool = self.pool.as_ref()?;

        if let Some(current) = held.as_ref() {
            let id = current.lease.id();
            let capable = pool
                .capabilities(id)
                .is_some_and(|caps| caps.supports(config.algorithm, direction));
            if pool.is_healthy(id) && capable {
                return Some(Arc::clone(current));
            }
            *held = None;
        }

        let Some(lease) =
            pool.try_acquire(None, config.algorithm, direction, config.req_count_threshold)
        else {
            self.counters.acquire_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let provisioned = match pool.ensure_provisioned(&lease, &config.setup_data()) {
            Ok(provisioned) => provisioned,
            Err(error) => {
                warn!(instance = lease.id().0, %error, "async provisioning failed");
                return None;
            }
        };
        debug!(instance = lease.id().0, "async worker holds instance");
        let instance = Arc::new(HeldInstance { lease, provisioned });
        *held = Some(Arc::clone(&instance));
        Some(instance)
    }

    fn complete(&self, job: &AsyncJob) -> AsyncOutcome {
        let ctx = self.context(job.direction, job.hardware.as_deref());
        let mut output = vec![0_u8; job.dst_capacity];
        let mut checksum = StreamChecksum::new();
        let mut out = OutputCursor::new(&mut output);

        Poller::new(ctx, &job.state, &job.input).run(&mut out, &mut checksum);
        let mut result = job.state.outcome();

        if let Err(error) = &result
            && error.is_accelerator_failure()
            && self.config.sw_backup
            && job.hardware.is_some()
        {
            self.counters
                .fallback_requests
                .fetch_add(1, Ordering::Relaxed);
            warn!(request = job.state.id(), %error, "async request finishing in software");
            let rest = &job.input[out.consumed()..];
            result = run_software(ctx, rest, &mut out, &mut checksum);
        }

        if result.is_ok() {
            result = match job.direction {
                Direction::Compress => {
                    append_trailer(&mut out, &mut checksum, self.config.algorithm)
                }
                Direction::Decompress
                    if out.consumed() != job.input.len() || checksum.total_len() != 0 =>
                {
                    Err(AcczipError::DataCorruption("incomplete compressed stream"))
                }
                Direction::Decompress => Ok(()),
            };
        }

        let consumed = out.consumed();
        let produced = out.produced();
        output.truncate(produced);
        self.counters.record_async(consumed, produced);
        AsyncOutcome {
            result,
            consumed,
            produced,
            output,
        }
    }
}

fn submit_worker(shared: &AsyncShared, jobs: Sender<PendingJob>) {
    let mut held: Option<Arc<HeldInstance>> = None;
    loop {
        let Some(request) = shared.ring.dequeue() else {
            if shared.in_flight.load(Ordering::Acquire) == 0 && held.take().is_some() {
                debug!("async worker released idle instance");
            }
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(error) = shared.wakeup.wait_timeout(WORKER_IDLE_WAIT) {
                error!(%error, "async wakeup failed");
                thread::sleep(WORKER_IDLE_WAIT);
            }
            continue;
        };

        let AsyncRequest {
            direction,
            input,
            dst_capacity,
            callback,
        } = request;
        let hardware = shared.hold_instance(&mut held, direction, input.len());
        let job = Arc::new(AsyncJob {
            direction,
            input,
            dst_capacity,
            state: RequestState::new(),
            hardware,
        });
        if let Err(error) = admission_check(&shared.config, job.hardware.is_some()) {
            job.state.fail(error);
        }

        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let orphan = match jobs.send(PendingJob {
            job: Arc::clone(&job),
            callback,
        }) {
            Ok(()) => None,
            Err(rejected) => Some(rejected.into_inner()),
        };

        let ctx = shared.context(job.direction, job.hardware.as_deref());
        Producer::new(ctx, &job.state, &job.input, job.dst_capacity).run();

        if let Some(pending) = orphan {
            warn!("async poll worker is gone, completing on submit worker");
            finish_job(shared, pending);
        }
    }
    trace!("async submit worker stopped");
}

fn admission_check(config: &SessionConfig, has_hardware: bool) -> Result<(), AcczipError> {
    if !config.hw_enabled && !config.sw_backup {
        return Err(AcczipError::InvalidParams(
            "hardware and software paths are both disabled",
        ));
    }
    if config.hw_enabled && !config.sw_backup && !has_hardware {
        return Err(AcczipError::ResourceUnavailable(
            "no accelerator instance available",
        ));
    }
    Ok(())
}

fn poll_worker(shared: &AsyncShared, jobs: Receiver<PendingJob>) {
    loop {
        match jobs.recv_timeout(WORKER_IDLE_WAIT) {
            Ok(pending) => finish_job(shared, pending),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("async poll worker stopped");
}

fn finish_job(shared: &AsyncShared, pending: PendingJob) {
    let PendingJob { job, callback } = pending;
    let outcome = shared.complete(&job);
    trace!(
        request = job.state.id(),
        consumed = outcome.consumed,
        produced = outcome.produced,
        ok = outcome.result.is_ok(),
        "async request done"
    );
    let id = job.state.id();
    drop(job);
    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        error!(request = id, "async callback panicked");
    }
}

impl SessionCounters {
    fn record_async(&self, consumed: usize, produced: usize) {
        self.async_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(consumed as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(produced as u64, Ordering::Relaxed);
    }
}
