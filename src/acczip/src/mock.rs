use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOrder {
    Fifo,
    Reverse,
    Shuffled { seed: u64 },
}

/// Behaviour of [`MockAccelerator`]. Every `*_every` knob counts globally
/// across instances, `Some(n)` firing on the n-th, 2n-th, ... event.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub instances: usize,
    pub capabilities: Capabilities,
    pub order: CompletionOrder,
    pub latency_polls: u32,
    pub retry_every: Option<u64>,
    pub reject_every: Option<u64>,
    pub fail_every: Option<u64>,
    pub drop_every: Option<u64>,
    pub fail_setup: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            capabilities: Capabilities::all(),
            order: CompletionOrder::Fifo,
            latency_polls: 0,
            retry_every: None,
            reject_every: None,
            fail_every: None,
            drop_every: None,
            fail_setup: false,
        }
    }
}

#[derive(Debug)]
struct Pending {
    completion: Completion,
    age: u32,
}

#[derive(Debug, Default)]
struct MockInstance {
    stream: Mutex<Option<SoftwareStream>>,
    pending: Mutex<Vec<Pending>>,
}

#[derive(Debug)]
pub struct MockAccelerator {
    config: MockConfig,
    instances: Box<[MockInstance]>,
    in_flight: Mutex<HashSet<SlotTag>>,
    subscribers: Mutex<Vec<Sender<HealthEvent>>>,
    rng: Mutex<u64>,
    delivered: Mutex<Vec<SlotTag>>,
    submits: AtomicU64,
    completions: AtomicU64,
    setups: AtomicU64,
    slot_reuse_violations: AtomicU64,
}

impl MockAccelerator {
    pub fn new(config: MockConfig) -> Self {
        let seed = match config.order {
            CompletionOrder::Shuffled { seed } => seed,
            _ => 0,
        };
        let instances = (0..config.instances)
            .map(|_| MockInstance::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            config,
            instances,
            in_flight: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            rng: Mutex::new(seed),
            delivered: Mutex::new(Vec::new()),
            submits: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            setups: AtomicU64::new(0),
            slot_reuse_violations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn submit_count(&self) -> u64 {
        self.submits.load(Ordering::Relaxed)
    }

    pub fn completion_count(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn setup_count(&self) -> u64 {
        self.setups.load(Ordering::Relaxed)
    }

    pub fn slot_reuse_violations(&self) -> u64 {
        self.slot_reuse_violations.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.instances
            .iter()
            .map(|instance| instance.pending.lock().map(|p| p.len()).unwrap_or(0))
            .sum()
    }

    pub fn delivered(&self) -> Vec<SlotTag> {
        self.delivered
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn inject_event(&self, event: HealthEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|sender| sender.send(event).is_ok());
        }
    }

    fn instance(&self, id: InstanceId) -> Result<&MockInstance, AcczipError> {
        self.instances
            .get(id.0)
            .ok_or(AcczipError::InvalidParams("unknown mock instance"))
    }

    fn run_job(stream: &mut SoftwareStream, job: Job<'_>) -> CompletionOutcome {
        let result = match job.direction {
            Direction::Compress => stream.compress_payload(job.input, job.output),
            Direction::Decompress => stream.inflate_payload(job.algorithm, job.input, job.output),
        };
        match result {
            Ok(progress) => CompletionOutcome::Done {
                consumed: progress.consumed,
                produced: progress.produced,
                crc32: progress.crc32,
            },
            Err(CodecError::OutputTooSmall) => CompletionOutcome::Overflow,
            Err(error) => CompletionOutcome::Failed(error.to_string()),
        }
    }

    fn order_ready(&self, ready: &mut [Pending]) {
        match self.config.order {
            CompletionOrder::Fifo => {}
            CompletionOrder::Reverse => ready.reverse(),
            CompletionOrder::Shuffled { .. } => {
                let Ok(mut state) = self.rng.lock() else {
                    return;
                };
                for index in (1..ready.len()).rev() {
                    *state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    let pick = ((*state >> 33) as usize) % (index + 1);
                    ready.swap(index, pick);
                }
            }
        }
    }
}

fn every(period: Option<u64>, count: u64) -> bool {
    matches!(period, Some(period) if period > 0 && count % period == 0)
}

impl Accelerator for MockAccelerator {
    fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn capabilities(&self, _instance: InstanceId) -> Capabilities {
        self.config.capabilities
    }

    fn setup(&self, instance: InstanceId, setup: &SetupData) -> Result<(), AcczipError> {
        if self.config.fail_setup {
            return Err(AcczipError::ResourceUnavailable("mock setup failure"));
        }
        let target = self.instance(instance)?;
        let stream = SoftwareStream::new(setup.algorithm, setup.level)?;
        *lock(&target.stream)? = Some(stream);
        lock(&target.pending)?.clear();
        lock(&self.in_flight)?.retain(|tag| tag.instance != instance);
        self.setups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn teardown(&self, instance: InstanceId) {
        if let Ok(target) = self.instance(instance) {
            if let Ok(mut stream) = target.stream.lock() {
                *stream = None;
            }
            if let Ok(mut pending) = target.pending.lock() {
                pending.clear();
            }
        }
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|tag| tag.instance != instance);
        }
    }

    fn submit(&self, job: Job<'_>) -> SubmitStatus {
        let count = self.submits.fetch_add(1, Ordering::Relaxed) + 1;
        if every(self.config.retry_every, count) {
            return SubmitStatus::Retry;
        }
        if every(self.config.reject_every, count) {
            return SubmitStatus::Rejected("injected submit rejection".to_string());
        }
        let tag = job.tag;
        let Ok(target) = self.instance(tag.instance) else {
            return SubmitStatus::Rejected("unknown instance".to_string());
        };

        let outcome = {
            let Ok(mut stream) = target.stream.lock() else {
                return SubmitStatus::Rejected("instance state poisoned".to_string());
            };
            let Some(stream) = stream.as_mut() else {
                return SubmitStatus::Rejected("instance not set up".to_string());
            };
            Self::run_job(stream, job)
        };

        let completed = self.completions.fetch_add(1, Ordering::Relaxed) + 1;
        if every(self.config.drop_every, completed) {
            trace!(instance = tag.instance.0, slot = tag.slot.0, "mock dropped completion");
            return SubmitStatus::Accepted;
        }
        let outcome = if every(self.config.fail_every, completed) {
            CompletionOutcome::Failed("injected completion error".to_string())
        } else {
            outcome
        };

        if let Ok(mut in_flight) = self.in_flight.lock()
            && !in_flight.insert(tag)
        {
            self.slot_reuse_violations.fetch_add(1, Ordering::Relaxed);
        }
        match target.pending.lock() {
            Ok(mut pending) => {
                pending.push(Pending {
                    completion: Completion { tag, outcome },
                    age: 0,
                });
                SubmitStatus::Accepted
            }
            Err(_) => SubmitStatus::Rejected("instance state poisoned".to_string()),
        }
    }

    fn poll(&self, instance: InstanceId, out: &mut Vec<Completion>) -> Result<usize, AcczipError> {
        let target = self.instance(instance)?;
        let mut ready = {
            let mut pending = lock(&target.pending)?;
            for entry in pending.iter_mut() {
                entry.age = entry.age.saturating_add(1);
            }
            let latency = self.config.latency_polls;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|entry| entry.age > latency);
            *pending = waiting;
            ready
        };
        if ready.is_empty() {
            return Ok(0);
        }
        self.order_ready(&mut ready);

        let mut in_flight = lock(&self.in_flight)?;
        let mut delivered = lock(&self.delivered)?;
        for entry in ready.iter() {
            in_flight.remove(&entry.completion.tag);
            delivered.push(entry.completion.tag);
        }
        drop(delivered);
        drop(in_flight);

        let count = ready.len();
        out.extend(ready.into_iter().map(|entry| entry.completion));
        Ok(count)
    }

    fn subscribe(&self) -> Option<Receiver<HealthEvent>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().ok()?.push(sender);
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(slot: usize) -> SlotTag {
        SlotTag {
            instance: InstanceId(0),
            slot: SlotId(slot),
        }
    }

    fn setup(mock: &MockAccelerator) {
        mock.setup(
            InstanceId(0),
            &SetupData {
                algorithm: Algorithm::Deflate,
                level: 6,
                chunk_size: 4096,
            },
        )
        .expect("setup should succeed");
    }

    fn submit(
        mock: &MockAccelerator,
        slot: usize,
        input: &[u8],
        output: &mut [u8],
    ) -> SubmitStatus {
        mock.submit(Job {
            tag: tag(slot),
            direction: Direction::Compress,
            algorithm: Algorithm::Deflate,
            input,
            output,
        })
    }

    #[test]
    fn completions_follow_configured_order() {
        let mock = MockAccelerator::new(MockConfig {
            order: CompletionOrder::Reverse,
            ..MockConfig::default()
        });
        setup(&mock);
        let input = vec![3_u8; 1000];
        let mut output = vec![0_u8; 2000];
        for slot in 0..3 {
            assert_eq!(
                submit(&mock, slot, &input, &mut output),
                SubmitStatus::Accepted
            );
        }
        let mut completions = Vec::new();
        let count = mock
            .poll(InstanceId(0), &mut completions)
            .expect("poll should succeed");
        assert_eq!(count, 3);
        let slots = completions.iter().map(|c| c.tag.slot.0).collect::<Vec<_>>();
        assert_eq!(slots, vec![2, 1, 0]);
        assert_eq!(mock.slot_reuse_violations(), 0);
    }

    #[test]
    fn latency_hides_completions_for_some_polls() {
        let mock = MockAccelerator::new(MockConfig {
            latency_polls: 2,
            ..MockConfig::default()
        });
        setup(&mock);
        let input = vec![1_u8; 100];
        let mut output = vec![0_u8; 400];
        submit(&mock, 0, &input, &mut output);

        let mut completions = Vec::new();
        assert_eq!(mock.poll(InstanceId(0), &mut completions).expect("poll"), 0);
        assert_eq!(mock.poll(InstanceId(0), &mut completions).expect("poll"), 0);
        assert_eq!(mock.poll(InstanceId(0), &mut completions).expect("poll"), 1);
        assert!(matches!(
            completions[0].outcome,
            CompletionOutcome::Done { consumed: 100, .. }
        ));
    }

    #[test]
    fn reusing_an_undelivered_slot_is_counted() {
        let mock = MockAccelerator::new(MockConfig::default());
        setup(&mock);
        let input = vec![9_u8; 64];
        let mut output = vec![0_u8; 256];
        submit(&mock, 0, &input, &mut output);
        submit(&mock, 0, &input, &mut output);
        assert_eq!(mock.slot_reuse_violations(), 1);
    }

    #[test]
    fn fault_injection_knobs_fire_periodically() {
        let mock = MockAccelerator::new(MockConfig {
            retry_every: Some(2),
            fail_every: Some(2),
            ..MockConfig::default()
        });
        setup(&mock);
        let input = vec![5_u8; 64];
        let mut output = vec![0_u8; 256];
        assert_eq!(submit(&mock, 0, &input, &mut output), SubmitStatus::Accepted);
        assert_eq!(submit(&mock, 1, &input, &mut output), SubmitStatus::Retry);
        assert_eq!(submit(&mock, 1, &input, &mut output), SubmitStatus::Accepted);

        let mut completions = Vec::new();
        mock.poll(InstanceId(0), &mut completions).expect("poll");
        assert!(matches!(completions[0].outcome, CompletionOutcome::Done { .. }));
        assert!(matches!(completions[1].outcome, CompletionOutcome::Failed(_)));
    }

    #[test]
    fn small_output_reports_overflow() {
        let mock = MockAccelerator::new(MockConfig::default());
        setup(&mock);
        let input = (0..4096_u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect::<Vec<_>>();
        let mut output = vec![0_u8; 32];
        submit(&mock, 0, &input, &mut output);
        let mut completions = Vec::new();
        mock.poll(InstanceId(0), &mut completions).expect("poll");
        assert_eq!(completions[0].outcome, CompletionOutcome::Overflow);
    }

    #[test]
    fn submit_before_setup_is_rejected() {
        let mock = MockAccelerator::new(MockConfig::default());
        let input = [0_u8; 8];
        let mut output = [0_u8; 64];
        assert!(matches!(
            submit(&mock, 0, &input, &mut output),
            SubmitStatus::Rejected(_)
        ));
    }
}
