use crossbeam_channel::Receiver;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotTag {
    pub instance: InstanceId,
    pub slot: SlotId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Compress,
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub deflate: bool,
    pub zlib: bool,
    pub compress: bool,
    pub decompress: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            deflate: true,
            zlib: true,
            compress: true,
            decompress: true,
        }
    }

    pub fn supports(&self, algorithm: Algorithm, direction: Direction) -> bool {
        let algorithm_ok = match algorithm {
            Algorithm::Deflate => self.deflate,
            Algorithm::Zlib => self.zlib,
        };
        let direction_ok = match direction {
            Direction::Compress => self.compress,
            Direction::Decompress => self.decompress,
        };
        algorithm_ok && direction_ok
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupData {
    pub algorithm: Algorithm,
    pub level: u32,
    pub chunk_size: usize,
}

/// One chunk handed to the accelerator. `input`/`output` are only borrowed
/// for the duration of [`Accelerator::submit`]; a backend that finishes
/// later must stage through its own memory.
#[derive(Debug)]
pub struct Job<'a> {
    pub tag: SlotTag,
    pub direction: Direction,
    pub algorithm: Algorithm,
    pub input: &'a [u8],
    pub output: &'a mut [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    Retry,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Done {
        consumed: usize,
        produced: usize,
        crc32: u32,
    },
    Failed(String),
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: SlotTag,
    pub outcome: CompletionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEventKind {
    Restarting,
    Restarted,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvent {
    pub instance: InstanceId,
    pub kind: HealthEventKind,
}

/// Contract between the engine and an accelerator driver.
///
/// `submit` never blocks on completion. Completions are collected later
/// through `poll` on the thread that holds the instance, in any order.
pub trait Accelerator: Send + Sync {
    fn instance_count(&self) -> usize;

    fn capabilities(&self, instance: InstanceId) -> Capabilities;

    fn setup(&self, instance: InstanceId, setup: &SetupData) -> Result<(), AcczipError>;

    fn teardown(&self, _instance: InstanceId) {}

    fn submit(&self, job: Job<'_>) -> SubmitStatus;

    fn poll(&self, instance: InstanceId, out: &mut Vec<Completion>) -> Result<usize, AcczipError>;

    fn subscribe(&self) -> Option<Receiver<HealthEvent>> {
        None
    }
}
