use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use acczip_codec::{
    BlockHeader, BlockKind, CodecError, SoftwareStream, StreamChecksum, max_block_len,
    max_payload_len,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

mod async_queue;
mod backend;
mod memory;
mod mock;
mod pipeline;
mod pool;
mod ring;
mod session;
mod slot;

pub use acczip_codec::{
    Algorithm, BLOCK_HEADER_LEN, MAX_LEVEL, MIN_LEVEL, decode_stream_on_cpu, encode_stream_on_cpu,
};
pub use async_queue::{AsyncOutcome, AsyncRequest, QueueFull};
pub use backend::{
    Accelerator, Capabilities, Completion, CompletionOutcome, Direction, HealthEvent,
    HealthEventKind, InstanceId, Job, SetupData, SlotId, SlotTag, SubmitStatus,
};
pub use memory::{MemoryKind, MemoryTracker, PinnedBuf};
pub use mock::{CompletionOrder, MockAccelerator, MockConfig};
pub use pool::{InstanceLease, InstancePool, PoolConfig};
pub use session::{Session, SessionStats, StreamStats};
pub use slot::SlotState;

use async_queue::AsyncControl;
use pipeline::{
    Hardware, OutputCursor, Poller, Producer, RequestContext, RequestState, append_trailer,
    run_request, run_software,
};
use pool::Provisioned;
use ring::{RequestRing, Semaphore};
use session::SessionCounters;
use slot::{Slot, SlotBuffers, SlotMeta, SlotTable};

pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_SLOTS_PER_INSTANCE: usize = 256;
pub const MAX_ASYNC_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    Busy,
    Periodic,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: usize,
    pub compression_level: u32,
    pub algorithm: Algorithm,
    pub polling_mode: PollingMode,
    pub sw_backup: bool,
    pub hw_enabled: bool,
    pub req_count_threshold: usize,
    pub submit_retries: usize,
    pub submit_backoff: Duration,
    pub poll_backoff: Duration,
    /// Longest a request may wait without any completion before the
    /// instance is declared dead.
    pub poll_timeout: Duration,
    pub slot_wait_timeout: Duration,
    pub min_hw_input: usize,
    pub hw_skip_after_miss: usize,
    pub inline_chunk_limit: usize,
    /// Capacity of the asynchronous request ring; 0 disables it.
    pub async_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_level: 6,
            algorithm: Algorithm::Deflate,
            polling_mode: PollingMode::Periodic,
            sw_backup: true,
            hw_enabled: true,
            req_count_threshold: 4,
            submit_retries: 3,
            submit_backoff: Duration::from_micros(50),
            poll_backoff: Duration::from_micros(20),
            poll_timeout: Duration::from_secs(2),
            slot_wait_timeout: Duration::from_millis(100),
            min_hw_input: 512,
            hw_skip_after_miss: 2,
            inline_chunk_limit: 4,
            async_queue_depth: 32,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, AcczipError> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    pub fn overlay_env(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AcczipError> {
        if let Some(value) = var("ACCZIP_CHUNK_SIZE") {
            self.chunk_size = parse_size(&value)
                .ok_or(AcczipError::InvalidParams("ACCZIP_CHUNK_SIZE is not a size"))?;
        }
        if let Some(value) = var("ACCZIP_LEVEL") {
            self.compression_level = value
                .trim()
                .parse()
                .map_err(|_| AcczipError::InvalidParams("ACCZIP_LEVEL is not a number"))?;
        }
        if let Some(value) = var("ACCZIP_ALGORITHM") {
            self.algorithm = value.parse()?;
        }
        if let Some(value) = var("ACCZIP_POLLING") {
            self.polling_mode = match value.trim().to_ascii_lowercase().as_str() {
                "busy" => PollingMode::Busy,
                "periodic" => PollingMode::Periodic,
                _ => {
                    return Err(AcczipError::InvalidParams(
                        "ACCZIP_POLLING must be busy or periodic",
                    ));
                }
            };
        }
        if let Some(value) = var("ACCZIP_SW_BACKUP") {
            self.sw_backup = parse_flag(&value)
                .ok_or(AcczipError::InvalidParams("ACCZIP_SW_BACKUP is not a flag"))?;
        }
        if let Some(value) = var("ACCZIP_HW") {
            self.hw_enabled =
                parse_flag(&value).ok_or(AcczipError::InvalidParams("ACCZIP_HW is not a flag"))?;
        }
        if let Some(value) = var("ACCZIP_ASYNC_DEPTH") {
            self.async_queue_depth = value
                .trim()
                .parse()
                .map_err(|_| AcczipError::InvalidParams("ACCZIP_ASYNC_DEPTH is not a number"))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AcczipError> {
        if !self.chunk_size.is_power_of_two() {
            return Err(AcczipError::InvalidParams(
                "chunk_size must be a power of two",
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(AcczipError::InvalidParams(
                "chunk_size must be between 4 KiB and 1 MiB",
            ));
        }
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&self.compression_level) {
            return Err(AcczipError::InvalidParams(
                "compression_level must be between 1 and 9",
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(AcczipError::InvalidParams(
                "poll_timeout must be greater than 0",
            ));
        }
        if self.async_queue_depth > MAX_ASYNC_QUEUE_DEPTH {
            return Err(AcczipError::InvalidParams(
                "async_queue_depth exceeds the supported maximum",
            ));
        }
        Ok(())
    }

    pub(crate) fn setup_data(&self) -> SetupData {
        SetupData {
            algorithm: self.algorithm,
            level: self.compression_level,
            chunk_size: self.chunk_size,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(digits) = value.strip_suffix('k') {
        (digits, 1024)
    } else if let Some(digits) = value.strip_suffix('m') {
        (digits, 1024 * 1024)
    } else {
        (value.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

#[derive(Debug, Error)]
pub enum AcczipError {
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
    #[error("destination buffer too small")]
    InsufficientBuffer,
    #[error("data corruption: {0}")]
    DataCorruption(&'static str),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(&'static str),
    #[error("accelerator error: {0}")]
    AcceleratorTransient(String),
    #[error("accelerator failed: {0}")]
    Fatal(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl AcczipError {
    pub fn is_accelerator_failure(&self) -> bool {
        matches!(
            self,
            Self::AcceleratorTransient(_) | Self::Fatal(_) | Self::ResourceUnavailable(_)
        )
    }
}

impl From<CodecError> for AcczipError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Corrupt(reason) | CodecError::InvalidHeader(reason) => {
                Self::DataCorruption(reason)
            }
            CodecError::OutputTooSmall => Self::InsufficientBuffer,
            CodecError::InvalidLevel(_) => {
                Self::InvalidParams("compression_level must be between 1 and 9")
            }
            CodecError::UnknownAlgorithm(_) => {
                Self::InvalidParams("algorithm must be deflate or zlib")
            }
            CodecError::DataTooLarge => Self::InvalidParams("chunk too large for block header"),
        }
    }
}

pub fn open_session(
    pool: Option<&Arc<InstancePool>>,
    config: SessionConfig,
) -> Result<Session, AcczipError> {
    Session::open(pool.cloned(), config)
}

pub fn close_session(session: &mut Session) {
    session.close();
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, AcczipError> {
    mutex
        .lock()
        .map_err(|_| AcczipError::Internal("mutex poisoned"))
}

fn wait_timeout_on_condvar<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> Result<MutexGuard<'a, T>, AcczipError> {
    condvar
        .wait_timeout(guard, timeout)
        .map(|(guard, _)| guard)
        .map_err(|_| AcczipError::Internal("mutex poisoned"))
}
