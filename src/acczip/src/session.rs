use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use super::*;

const STREAM_CHUNKS_PER_CALL: usize = 8;
const STREAM_READ_SIZE: usize = 256 * 1024;

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub requests: AtomicU64,
    pub hardware_chunks: AtomicU64,
    pub software_chunks: AtomicU64,
    pub zero_copy_chunks: AtomicU64,
    pub submit_retries: AtomicU64,
    pub software_retries: AtomicU64,
    pub fallback_requests: AtomicU64,
    pub acquire_misses: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub async_completed: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            requests: self.requests.load(Ordering::Relaxed),
            hardware_chunks: self.hardware_chunks.load(Ordering::Relaxed),
            software_chunks: self.software_chunks.load(Ordering::Relaxed),
            zero_copy_chunks: self.zero_copy_chunks.load(Ordering::Relaxed),
            submit_retries: self.submit_retries.load(Ordering::Relaxed),
            software_retries: self.software_retries.load(Ordering::Relaxed),
            fallback_requests: self.fallback_requests.load(Ordering::Relaxed),
            acquire_misses: self.acquire_misses.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            async_completed: self.async_completed.load(Ordering::Relaxed),
        }
    }

    fn record_call(&self, consumed: usize, produced: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(consumed as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(produced as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub hardware_chunks: u64,
    pub software_chunks: u64,
    pub zero_copy_chunks: u64,
    pub submit_retries: u64,
    pub software_retries: u64,
    pub fallback_requests: u64,
    pub acquire_misses: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub async_completed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub calls: usize,
}

pub struct Session {
    pool: Option<Arc<InstancePool>>,
    config: SessionConfig,
    instance_hint: Option<InstanceId>,
    hw_skip: usize,
    software: Mutex<SoftwareStream>,
    compress_checksum: StreamChecksum,
    decompress_checksum: StreamChecksum,
    counters: Arc<SessionCounters>,
    async_control: Option<AsyncControl>,
    closed: bool,
}

impl Session {
    pub fn open(
        pool: Option<Arc<InstancePool>>,
        config: SessionConfig,
    ) -> Result<Self, AcczipError> {
        config.validate()?;
        let software = SoftwareStream::new(config.algorithm, config.compression_level)?;
        let counters = Arc::new(SessionCounters::default());
        let async_control = if config.async_queue_depth > 0 {
            Some(AsyncControl::start(
                pool.clone(),
                config.clone(),
                Arc::clone(&counters),
            )?)
        } else {
            None
        };

        debug!(
            chunk_size = config.chunk_size,
            level = config.compression_level,
            algorithm = %config.algorithm,
            hardware = pool.is_some() && config.hw_enabled,
            sw_backup = config.sw_backup,
            "session opened"
        );
        Ok(Self {
            pool,
            config,
            instance_hint: None,
            hw_skip: 0,
            software: Mutex::new(software),
            compress_checksum: StreamChecksum::new(),
            decompress_checksum: StreamChecksum::new(),
            counters,
            async_control,
            closed: false,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Compresses up to `*src_len` bytes of `src` into at most `*dst_len`
    /// bytes of `dst`. On return both lengths hold how much was consumed
    /// and produced, including when an error is returned.
    ///
    /// With `is_last`, the stream trailer follows the last block. If the
    /// trailer does not fit, [`AcczipError::InsufficientBuffer`] is returned
    /// after all input was consumed; call again with an empty `src`.
    pub fn compress(
        &mut self,
        src: &[u8],
        src_len: &mut usize,
        dst: &mut [u8],
        dst_len: &mut usize,
        is_last: bool,
    ) -> Result<(), AcczipError> {
        let src = &src[..(*src_len).min(src.len())];
        let dst_cap = (*dst_len).min(dst.len());
        *src_len = 0;
        *dst_len = 0;
        self.ensure_usable()?;

        let mut out = OutputCursor::new(&mut dst[..dst_cap]);
        let mut result = self.process(Direction::Compress, src, &mut out);
        if result.is_ok() && is_last && out.consumed() == src.len() {
            result = append_trailer(&mut out, &mut self.compress_checksum, self.config.algorithm);
        }

        *src_len = out.consumed();
        *dst_len = out.produced();
        self.finish_call(Direction::Compress, *src_len, *dst_len, &result);
        result
    }

    /// Decompresses whole blocks from `src`. A block cut off at the end of
    /// `src` is left unconsumed for the next call. The stream trailer is
    /// checked against everything decoded since the previous trailer.
    pub fn decompress(
        &mut self,
        src: &[u8],
        src_len: &mut usize,
        dst: &mut [u8],
        dst_len: &mut usize,
    ) -> Result<(), AcczipError> {
        let src = &src[..(*src_len).min(src.len())];
        let dst_cap = (*dst_len).min(dst.len());
        *src_len = 0;
        *dst_len = 0;
        self.ensure_usable()?;

        let mut out = OutputCursor::new(&mut dst[..dst_cap]);
        let result = self.process(Direction::Decompress, src, &mut out);

        *src_len = out.consumed();
        *dst_len = out.produced();
        self.finish_call(Direction::Decompress, *src_len, *dst_len, &result);
        result
    }

    pub fn decompress_pending(&self) -> bool {
        self.decompress_checksum.total_len() != 0
    }

    pub fn submit_async(&self, request: AsyncRequest) -> Result<(), QueueFull> {
        match self.async_control.as_ref() {
            Some(control) if !self.closed => control.enqueue(request),
            _ => Err(QueueFull(request)),
        }
    }

    pub fn async_queue_len(&self) -> usize {
        self.async_control
            .as_ref()
            .map(AsyncControl::queued)
            .unwrap_or(0)
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut control) = self.async_control.take() {
            control.shutdown();
        }
        debug!(stats = ?self.counters.snapshot(), "session closed");
    }

    pub fn compress_stream<R: Read, W: Write>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<StreamStats, AcczipError> {
        let mut stats = StreamStats::default();
        let read_len = self.config.chunk_size * STREAM_CHUNKS_PER_CALL;
        let mut input = vec![0_u8; read_len];
        let mut output = vec![
            0_u8;
            max_block_len(self.config.chunk_size) * STREAM_CHUNKS_PER_CALL + BLOCK_HEADER_LEN
        ];

        loop {
            let filled = read_full(reader, &mut input)?;
            let is_last = filled < input.len();
            let mut offset = 0;
            loop {
                let mut src_len = filled - offset;
                let mut dst_len = output.len();
                let result = self.compress(
                    &input[offset..filled],
                    &mut src_len,
                    &mut output,
                    &mut dst_len,
                    is_last,
                );
                writer.write_all(&output[..dst_len])?;
                offset += src_len;
                stats.input_bytes += src_len as u64;
                stats.output_bytes += dst_len as u64;
                stats.calls += 1;
                match result {
                    Ok(()) => break,
                    Err(AcczipError::InsufficientBuffer) if src_len + dst_len > 0 => continue,
                    Err(error) => return Err(error),
                }
            }
            if is_last {
                break;
            }
        }
        writer.flush()?;
        Ok(stats)
    }

    pub fn decompress_stream<R: Read, W: Write>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<StreamStats, AcczipError> {
        let mut stats = StreamStats::default();
        let mut pending = Vec::new();
        let mut read_buf = vec![0_u8; STREAM_READ_SIZE];
        let output_len = MAX_CHUNK_SIZE.max(self.config.chunk_size * STREAM_CHUNKS_PER_CALL);
        let mut output = vec![0_u8; output_len];

        loop {
            let read = reader.read(&mut read_buf)?;
            let eof = read == 0;
            pending.extend_from_slice(&read_buf[..read]);

            loop {
                let mut src_len = pending.len();
                let mut dst_len = output.len();
                let result = self.decompress(&pending, &mut src_len, &mut output, &mut dst_len);
                writer.write_all(&output[..dst_len])?;
                pending.drain(..src_len);
                stats.input_bytes += src_len as u64;
                stats.output_bytes += dst_len as u64;
                stats.calls += 1;
                match result {
                    Ok(()) if src_len > 0 && !pending.is_empty() => continue,
                    Ok(()) => break,
                    Err(AcczipError::InsufficientBuffer) if src_len + dst_len > 0 => continue,
                    Err(error) => return Err(error),
                }
            }

            if eof {
                if !pending.is_empty() {
                    return Err(AcczipError::DataCorruption("truncated block at end of stream"));
                }
                if self.decompress_pending() {
                    return Err(AcczipError::DataCorruption("stream ended without trailer"));
                }
                break;
            }
        }
        writer.flush()?;
        Ok(stats)
    }

    fn ensure_usable(&self) -> Result<(), AcczipError> {
        if self.closed {
            return Err(AcczipError::InvalidParams("session is closed"));
        }
        if !self.config.hw_enabled && !self.config.sw_backup {
            return Err(AcczipError::InvalidParams(
                "hardware and software paths are both disabled",
            ));
        }
        Ok(())
    }

    fn process(
        &mut self,
        direction: Direction,
        src: &[u8],
        out: &mut OutputCursor<'_>,
    ) -> Result<(), AcczipError> {
        let route = self.choose_route(direction, src.len())?;

        let checksum = match direction {
            Direction::Compress => &mut self.compress_checksum,
            Direction::Decompress => &mut self.decompress_checksum,
        };
        let ctx = RequestContext {
            direction,
            config: &self.config,
            software: &self.software,
            counters: &self.counters,
            hardware: None,
        };

        let Some((lease, provisioned)) = route else {
            return run_software(ctx, src, out, checksum);
        };
        self.instance_hint = Some(lease.id());

        let state = RequestState::new();
        let hardware = Hardware::new(&lease, &provisioned);
        let result = run_request(
            RequestContext {
                hardware: Some(hardware),
                ..ctx
            },
            &state,
            src,
            out,
            checksum,
        );
        match result {
            Err(error) if error.is_accelerator_failure() && self.config.sw_backup => {
                self.counters
                    .fallback_requests
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    instance = lease.id().0,
                    consumed = out.consumed(),
                    %error,
                    "accelerator request failed, finishing in software"
                );
                let rest = &src[out.consumed()..];
                run_software(ctx, rest, out, checksum)
            }
            result => result,
        }
    }

    fn choose_route(
        &mut self,
        direction: Direction,
        len: usize,
    ) -> Result<Option<(InstanceLease, Arc<Provisioned>)>, AcczipError> {
        let config = &self.config;
        if !config.hw_enabled || len == 0 {
            return Ok(None);
        }
        let Some(pool) = self.pool.as_ref() else {
            return if config.sw_backup {
                Ok(None)
            } else {
                Err(AcczipError::ResourceUnavailable("no accelerator pool"))
            };
        };
        if config.sw_backup {
            if len < config.min_hw_input {
                trace!(len, "request below hardware threshold");
                return Ok(None);
            }
            if self.hw_skip > 0 {
                self.hw_skip -= 1;
                return Ok(None);
            }
        }

        let Some(lease) = pool.try_acquire(
            self.instance_hint,
            config.algorithm,
            direction,
            config.req_count_threshold,
        ) else {
            self.counters.acquire_misses.fetch_add(1, Ordering::Relaxed);
            debug!(direction = ?direction, "no accelerator instance available");
            if !config.sw_backup {
                return Err(AcczipError::ResourceUnavailable(
                    "no accelerator instance available",
                ));
            }
            self.hw_skip = config.hw_skip_after_miss;
            return Ok(None);
        };

        match pool.ensure_provisioned(&lease, &config.setup_data()) {
            Ok(provisioned) => Ok(Some((lease, provisioned))),
            Err(error) if config.sw_backup => {
                warn!(instance = lease.id().0, %error, "provisioning failed, using software");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn finish_call(
        &self,
        direction: Direction,
        consumed: usize,
        produced: usize,
        result: &Result<(), AcczipError>,
    ) {
        self.counters.record_call(consumed, produced);
        match result {
            Ok(()) => trace!(direction = ?direction, consumed, produced, "call finished"),
            Err(AcczipError::InsufficientBuffer) => {
                debug!(direction = ?direction, consumed, produced, "destination full")
            }
            Err(error) => error!(direction = ?direction, consumed, produced, %error, "call failed"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("hardware", &self.pool.is_some())
            .field("async", &self.async_control.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, AcczipError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(filled)
}
