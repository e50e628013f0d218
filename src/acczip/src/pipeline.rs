use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use super::*;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) enum ReadyChunk {
    Data {
        src_len: usize,
        raw_len: usize,
        crc32: u32,
        bytes: Vec<u8>,
    },
    Trailer(BlockHeader),
}

#[derive(Debug)]
pub(crate) struct RequestState {
    id: u64,
    seq: AtomicU64,
    seq_in: AtomicU64,
    submitted: AtomicU64,
    processed: AtomicU64,
    stop_submitting: AtomicBool,
    last_submitted: AtomicBool,
    dst_limited: AtomicBool,
    failed_seq: AtomicU64,
    failure: Mutex<Option<AcczipError>>,
    ready: Mutex<BTreeMap<u64, ReadyChunk>>,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            seq: AtomicU64::new(0),
            seq_in: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            stop_submitting: AtomicBool::new(false),
            last_submitted: AtomicBool::new(false),
            dst_limited: AtomicBool::new(false),
            failed_seq: AtomicU64::new(u64::MAX),
            failure: Mutex::new(None),
            ready: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn seq_in(&self) -> u64 {
        self.seq_in.load(Ordering::Acquire)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    fn outstanding(&self) -> u64 {
        self.submitted().saturating_sub(self.processed())
    }

    pub fn fail(&self, error: AcczipError) {
        self.fail_at(self.seq_in(), error);
    }

    /// Fails chunk `seq`. Chunks before it are still emitted; the earliest
    /// failure decides the request's error.
    pub fn fail_at(&self, seq: u64, error: AcczipError) {
        match self.failure.lock() {
            Ok(mut guard) => {
                if seq < self.failed_seq.load(Ordering::Acquire) {
                    *guard = Some(error);
                    self.failed_seq.store(seq, Ordering::Release);
                }
            }
            Err(_) => {
                self.failed_seq.fetch_min(seq, Ordering::AcqRel);
            }
        }
        self.stop_submitting.store(true, Ordering::Release);
    }

    fn failed_seq(&self) -> u64 {
        self.failed_seq.load(Ordering::Acquire)
    }

    fn draining(&self) -> bool {
        self.seq_in() >= self.failed_seq()
    }

    pub fn is_finished(&self) -> bool {
        self.last_submitted.load(Ordering::Acquire) && self.processed() == self.submitted()
    }

    pub fn outcome(&self) -> Result<(), AcczipError> {
        let failure = match self.failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => Some(AcczipError::Internal("mutex poisoned")),
        };
        if let Some(error) = failure {
            return Err(error);
        }
        if self.dst_limited.load(Ordering::Acquire) {
            return Err(AcczipError::InsufficientBuffer);
        }
        Ok(())
    }

    fn advance_submitted(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub(crate) struct OutputCursor<'d> {
    dst: &'d mut [u8],
    consumed: usize,
    produced: usize,
}

impl<'d> OutputCursor<'d> {
    pub fn new(dst: &'d mut [u8]) -> Self {
        Self {
            dst,
            consumed: 0,
            produced: 0,
        }
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn remaining(&self) -> usize {
        self.dst.len() - self.produced
    }

    fn push(
        &mut self,
        framing: Option<&BlockHeader>,
        body: &[u8],
        src_len: usize,
    ) -> Result<(), AcczipError> {
        let header_len = if framing.is_some() { BLOCK_HEADER_LEN } else { 0 };
        let total = header_len + body.len();
        if total > self.remaining() {
            return Err(AcczipError::InsufficientBuffer);
        }
        let out = &mut self.dst[self.produced..self.produced + total];
        if let Some(header) = framing {
            header.write_to(out)?;
        }
        out[header_len..].copy_from_slice(body);
        self.produced += total;
        self.consumed += src_len;
        Ok(())
    }
}

pub(crate) fn append_trailer(
    out: &mut OutputCursor<'_>,
    checksum: &mut StreamChecksum,
    algorithm: Algorithm,
) -> Result<(), AcczipError> {
    let trailer = checksum.trailer(algorithm);
    out.push(None, &trailer.encode(), 0)?;
    checksum.reset();
    Ok(())
}

#[derive(Clone, Copy)]
pub(crate) struct Hardware<'a> {
    pub pool: &'a InstancePool,
    pub instance: InstanceId,
    pub slots: &'a SlotTable,
    pub capabilities: Capabilities,
}

impl<'a> Hardware<'a> {
    pub fn new(lease: &'a InstanceLease, provisioned: &'a Provisioned) -> Self {
        let pool = lease.pool().as_ref();
        Self {
            pool,
            instance: lease.id(),
            slots: &provisioned.slots,
            capabilities: pool.capabilities(lease.id()).unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RequestContext<'a> {
    pub direction: Direction,
    pub config: &'a SessionConfig,
    pub software: &'a Mutex<SoftwareStream>,
    pub counters: &'a SessionCounters,
    pub hardware: Option<Hardware<'a>>,
}

impl RequestContext<'_> {
    fn software_compress(&self, raw: &[u8]) -> Result<ReadyChunk, AcczipError> {
        let mut block = vec![0_u8; max_block_len(raw.len())];
        let progress = lock(self.software)?.compress_block(raw, &mut block)?;
        block.truncate(progress.produced);
        self.counters.software_chunks.fetch_add(1, Ordering::Relaxed);
        Ok(ReadyChunk::Data {
            src_len: raw.len(),
            raw_len: raw.len(),
            crc32: progress.crc32,
            bytes: block,
        })
    }

    fn software_decompress(
        &self,
        header: &BlockHeader,
        payload: &[u8],
    ) -> Result<ReadyChunk, AcczipError> {
        let mut raw = vec![0_u8; header.raw_len as usize];
        let progress = lock(self.software)?.decompress_payload(header, payload, &mut raw)?;
        self.counters.software_chunks.fetch_add(1, Ordering::Relaxed);
        Ok(ReadyChunk::Data {
            src_len: header.framed_len(),
            raw_len: progress.produced,
            crc32: progress.crc32,
            bytes: raw,
        })
    }

    fn fall_back(&self, error: AcczipError) -> Result<Offload, AcczipError> {
        if self.config.sw_backup {
            Ok(Offload::Software)
        } else {
            Err(error)
        }
    }
}

pub(crate) fn idle(config: &SessionConfig) {
    match config.polling_mode {
        PollingMode::Busy => thread::yield_now(),
        PollingMode::Periodic => thread::sleep(config.poll_backoff),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Routed,
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offload {
    Submitted,
    Waiting,
    Software,
}

pub(crate) struct Producer<'a> {
    ctx: RequestContext<'a>,
    state: &'a RequestState,
    src: &'a [u8],
    offset: usize,
    dst_budget: usize,
    slot_wait_since: Option<Instant>,
    finished: bool,
}

impl<'a> Producer<'a> {
    pub fn new(
        ctx: RequestContext<'a>,
        state: &'a RequestState,
        src: &'a [u8],
        dst_capacity: usize,
    ) -> Self {
        Self {
            ctx,
            state,
            src,
            offset: 0,
            dst_budget: dst_capacity,
            slot_wait_since: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn run(&mut self) {
        loop {
            match self.step() {
                Step::Routed => {}
                Step::Waiting => idle(self.ctx.config),
                Step::Finished => break,
            }
        }
    }

    pub fn step(&mut self) -> Step {
        if self.finished {
            return Step::Finished;
        }
        if self.state.stop_submitting.load(Ordering::Acquire) || self.offset >= self.src.len() {
            return self.finish();
        }
        if self.state.outstanding() >= self.window() {
            return Step::Waiting;
        }
        let routed = match self.ctx.direction {
            Direction::Compress => self.step_compress(),
            Direction::Decompress => self.step_decompress(),
        };
        match routed {
            Ok(step) => step,
            Err(error) => {
                let seq = self.state.seq.load(Ordering::Acquire);
                self.state.fail_at(seq, error);
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> Step {
        self.finished = true;
        self.state.last_submitted.store(true, Ordering::Release);
        Step::Finished
    }

    fn window(&self) -> u64 {
        let slots = self.ctx.hardware.map(|hw| hw.slots.len()).unwrap_or(0);
        (slots.max(2) * 2) as u64
    }

    fn step_compress(&mut self) -> Result<Step, AcczipError> {
        let src = self.src;
        let len = (src.len() - self.offset).min(self.ctx.config.chunk_size);
        let chunk = &src[self.offset..self.offset + len];
        let meta = SlotMeta {
            src_offset: self.offset,
            src_len: len,
            raw_len: len,
            crc32: crc32fast::hash(chunk),
            header: None,
            outcome: None,
        };

        match self.try_hardware(chunk, meta)? {
            Offload::Submitted => self.state.advance_submitted(),
            Offload::Waiting => return Ok(Step::Waiting),
            Offload::Software => {
                let ready = self.ctx.software_compress(chunk)?;
                self.queue_ready(ready)?;
            }
        }
        self.offset += len;
        Ok(Step::Routed)
    }

    fn step_decompress(&mut self) -> Result<Step, AcczipError> {
        let src = self.src;
        let rest = &src[self.offset..];
        let Some(header) = BlockHeader::parse(rest)? else {
            return Ok(self.finish());
        };
        if header.kind == BlockKind::Trailer {
            self.queue_ready(ReadyChunk::Trailer(header))?;
            self.offset += BLOCK_HEADER_LEN;
            return Ok(Step::Routed);
        }

        let framed = header.framed_len();
        if rest.len() < framed {
            return Ok(self.finish());
        }
        let raw_len = header.raw_len as usize;
        if raw_len > self.dst_budget {
            self.state.dst_limited.store(true, Ordering::Release);
            return Ok(self.finish());
        }
        let payload = &rest[BLOCK_HEADER_LEN..framed];

        let offload = match self.ctx.hardware {
            Some(hw) if self.eligible(hw, &header, payload.len()) => {
                let meta = SlotMeta {
                    src_offset: self.offset,
                    src_len: framed,
                    raw_len,
                    crc32: header.crc32,
                    header: Some(header),
                    outcome: None,
                };
                self.try_hardware(payload, meta)?
            }
            Some(_) => {
                debug!(
                    raw_len,
                    comp_len = payload.len(),
                    algorithm = %header.algorithm,
                    "block not eligible for hardware"
                );
                self.ctx.fall_back(AcczipError::ResourceUnavailable(
                    "block not eligible for hardware",
                ))?
            }
            None => Offload::Software,
        };
        match offload {
            Offload::Submitted => self.state.advance_submitted(),
            Offload::Waiting => return Ok(Step::Waiting),
            Offload::Software => {
                let ready = self.ctx.software_decompress(&header, payload)?;
                self.queue_ready(ready)?;
            }
        }
        self.dst_budget -= raw_len;
        self.offset += framed;
        Ok(Step::Routed)
    }

    fn eligible(&self, hw: Hardware<'_>, header: &BlockHeader, payload_len: usize) -> bool {
        header.raw_len as usize <= self.ctx.config.chunk_size
            && payload_len <= hw.slots.capacity()
            && header.algorithm == self.ctx.config.algorithm
            && hw.capabilities.supports(header.algorithm, Direction::Decompress)
    }

    fn queue_ready(&self, chunk: ReadyChunk) -> Result<(), AcczipError> {
        let seq = self.state.seq.load(Ordering::Acquire);
        lock(&self.state.ready)?.insert(seq, chunk);
        self.state.advance_submitted();
        Ok(())
    }

    fn try_hardware(&mut self, input: &[u8], meta: SlotMeta) -> Result<Offload, AcczipError> {
        let Some(hw) = self.ctx.hardware else {
            return Ok(Offload::Software);
        };
        if !hw.pool.is_healthy(hw.instance) {
            return self.ctx.fall_back(AcczipError::Fatal(format!(
                "accelerator instance {} is unhealthy",
                hw.instance.0
            )));
        }

        let seq = self.state.seq.load(Ordering::Acquire);
        let Some(slot_id) = hw.slots.reserve(self.state.id, seq) else {
            let since = *self.slot_wait_since.get_or_insert_with(Instant::now);
            if since.elapsed() < self.ctx.config.slot_wait_timeout {
                return Ok(Offload::Waiting);
            }
            self.slot_wait_since = None;
            debug!(request = self.state.id, seq, "no free slot in time");
            return self
                .ctx
                .fall_back(AcczipError::ResourceUnavailable("no free accelerator slot"));
        };
        self.slot_wait_since = None;
        let slot = hw
            .slots
            .get(slot_id)
            .ok_or(AcczipError::Internal("reserved slot out of range"))?;
        *lock(&slot.meta)? = meta;

        let zero_copy = hw.pool.memory().is_pinned(input);
        let tag = SlotTag {
            instance: hw.instance,
            slot: slot_id,
        };
        let status = {
            let mut buffers = lock(&slot.buffers)?;
            let SlotBuffers { src, dst } = &mut *buffers;
            if !zero_copy {
                src[..input.len()].copy_from_slice(input);
            }
            slot.transition(SlotState::Submitted, SlotState::InFlight)?;
            trace!(request = self.state.id, seq, slot = slot_id.0, zero_copy, "slot in flight");

            let mut retries = 0;
            loop {
                let job_input: &[u8] = if zero_copy { input } else { &src[..input.len()] };
                let status = hw.pool.backend().submit(Job {
                    tag,
                    direction: self.ctx.direction,
                    algorithm: self.ctx.config.algorithm,
                    input: job_input,
                    output: &mut dst[..],
                });
                if status != SubmitStatus::Retry || retries >= self.ctx.config.submit_retries {
                    break status;
                }
                retries += 1;
                self.ctx.counters.submit_retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(self.ctx.config.submit_backoff);
            }
        };

        match status {
            SubmitStatus::Accepted => {
                if zero_copy {
                    self.ctx
                        .counters
                        .zero_copy_chunks
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(Offload::Submitted)
            }
            SubmitStatus::Retry => {
                slot.transition(SlotState::InFlight, SlotState::Free)?;
                debug!(request = self.state.id, seq, "submit retries exhausted");
                self.ctx.fall_back(AcczipError::AcceleratorTransient(
                    "submit retries exhausted".to_string(),
                ))
            }
            SubmitStatus::Rejected(reason) => {
                slot.transition(SlotState::InFlight, SlotState::Free)?;
                warn!(request = self.state.id, seq, %reason, "submit rejected");
                self.ctx.fall_back(AcczipError::AcceleratorTransient(reason))
            }
        }
    }
}

impl Drop for Producer<'_> {
    fn drop(&mut self) {
        self.state.last_submitted.store(true, Ordering::Release);
    }
}

pub(crate) struct Poller<'a> {
    ctx: RequestContext<'a>,
    state: &'a RequestState,
    src: &'a [u8],
    completions: Vec<Completion>,
    last_activity: Instant,
    abandoned: bool,
}

impl<'a> Poller<'a> {
    pub fn new(ctx: RequestContext<'a>, state: &'a RequestState, src: &'a [u8]) -> Self {
        Self {
            ctx,
            state,
            src,
            completions: Vec::new(),
            last_activity: Instant::now(),
            abandoned: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_finished()
            || (self.abandoned && self.state.last_submitted.load(Ordering::Acquire))
    }

    pub fn run(&mut self, out: &mut OutputCursor<'_>, checksum: &mut StreamChecksum) {
        loop {
            let progressed = self.tick(out, checksum);
            if self.is_done() {
                break;
            }
            if !progressed {
                idle(self.ctx.config);
            }
        }
    }

    pub fn tick(&mut self, out: &mut OutputCursor<'_>, checksum: &mut StreamChecksum) -> bool {
        if self.abandoned {
            return false;
        }
        match self.step(out, checksum) {
            Ok(true) => {
                self.last_activity = Instant::now();
                true
            }
            Ok(false) => {
                if self.state.outstanding() > 0
                    && self.last_activity.elapsed() >= self.ctx.config.poll_timeout
                {
                    self.on_timeout();
                    return true;
                }
                false
            }
            Err(error) => {
                error!(request = self.state.id, %error, "poller gave up on request");
                self.state.fail(error);
                self.abandon();
                true
            }
        }
    }

    fn step(
        &mut self,
        out: &mut OutputCursor<'_>,
        checksum: &mut StreamChecksum,
    ) -> Result<bool, AcczipError> {
        let mut progressed = self.collect_completions()? > 0;

        loop {
            let seq = self.state.seq_in();
            if seq >= self.state.failed_seq() {
                break;
            }
            let ready = lock(&self.state.ready)?.remove(&seq);
            if let Some(chunk) = ready {
                if let Err(error) = self.emit_ready(chunk, out, checksum) {
                    self.state.fail(error);
                }
            } else if let Some(hw) = self.ctx.hardware
                && let Some(slot_id) = hw.slots.find_ready(self.state.id, seq)
            {
                self.emit_slot(hw, slot_id, seq, out, checksum)?;
            } else {
                break;
            }
            self.state.seq_in.fetch_add(1, Ordering::AcqRel);
            self.state.processed.fetch_add(1, Ordering::AcqRel);
            progressed = true;
        }

        if self.state.draining() {
            progressed |= self.drain()? > 0;
        }
        Ok(progressed)
    }

    fn collect_completions(&mut self) -> Result<usize, AcczipError> {
        let Some(hw) = self.ctx.hardware else {
            return Ok(0);
        };
        self.completions.clear();
        hw.pool
            .backend()
            .poll(hw.instance, &mut self.completions)
            .map_err(|error| AcczipError::Fatal(format!("poll failed: {error}")))?;

        let mut recorded = 0;
        for completion in self.completions.drain(..) {
            let tag = completion.tag;
            let slot = match hw.slots.get(tag.slot) {
                Some(slot) if tag.instance == hw.instance => slot,
                _ => {
                    warn!(
                        instance = tag.instance.0,
                        slot = tag.slot.0,
                        "completion for unknown slot"
                    );
                    continue;
                }
            };
            if slot.state() != SlotState::InFlight {
                warn!(slot = tag.slot.0, state = ?slot.state(), "stale completion ignored");
                continue;
            }
            lock(&slot.meta)?.outcome = Some(completion.outcome);
            slot.transition(SlotState::InFlight, SlotState::Completed)?;
            trace!(slot = tag.slot.0, owner = slot.owner(), seq = slot.seq(), "slot completed");
            recorded += 1;
        }
        Ok(recorded)
    }

    fn emit_ready(
        &self,
        chunk: ReadyChunk,
        out: &mut OutputCursor<'_>,
        checksum: &mut StreamChecksum,
    ) -> Result<(), AcczipError> {
        match chunk {
            ReadyChunk::Data {
                src_len,
                raw_len,
                crc32,
                bytes,
            } => {
                out.push(None, &bytes, src_len)?;
                checksum.combine_chunk(crc32, raw_len);
                Ok(())
            }
            ReadyChunk::Trailer(header) => {
                if !checksum.matches_trailer(&header) {
                    return Err(AcczipError::DataCorruption("stream trailer mismatch"));
                }
                checksum.reset();
                out.push(None, &[], BLOCK_HEADER_LEN)
            }
        }
    }

    fn emit_slot(
        &self,
        hw: Hardware<'_>,
        slot_id: SlotId,
        seq: u64,
        out: &mut OutputCursor<'_>,
        checksum: &mut StreamChecksum,
    ) -> Result<(), AcczipError> {
        let slot = hw
            .slots
            .get(slot_id)
            .ok_or(AcczipError::Internal("completed slot out of range"))?;
        let meta = std::mem::take(&mut *lock(&slot.meta)?);

        let emitted = match self.verify(&meta) {
            Ok(produced) => self.emit_hardware_output(slot, &meta, produced, out, checksum),
            Err(reason) => self
                .retry_in_software(&meta, seq, reason)
                .and_then(|chunk| self.emit_ready(chunk, out, checksum)),
        };
        slot.transition(SlotState::Completed, SlotState::Free)?;
        if let Err(error) = emitted {
            self.state.fail(error);
        }
        Ok(())
    }

    fn emit_hardware_output(
        &self,
        slot: &Slot,
        meta: &SlotMeta,
        produced: usize,
        out: &mut OutputCursor<'_>,
        checksum: &mut StreamChecksum,
    ) -> Result<(), AcczipError> {
        let buffers = lock(&slot.buffers)?;
        let body = buffers
            .dst
            .get(..produced)
            .ok_or(AcczipError::Internal("completion larger than slot"))?;
        match self.ctx.direction {
            Direction::Compress => {
                let header = BlockHeader::data(
                    self.ctx.config.algorithm,
                    meta.raw_len,
                    produced,
                    meta.crc32,
                )?;
                out.push(Some(&header), body, meta.src_len)?;
            }
            Direction::Decompress => out.push(None, body, meta.src_len)?,
        }
        checksum.combine_chunk(meta.crc32, meta.raw_len);
        self.ctx
            .counters
            .hardware_chunks
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn verify(&self, meta: &SlotMeta) -> Result<usize, String> {
        match &meta.outcome {
            Some(CompletionOutcome::Done {
                consumed,
                produced,
                crc32,
            }) => match self.ctx.direction {
                Direction::Compress => {
                    if *consumed != meta.raw_len {
                        Err(format!("consumed {consumed} of {} bytes", meta.raw_len))
                    } else if *crc32 != meta.crc32 {
                        Err("input crc32 mismatch".to_string())
                    } else if *produced == 0 || *produced > max_payload_len(meta.raw_len) {
                        Err(format!("compressed size {produced} out of range"))
                    } else {
                        Ok(*produced)
                    }
                }
                Direction::Decompress => {
                    if *produced != meta.raw_len {
                        Err(format!("decoded {produced} of {} bytes", meta.raw_len))
                    } else if *crc32 != meta.crc32 {
                        Err("output crc32 mismatch".to_string())
                    } else {
                        Ok(*produced)
                    }
                }
            },
            Some(CompletionOutcome::Failed(reason)) => Err(reason.clone()),
            Some(CompletionOutcome::Overflow) => Err("destination overflow".to_string()),
            None => Err("completion without outcome".to_string()),
        }
    }

    fn retry_in_software(
        &self,
        meta: &SlotMeta,
        seq: u64,
        reason: String,
    ) -> Result<ReadyChunk, AcczipError> {
        self.ctx
            .counters
            .software_retries
            .fetch_add(1, Ordering::Relaxed);
        if !self.ctx.config.sw_backup {
            return Err(AcczipError::AcceleratorTransient(reason));
        }
        warn!(request = self.state.id, seq, %reason, "hardware chunk failed, redoing in software");

        let end = meta.src_offset + meta.src_len;
        let input = self
            .src
            .get(meta.src_offset..end)
            .ok_or(AcczipError::Internal("chunk outside request input"))?;
        match self.ctx.direction {
            Direction::Compress => self.ctx.software_compress(input),
            Direction::Decompress => {
                let header = meta
                    .header
                    .ok_or(AcczipError::Internal("decompression slot without header"))?;
                self.ctx
                    .software_decompress(&header, &input[BLOCK_HEADER_LEN..])
            }
        }
    }

    fn drain(&mut self) -> Result<usize, AcczipError> {
        let mut drained = {
            let mut ready = lock(&self.state.ready)?;
            let count = ready.len();
            ready.clear();
            count
        };
        if let Some(hw) = self.ctx.hardware {
            for slot_id in hw.slots.completed_by(self.state.id) {
                if let Some(slot) = hw.slots.get(slot_id)
                    && slot
                        .transition(SlotState::Completed, SlotState::Free)
                        .is_ok()
                {
                    drained += 1;
                }
            }
        }
        self.state
            .processed
            .fetch_add(drained as u64, Ordering::AcqRel);
        Ok(drained)
    }

    fn on_timeout(&mut self) {
        error!(
            request = self.state.id,
            outstanding = self.state.outstanding(),
            "no completion within poll timeout"
        );
        self.state
            .fail(AcczipError::Fatal("accelerator stopped completing requests".to_string()));
        if let Some(hw) = self.ctx.hardware {
            hw.pool.mark_unhealthy(hw.instance);
            let reclaimed = hw.slots.reclaim(self.state.id);
            self.state
                .processed
                .fetch_add(reclaimed as u64, Ordering::AcqRel);
        }
        self.last_activity = Instant::now();
    }

    fn abandon(&mut self) {
        self.abandoned = true;
        if let Some(hw) = self.ctx.hardware {
            hw.pool.mark_unhealthy(hw.instance);
            hw.slots.reclaim(self.state.id);
        }
    }
}

pub(crate) fn run_request(
    ctx: RequestContext<'_>,
    state: &RequestState,
    src: &[u8],
    out: &mut OutputCursor<'_>,
    checksum: &mut StreamChecksum,
) -> Result<(), AcczipError> {
    let chunks = src.len().div_ceil(ctx.config.chunk_size);
    let mut producer = Producer::new(ctx, state, src, out.remaining());
    let mut poller = Poller::new(ctx, state, src);

    if chunks > ctx.config.inline_chunk_limit {
        thread::scope(|scope| {
            let handle = scope.spawn(move || producer.run());
            poller.run(out, checksum);
            handle
                .join()
                .map_err(|_| AcczipError::Internal("producer thread panicked"))
        })?;
    } else {
        loop {
            let mut progressed = false;
            while !producer.is_finished() {
                match producer.step() {
                    Step::Routed => progressed = true,
                    Step::Waiting | Step::Finished => break,
                }
            }
            progressed |= poller.tick(out, checksum);
            if poller.is_done() {
                break;
            }
            if !progressed {
                idle(ctx.config);
            }
        }
    }

    state.outcome()
}

pub(crate) fn run_software(
    ctx: RequestContext<'_>,
    src: &[u8],
    out: &mut OutputCursor<'_>,
    checksum: &mut StreamChecksum,
) -> Result<(), AcczipError> {
    let state = RequestState::new();
    let ctx = RequestContext {
        hardware: None,
        ..ctx
    };
    run_request(ctx, &state, src, out, checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rig {
        mock: Arc<MockAccelerator>,
        pool: Arc<InstancePool>,
        config: SessionConfig,
        software: Mutex<SoftwareStream>,
        counters: SessionCounters,
    }

    impl Rig {
        fn new(mock: MockConfig, slots: usize, config: SessionConfig) -> Self {
            let mock = Arc::new(mock_accelerator(mock));
            let pool = InstancePool::start(
                mock.clone(),
                PoolConfig {
                    slots_per_instance: slots,
                    ..PoolConfig::default()
                },
            )
            .expect("pool should start");
            let software = Mutex::new(
                SoftwareStream::new(config.algorithm, config.compression_level)
                    .expect("software stream"),
            );
            Self {
                mock,
                pool,
                config,
                software,
                counters: SessionCounters::default(),
            }
        }

        fn lease(&self, direction: Direction) -> (InstanceLease, Arc<Provisioned>) {
            let lease = self
                .pool
                .try_acquire(None, self.config.algorithm, direction, 0)
                .expect("instance available");
            let provisioned = self
                .pool
                .ensure_provisioned(&lease, &self.config.setup_data())
                .expect("provisioning");
            (lease, provisioned)
        }

        fn context<'a>(
            &'a self,
            direction: Direction,
            hardware: Option<Hardware<'a>>,
        ) -> RequestContext<'a> {
            RequestContext {
                direction,
                config: &self.config,
                software: &self.software,
                counters: &self.counters,
                hardware,
            }
        }
    }

    fn mock_accelerator(config: MockConfig) -> MockAccelerator {
        MockAccelerator::new(config)
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            chunk_size: MIN_CHUNK_SIZE,
            min_hw_input: 0,
            poll_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut state = 0x1234_5678_u32;
        (0..len)
            .map(|i| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                if i % 7 == 0 { (state >> 24) as u8 } else { b'a' + (i % 13) as u8 }
            })
            .collect()
    }

    #[test]
    fn three_chunks_on_two_slots_complete_out_of_order() {
        let rig = Rig::new(
            MockConfig {
                order: CompletionOrder::Reverse,
                ..MockConfig::default()
            },
            2,
            small_config(),
        );
        let input = sample(3 * MIN_CHUNK_SIZE - 100);
        let (lease, provisioned) = rig.lease(Direction::Compress);
        let ctx = rig.context(
            Direction::Compress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let state = RequestState::new();
        let mut dst = vec![0_u8; max_block_len(input.len()) * 2];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        run_request(ctx, &state, &input, &mut out, &mut checksum).expect("request succeeds");

        assert_eq!(state.seq_in(), 3);
        assert_eq!(state.submitted(), 3);
        assert_eq!(state.processed(), 3);
        assert_eq!(out.consumed(), input.len());

        let delivered = rig.mock.delivered();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].slot, SlotId(1));
        assert_eq!(delivered[1].slot, SlotId(0));

        let produced = out.produced();
        append_trailer(&mut out, &mut checksum, Algorithm::Deflate).expect("trailer fits");
        let stream = &dst[..produced + BLOCK_HEADER_LEN];
        let decoded = decode_stream_on_cpu(stream).expect("stream decodes");
        assert_eq!(decoded, input);
        assert_eq!(rig.counters.hardware_chunks.load(Ordering::Relaxed), 3);
        assert_eq!(rig.mock.slot_reuse_violations(), 0);
    }

    #[test]
    fn threaded_request_matches_software_output() {
        let rig = Rig::new(
            MockConfig {
                order: CompletionOrder::Shuffled { seed: 99 },
                latency_polls: 2,
                ..MockConfig::default()
            },
            4,
            SessionConfig {
                inline_chunk_limit: 1,
                ..small_config()
            },
        );
        let input = sample(20 * MIN_CHUNK_SIZE + 17);
        let (lease, provisioned) = rig.lease(Direction::Compress);
        let ctx = rig.context(
            Direction::Compress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let state = RequestState::new();
        let mut dst = vec![0_u8; max_block_len(input.len()) * 2];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        run_request(ctx, &state, &input, &mut out, &mut checksum).expect("request succeeds");
        append_trailer(&mut out, &mut checksum, Algorithm::Deflate).expect("trailer fits");
        let produced = out.produced();

        let expected = encode_stream_on_cpu(&input, Algorithm::Deflate, 6, MIN_CHUNK_SIZE)
            .expect("software encode");
        assert_eq!(&dst[..produced], expected.as_slice());
    }

    #[test]
    fn failed_completions_are_redone_in_software() {
        let rig = Rig::new(
            MockConfig {
                fail_every: Some(2),
                ..MockConfig::default()
            },
            2,
            small_config(),
        );
        let input = sample(5 * MIN_CHUNK_SIZE);
        let (lease, provisioned) = rig.lease(Direction::Compress);
        let ctx = rig.context(
            Direction::Compress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let state = RequestState::new();
        let mut dst = vec![0_u8; max_block_len(input.len()) * 2];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        run_request(ctx, &state, &input, &mut out, &mut checksum).expect("request succeeds");

        assert_eq!(rig.counters.software_retries.load(Ordering::Relaxed), 2);
        assert_eq!(rig.counters.hardware_chunks.load(Ordering::Relaxed), 3);
        assert_eq!(checksum.crc32(), crc32fast::hash(&input));
    }

    #[test]
    fn small_destination_reports_exact_prefix() {
        let rig = Rig::new(MockConfig::default(), 2, small_config());
        let input = sample(4 * MIN_CHUNK_SIZE);
        let (lease, provisioned) = rig.lease(Direction::Compress);
        let ctx = rig.context(
            Direction::Compress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let first_block =
            encode_stream_on_cpu(&input[..MIN_CHUNK_SIZE], Algorithm::Deflate, 6, MIN_CHUNK_SIZE)
                .expect("software encode")
            .len()
            - BLOCK_HEADER_LEN;
        let state = RequestState::new();
        let mut dst = vec![0_u8; first_block + 10];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        let result = run_request(ctx, &state, &input, &mut out, &mut checksum);

        assert!(matches!(result, Err(AcczipError::InsufficientBuffer)));
        assert_eq!(out.consumed(), MIN_CHUNK_SIZE);
        assert_eq!(out.produced(), first_block);
        assert!(state.is_finished());
        assert_eq!(provisioned.slots.busy_count(), 0);
    }

    #[test]
    fn lost_completion_times_out_and_frees_slots() {
        let rig = Rig::new(
            MockConfig {
                drop_every: Some(2),
                ..MockConfig::default()
            },
            2,
            SessionConfig {
                poll_timeout: Duration::from_millis(50),
                ..small_config()
            },
        );
        let input = sample(3 * MIN_CHUNK_SIZE);
        let (lease, provisioned) = rig.lease(Direction::Compress);
        let ctx = rig.context(
            Direction::Compress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let state = RequestState::new();
        let mut dst = vec![0_u8; max_block_len(input.len()) * 2];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        let result = run_request(ctx, &state, &input, &mut out, &mut checksum);

        assert!(matches!(result, Err(AcczipError::Fatal(_))));
        assert_eq!(out.consumed(), MIN_CHUNK_SIZE);
        assert!(!rig.pool.is_healthy(lease.id()));
        assert_eq!(provisioned.slots.busy_count(), 0);
    }

    #[test]
    fn decompression_skips_blocks_larger_than_chunk_size() {
        let rig = Rig::new(MockConfig::default(), 2, small_config());
        let input = sample(6 * MIN_CHUNK_SIZE);
        let stream = encode_stream_on_cpu(&input, Algorithm::Deflate, 6, 2 * MIN_CHUNK_SIZE)
            .expect("software encode");
        let (lease, provisioned) = rig.lease(Direction::Decompress);
        let ctx = rig.context(
            Direction::Decompress,
            Some(Hardware::new(&lease, &provisioned)),
        );

        let state = RequestState::new();
        let mut dst = vec![0_u8; input.len()];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        run_request(ctx, &state, &stream, &mut out, &mut checksum).expect("request succeeds");

        assert_eq!(out.consumed(), stream.len());
        assert_eq!(dst, input);
        assert_eq!(rig.counters.hardware_chunks.load(Ordering::Relaxed), 0);
        assert_eq!(rig.counters.software_chunks.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn software_only_request_needs_no_instance() {
        let rig = Rig::new(MockConfig::default(), 1, small_config());
        let input = sample(3 * MIN_CHUNK_SIZE + 5);
        let ctx = rig.context(Direction::Compress, None);

        let mut dst = vec![0_u8; max_block_len(input.len()) * 2];
        let mut out = OutputCursor::new(&mut dst);
        let mut checksum = StreamChecksum::new();
        run_software(ctx, &input, &mut out, &mut checksum).expect("request succeeds");
        append_trailer(&mut out, &mut checksum, Algorithm::Deflate).expect("trailer fits");
        let produced = out.produced();

        let expected = encode_stream_on_cpu(&input, Algorithm::Deflate, 6, MIN_CHUNK_SIZE)
            .expect("software encode");
        assert_eq!(&dst[..produced], expected.as_slice());
        assert_eq!(rig.mock.submit_count(), 0);
    }
}
