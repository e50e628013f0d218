use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockProgress {
    pub consumed: usize,
    pub produced: usize,
    pub crc32: u32,
}

#[derive(Debug)]
pub struct SoftwareStream {
    algorithm: Algorithm,
    level: u32,
    compress: Compress,
    decompress: Decompress,
    decompress_algorithm: Algorithm,
    blocks_compressed: u64,
    blocks_decompressed: u64,
}

impl SoftwareStream {
    pub fn new(algorithm: Algorithm, level: u32) -> Result<Self, CodecError> {
        validate_level(level)?;
        Ok(Self {
            algorithm,
            level,
            compress: Compress::new(Compression::new(level), algorithm.zlib_header()),
            decompress: Decompress::new(algorithm.zlib_header()),
            decompress_algorithm: algorithm,
            blocks_compressed: 0,
            blocks_decompressed: 0,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn blocks_compressed(&self) -> u64 {
        self.blocks_compressed
    }

    pub fn blocks_decompressed(&self) -> u64 {
        self.blocks_decompressed
    }

    pub fn compress_payload(
        &mut self,
        raw: &[u8],
        out: &mut [u8],
    ) -> Result<BlockProgress, CodecError> {
        self.compress.reset();
        loop {
            let consumed = self.compress.total_in() as usize;
            let produced = self.compress.total_out() as usize;
            let status = self
                .compress
                .compress(&raw[consumed..], &mut out[produced..], FlushCompress::Finish)
                .map_err(|_| CodecError::Corrupt("deflate encoder error"))?;
            if status == Status::StreamEnd {
                break;
            }
            let progressed = self.compress.total_in() as usize != consumed
                || self.compress.total_out() as usize != produced;
            if !progressed {
                return Err(CodecError::OutputTooSmall);
            }
        }

        self.blocks_compressed = self.blocks_compressed.saturating_add(1);
        Ok(BlockProgress {
            consumed: raw.len(),
            produced: self.compress.total_out() as usize,
            crc32: crc32fast::hash(raw),
        })
    }

    pub fn compress_block(
        &mut self,
        raw: &[u8],
        out: &mut [u8],
    ) -> Result<BlockProgress, CodecError> {
        if out.len() < BLOCK_HEADER_LEN {
            return Err(CodecError::OutputTooSmall);
        }
        let (head, body) = out.split_at_mut(BLOCK_HEADER_LEN);
        let payload = self.compress_payload(raw, body)?;
        let header = BlockHeader::data(self.algorithm, raw.len(), payload.produced, payload.crc32)?;
        header.write_to(head)?;

        Ok(BlockProgress {
            consumed: raw.len(),
            produced: BLOCK_HEADER_LEN + payload.produced,
            crc32: payload.crc32,
        })
    }

    pub fn decompress_payload(
        &mut self,
        header: &BlockHeader,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<BlockProgress, CodecError> {
        if header.kind != BlockKind::Data {
            return Err(CodecError::InvalidHeader("not a data block"));
        }
        let raw_len = header.raw_len as usize;
        if out.len() < raw_len {
            return Err(CodecError::OutputTooSmall);
        }
        if payload.len() != header.comp_len as usize {
            return Err(CodecError::Corrupt("payload length does not match header"));
        }

        let progress = self
            .inflate_payload(header.algorithm, payload, &mut out[..raw_len])
            .map_err(|error| match error {
                CodecError::OutputTooSmall => CodecError::Corrupt("decoded length exceeds header"),
                other => other,
            })?;
        if progress.produced != raw_len {
            return Err(CodecError::Corrupt("decoded length does not match header"));
        }
        if progress.consumed != payload.len() {
            return Err(CodecError::Corrupt("trailing bytes after payload"));
        }
        if progress.crc32 != header.crc32 {
            return Err(CodecError::Corrupt("crc32 mismatch"));
        }

        self.blocks_decompressed = self.blocks_decompressed.saturating_add(1);
        Ok(progress)
    }

    /// Inflates a payload whose decoded size is unknown, stopping at the end
    /// of the deflate stream. Fails with `OutputTooSmall` when `out` fills up
    /// first.
    pub fn inflate_payload(
        &mut self,
        algorithm: Algorithm,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<BlockProgress, CodecError> {
        if algorithm == self.decompress_algorithm {
            self.decompress.reset(algorithm.zlib_header());
        } else {
            self.decompress = Decompress::new(algorithm.zlib_header());
            self.decompress_algorithm = algorithm;
        }

        loop {
            let consumed = self.decompress.total_in() as usize;
            let produced = self.decompress.total_out() as usize;
            let status = self
                .decompress
                .decompress(&payload[consumed..], &mut out[produced..], FlushDecompress::Finish)
                .map_err(|_| CodecError::Corrupt("invalid deflate payload"))?;
            if status == Status::StreamEnd {
                break;
            }
            let progressed = self.decompress.total_in() as usize != consumed
                || self.decompress.total_out() as usize != produced;
            if !progressed {
                if self.decompress.total_out() as usize == out.len() {
                    return Err(CodecError::OutputTooSmall);
                }
                return Err(CodecError::Corrupt("truncated payload"));
            }
        }

        let produced = self.decompress.total_out() as usize;
        Ok(BlockProgress {
            consumed: self.decompress.total_in() as usize,
            produced,
            crc32: crc32fast::hash(&out[..produced]),
        })
    }

    pub fn decompress_block(
        &mut self,
        block: &[u8],
        out: &mut [u8],
    ) -> Result<Option<(BlockHeader, BlockProgress)>, CodecError> {
        let Some(header) = BlockHeader::parse(block)? else {
            return Ok(None);
        };
        if block.len() < header.framed_len() {
            return Ok(None);
        }
        let payload = &block[BLOCK_HEADER_LEN..header.framed_len()];
        let progress = self.decompress_payload(&header, payload, out)?;
        Ok(Some((
            header,
            BlockProgress {
                consumed: header.framed_len(),
                produced: progress.produced,
                crc32: progress.crc32,
            },
        )))
    }
}

pub fn encode_stream_on_cpu(
    input: &[u8],
    algorithm: Algorithm,
    level: u32,
    chunk_size: usize,
) -> Result<Vec<u8>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::InvalidHeader("chunk_size must be greater than 0"));
    }
    let mut stream = SoftwareStream::new(algorithm, level)?;
    let mut checksum = StreamChecksum::new();
    let mut out = Vec::with_capacity(max_block_len(input.len()) + BLOCK_HEADER_LEN);
    let mut scratch = vec![0_u8; max_block_len(chunk_size)];

    for raw in input.chunks(chunk_size) {
        let progress = stream.compress_block(raw, &mut scratch)?;
        out.extend_from_slice(&scratch[..progress.produced]);
        checksum.combine_chunk(progress.crc32, raw.len());
    }
    out.extend_from_slice(&checksum.trailer(algorithm).encode());
    Ok(out)
}

pub fn decode_stream_on_cpu(stream: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = SoftwareStream::new(Algorithm::Deflate, MIN_LEVEL)?;
    let mut checksum = StreamChecksum::new();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor < stream.len() {
        let header = BlockHeader::parse(&stream[cursor..])?
            .ok_or(CodecError::Corrupt("truncated block header"))?;
        if header.kind == BlockKind::Trailer {
            if !checksum.matches_trailer(&header) {
                return Err(CodecError::Corrupt("stream trailer mismatch"));
            }
            checksum.reset();
            cursor += BLOCK_HEADER_LEN;
            continue;
        }

        let end = cursor
            .checked_add(header.framed_len())
            .ok_or(CodecError::Corrupt("block length overflow"))?;
        if end > stream.len() {
            return Err(CodecError::Corrupt("truncated block payload"));
        }
        let start = out.len();
        out.resize(start + header.raw_len as usize, 0);
        let progress = decoder.decompress_payload(
            &header,
            &stream[cursor + BLOCK_HEADER_LEN..end],
            &mut out[start..],
        )?;
        checksum.combine_chunk(progress.crc32, progress.produced);
        cursor = end;
    }

    if checksum.total_len() != 0 {
        return Err(CodecError::Corrupt("stream ended without trailer"));
    }
    Ok(out)
}
