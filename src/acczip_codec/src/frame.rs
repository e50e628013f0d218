use super::*;

pub const BLOCK_MAGIC: [u8; 2] = *b"AZ";
pub const BLOCK_VERSION: u8 = 1;
pub const BLOCK_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    Trailer,
}

impl BlockKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Trailer => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Trailer),
            _ => Err(CodecError::InvalidHeader("unknown block kind")),
        }
    }
}

/// Fixed 16-byte header in front of every block.
///
/// ```text
/// 0..2   magic "AZ"
/// 2      version
/// 3      kind (high nibble) | algorithm (low nibble)
/// 4..8   raw_len   (u32 LE)
/// 8..12  comp_len  (u32 LE)
/// 12..16 crc32     (u32 LE)
/// ```
///
/// A trailer carries the combined CRC-32 of the whole stream and its length
/// modulo 2^32, with `comp_len == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BlockKind,
    pub algorithm: Algorithm,
    pub raw_len: u32,
    pub comp_len: u32,
    pub crc32: u32,
}

impl BlockHeader {
    pub fn data(
        algorithm: Algorithm,
        raw_len: usize,
        comp_len: usize,
        crc32: u32,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            kind: BlockKind::Data,
            algorithm,
            raw_len: u32::try_from(raw_len).map_err(|_| CodecError::DataTooLarge)?,
            comp_len: u32::try_from(comp_len).map_err(|_| CodecError::DataTooLarge)?,
            crc32,
        })
    }

    pub fn trailer(algorithm: Algorithm, total_len: u64, crc32: u32) -> Self {
        Self {
            kind: BlockKind::Trailer,
            algorithm,
            raw_len: total_len as u32,
            comp_len: 0,
            crc32,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0_u8; BLOCK_HEADER_LEN];
        out[..2].copy_from_slice(&BLOCK_MAGIC);
        out[2] = BLOCK_VERSION;
        out[3] = (self.kind.to_u8() << 4) | self.algorithm.to_u8();
        out[4..8].copy_from_slice(&self.raw_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.comp_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    pub fn write_to(&self, out: &mut [u8]) -> Result<(), CodecError> {
        let dst = out
            .get_mut(..BLOCK_HEADER_LEN)
            .ok_or(CodecError::OutputTooSmall)?;
        dst.copy_from_slice(&self.encode());
        Ok(())
    }

    /// Returns `Ok(None)` while fewer than [`BLOCK_HEADER_LEN`] bytes are
    /// available and the bytes seen so far are still a plausible prefix.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, CodecError> {
        let magic_seen = bytes.len().min(BLOCK_MAGIC.len());
        if bytes[..magic_seen] != BLOCK_MAGIC[..magic_seen] {
            return Err(CodecError::InvalidHeader("bad magic"));
        }
        if bytes.len() < BLOCK_HEADER_LEN {
            return Ok(None);
        }

        if bytes[2] != BLOCK_VERSION {
            return Err(CodecError::InvalidHeader("unsupported block version"));
        }

        let kind = BlockKind::from_u8(bytes[3] >> 4)?;
        let algorithm = Algorithm::from_u8(bytes[3] & 0x0f)?;
        let header = Self {
            kind,
            algorithm,
            raw_len: read_u32(bytes, 4)?,
            comp_len: read_u32(bytes, 8)?,
            crc32: read_u32(bytes, 12)?,
        };

        if header.kind == BlockKind::Trailer && header.comp_len != 0 {
            return Err(CodecError::InvalidHeader("trailer carries a payload"));
        }
        if header.kind == BlockKind::Data && header.comp_len == 0 {
            return Err(CodecError::InvalidHeader("data block without payload"));
        }

        Ok(Some(header))
    }

    pub fn framed_len(&self) -> usize {
        BLOCK_HEADER_LEN + self.comp_len as usize
    }
}

pub fn max_payload_len(raw_len: usize) -> usize {
    raw_len
        .saturating_add(raw_len >> 3)
        .saturating_add(128)
}

pub fn max_block_len(raw_len: usize) -> usize {
    BLOCK_HEADER_LEN.saturating_add(max_payload_len(raw_len))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, CodecError> {
    let end = offset
        .checked_add(4)
        .ok_or(CodecError::InvalidHeader("u32 overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(CodecError::InvalidHeader("u32 out of range"))?;
    let array: [u8; 4] = slice
        .try_into()
        .map_err(|_| CodecError::InvalidHeader("u32 parse failed"))?;
    Ok(u32::from_le_bytes(array))
}
