use super::*;

#[derive(Debug, Clone, Default)]
pub struct StreamChecksum {
    hasher: crc32fast::Hasher,
    total_len: u64,
}

impl StreamChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.total_len = self.total_len.saturating_add(bytes.len() as u64);
    }

    pub fn combine_chunk(&mut self, crc32: u32, len: usize) {
        let chunk = crc32fast::Hasher::new_with_initial_len(crc32, len as u64);
        self.hasher.combine(&chunk);
        self.total_len = self.total_len.saturating_add(len as u64);
    }

    pub fn crc32(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn trailer(&self, algorithm: Algorithm) -> BlockHeader {
        BlockHeader::trailer(algorithm, self.total_len, self.crc32())
    }

    pub fn matches_trailer(&self, header: &BlockHeader) -> bool {
        header.kind == BlockKind::Trailer
            && header.crc32 == self.crc32()
            && header.raw_len == self.total_len as u32
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
