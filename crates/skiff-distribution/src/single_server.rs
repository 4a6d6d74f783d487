//! Single-server placement: every byte goes to one chosen server.

use crate::{DEFAULT_BLOCK_SIZE, Distribution, DistributionDocument, Stride, chunk, clamp_block_size};

/// Sends all bytes to one server. Strides are still bounded by the block
/// size so block ids stay meaningful for range locking.
#[derive(Debug)]
pub struct SingleServer {
    server_count: u32,
    block_size: u64,
    index: u32,
    remaining: u64,
    offset: u64,
}

impl SingleServer {
    pub fn new(server_count: u32) -> Self {
        Self {
            server_count: server_count.max(1),
            block_size: DEFAULT_BLOCK_SIZE,
            index: 0,
            remaining: 0,
            offset: 0,
        }
    }
}

impl Distribution for SingleServer {
    fn set(&mut self, key: &str, value: u64) {
        match key {
            "block-size" => self.block_size = clamp_block_size(value),
            "index" => self.index = (value % u64::from(self.server_count)) as u32,
            _ => {}
        }
    }

    fn set2(&mut self, _key: &str, _first: u64, _second: u64) {}

    fn reset(&mut self, length: u64, offset: u64) {
        self.remaining = length;
        self.offset = offset;
    }

    fn next_stride(&mut self) -> Option<Stride> {
        let (block, length, offset) = chunk(&mut self.remaining, &mut self.offset, self.block_size)?;
        Some(Stride {
            index: self.index,
            length,
            offset,
            block_id: block,
        })
    }

    fn document(&self) -> DistributionDocument {
        DistributionDocument::SingleServer {
            block_size: self.block_size,
            index: self.index,
        }
    }
}
