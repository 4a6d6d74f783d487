//! Round-robin striping: blocks cycle through the servers in order.

use crate::{DEFAULT_BLOCK_SIZE, Distribution, DistributionDocument, Stride, chunk, clamp_block_size};

/// Cycles fixed-size blocks through the servers, starting at a configurable
/// index. Block `b` lands on server `(start_index + b) % server_count`; at
/// identical block boundaries the lower server index wins because blocks are
/// assigned in ascending order.
#[derive(Debug)]
pub struct RoundRobin {
    server_count: u32,
    block_size: u64,
    start_index: u32,
    remaining: u64,
    offset: u64,
}

impl RoundRobin {
    pub fn new(server_count: u32) -> Self {
        Self {
            server_count: server_count.max(1),
            block_size: DEFAULT_BLOCK_SIZE,
            start_index: 0,
            remaining: 0,
            offset: 0,
        }
    }
}

impl Distribution for RoundRobin {
    fn set(&mut self, key: &str, value: u64) {
        match key {
            "block-size" => self.block_size = clamp_block_size(value),
            "start-index" => self.start_index = (value % u64::from(self.server_count)) as u32,
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
        let index = ((u64::from(self.start_index) + block) % u64::from(self.server_count)) as u32;
        Some(Stride {
            index,
            length,
            offset,
            block_id: block,
        })
    }

    fn document(&self) -> DistributionDocument {
        DistributionDocument::RoundRobin {
            block_size: self.block_size,
            start_index: self.start_index,
        }
    }
}
