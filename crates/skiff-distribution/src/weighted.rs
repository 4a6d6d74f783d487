//! Weighted striping: blocks are assigned proportionally to server weights.

use crate::{DEFAULT_BLOCK_SIZE, Distribution, DistributionDocument, Stride, chunk, clamp_block_size};

/// Assigns block `b` by reducing `b` modulo the weight sum and walking the
/// cumulative weights: a server with weight 2 owns twice as many slots per
/// cycle as a server with weight 1.
#[derive(Debug)]
pub struct Weighted {
    block_size: u64,
    weights: Vec<u32>,
    remaining: u64,
    offset: u64,
}

impl Weighted {
    pub fn new(server_count: u32) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            weights: vec![1; server_count.max(1) as usize],
            remaining: 0,
            offset: 0,
        }
    }

    fn server_for_block(&self, block: u64) -> u32 {
        let total: u64 = self.weights.iter().map(|&w| u64::from(w)).sum();
        // All-zero weights degrade to plain round-robin.
        if total == 0 {
            return (block % self.weights.len() as u64) as u32;
        }

        let mut slot = block % total;
        for (index, &weight) in self.weights.iter().enumerate() {
            let weight = u64::from(weight);
            if slot < weight {
                return index as u32;
            }
            slot -= weight;
        }
        unreachable!("slot is bounded by the weight sum");
    }
}

impl Distribution for Weighted {
    fn set(&mut self, key: &str, value: u64) {
        if key == "block-size" {
            self.block_size = clamp_block_size(value);
        }
    }

    fn set2(&mut self, key: &str, first: u64, second: u64) {
        if key == "weight" && (first as usize) < self.weights.len() {
            self.weights[first as usize] = second.min(u64::from(u32::MAX)) as u32;
        }
    }

    fn reset(&mut self, length: u64, offset: u64) {
        self.remaining = length;
        self.offset = offset;
    }

    fn next_stride(&mut self) -> Option<Stride> {
        let (block, length, offset) = chunk(&mut self.remaining, &mut self.offset, self.block_size)?;
        Some(Stride {
            index: self.server_for_block(block),
            length,
            offset,
            block_id: block,
        })
    }

    fn document(&self) -> DistributionDocument {
        DistributionDocument::Weighted {
            block_size: self.block_size,
            weights: self.weights.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_follow_weights() {
        let mut d = Weighted::new(3);
        d.set("block-size", 1024);
        d.set2("weight", 0, 1);
        d.set2("weight", 1, 2);
        d.set2("weight", 2, 1);
        d.reset(8 * 1024, 0);

        // Weight cycle of length 4: server 0 once, server 1 twice, server 2 once.
        let indices: Vec<u32> = std::iter::from_fn(|| d.next_stride().map(|s| s.index)).collect();
        assert_eq!(indices, vec![0, 1, 1, 2, 0, 1, 1, 2]);
    }

    #[test]
    fn test_proportional_distribution_over_many_blocks() {
        let mut d = Weighted::new(2);
        d.set("block-size", 1024);
        d.set2("weight", 0, 1);
        d.set2("weight", 1, 3);
        d.reset(1024 * 1000, 0);

        let mut counts = [0u64; 2];
        while let Some(stride) = d.next_stride() {
            counts[stride.index as usize] += 1;
        }
        assert_eq!(counts[0], 250);
        assert_eq!(counts[1], 750);
    }

    #[test]
    fn test_zero_weights_degrade_to_round_robin() {
        let mut d = Weighted::new(2);
        d.set("block-size", 1024);
        d.set2("weight", 0, 0);
        d.set2("weight", 1, 0);
        d.reset(4096, 0);

        let indices: Vec<u32> = std::iter::from_fn(|| d.next_stride().map(|s| s.index)).collect();
        assert_eq!(indices, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_out_of_range_weight_index_ignored() {
        let mut d = Weighted::new(2);
        d.set2("weight", 5, 100);
        d.reset(10, 0);
        assert!(d.next_stride().unwrap().index < 2);
    }
}
