//! Byte-range striping strategies.
//!
//! A [`Distribution`] partitions an object's byte range across the
//! configured object servers. After `reset(length, offset)` the distribution
//! acts as an iterator: each [`next_stride`](Distribution::next_stride)
//! yields the server index, length, logical offset, and block id of the next
//! stride until the range `[offset, offset + length)` is covered.
//!
//! Three variants exist: [`RoundRobin`] cycles blocks through the servers,
//! [`SingleServer`] sends everything to one server, and [`Weighted`] assigns
//! blocks proportionally to per-server weights. The variant and its
//! parameters serialize to a tagged [`DistributionDocument`] so a stored
//! object can record how its bytes were spread.

mod round_robin;
mod single_server;
mod weighted;

use serde::{Deserialize, Serialize};

pub use round_robin::RoundRobin;
pub use single_server::SingleServer;
pub use weighted::Weighted;

/// Upper bound for any distribution's block size.
pub const STRIPE_CAP: u64 = 4 * 1024 * 1024;

/// Default block size when none is configured.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// One stride of a distributed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    /// Object server that stores this stride.
    pub index: u32,
    /// Stride length in bytes.
    pub length: u64,
    /// Logical offset of the stride within the object.
    pub offset: u64,
    /// Index of the block the stride falls into.
    pub block_id: u64,
}

/// A striping strategy with iterator state.
///
/// Implementations are single-owner values; resetting reinitializes the
/// iterator for a new byte range.
pub trait Distribution: Send + std::fmt::Debug {
    /// Set a variant-specific `u64` parameter (`"block-size"`,
    /// `"start-index"`, `"index"`). Unknown keys are ignored.
    fn set(&mut self, key: &str, value: u64);

    /// Set a variant-specific parameter pair (`"weight"` takes the server
    /// index and its weight). Unknown keys are ignored.
    fn set2(&mut self, key: &str, first: u64, second: u64);

    /// Initialize the iterator for `length` bytes starting at `offset`.
    fn reset(&mut self, length: u64, offset: u64);

    /// Yield the next stride, or `None` once the range is exhausted.
    fn next_stride(&mut self) -> Option<Stride>;

    /// Snapshot the variant and its parameters for serialization.
    fn document(&self) -> DistributionDocument;
}

/// Distribution variants selectable at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    RoundRobin,
    SingleServer,
    Weighted,
}

/// Serialized form of a distribution: the variant tag plus its parameters.
///
/// The tag decides which deserializer runs in [`from_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DistributionDocument {
    RoundRobin { block_size: u64, start_index: u32 },
    SingleServer { block_size: u64, index: u32 },
    Weighted { block_size: u64, weights: Vec<u32> },
}

/// Create a distribution of the given kind for a server count.
pub fn new_distribution(kind: Kind, server_count: u32) -> Box<dyn Distribution> {
    match kind {
        Kind::RoundRobin => Box::new(RoundRobin::new(server_count)),
        Kind::SingleServer => Box::new(SingleServer::new(server_count)),
        Kind::Weighted => Box::new(Weighted::new(server_count)),
    }
}

/// Rebuild a distribution from its serialized document.
pub fn from_document(
    document: &DistributionDocument,
    server_count: u32,
) -> Box<dyn Distribution> {
    match document {
        DistributionDocument::RoundRobin {
            block_size,
            start_index,
        } => {
            let mut d = RoundRobin::new(server_count);
            d.set("block-size", *block_size);
            d.set("start-index", u64::from(*start_index));
            Box::new(d)
        }
        DistributionDocument::SingleServer { block_size, index } => {
            let mut d = SingleServer::new(server_count);
            d.set("block-size", *block_size);
            d.set("index", u64::from(*index));
            Box::new(d)
        }
        DistributionDocument::Weighted {
            block_size,
            weights,
        } => {
            let mut d = Weighted::new(server_count);
            d.set("block-size", *block_size);
            for (index, weight) in weights.iter().enumerate() {
                d.set2("weight", index as u64, u64::from(*weight));
            }
            Box::new(d)
        }
    }
}

/// Clamp a configured block size to the stripe cap, rejecting zero.
pub(crate) fn clamp_block_size(value: u64) -> u64 {
    if value == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        if value > STRIPE_CAP {
            tracing::debug!(value, cap = STRIPE_CAP, "block size clamped to stripe cap");
        }
        value.min(STRIPE_CAP)
    }
}

/// Shared stride-chunking step: emit the next stride of `[offset, ...)`
/// bounded by the remaining length and the current block boundary.
pub(crate) fn chunk(
    remaining: &mut u64,
    offset: &mut u64,
    block_size: u64,
) -> Option<(u64, u64, u64)> {
    if *remaining == 0 {
        return None;
    }

    let block = *offset / block_size;
    let displacement = *offset % block_size;
    let length = (*remaining).min(block_size - displacement);
    let stride_offset = *offset;

    *offset += length;
    *remaining -= length;

    Some((block, length, stride_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every variant must cover `[offset, offset + length)` exactly, with
    /// non-overlapping strides in ascending offset order.
    fn assert_covers(distribution: &mut dyn Distribution, length: u64, offset: u64) {
        distribution.reset(length, offset);
        let mut expected_offset = offset;
        let mut total = 0;
        while let Some(stride) = distribution.next_stride() {
            assert_eq!(stride.offset, expected_offset, "strides must be contiguous");
            assert!(stride.length > 0);
            expected_offset += stride.length;
            total += stride.length;
        }
        assert_eq!(total, length);
        assert_eq!(expected_offset, offset + length);
    }

    #[test]
    fn test_all_variants_cover_range() {
        for kind in [Kind::RoundRobin, Kind::SingleServer, Kind::Weighted] {
            let mut d = new_distribution(kind, 3);
            d.set("block-size", 1024);
            assert_covers(d.as_mut(), 10_000, 0);
            assert_covers(d.as_mut(), 10_000, 12_345);
            assert_covers(d.as_mut(), 1, 1023);
            assert_covers(d.as_mut(), 0, 0);
        }
    }

    #[test]
    fn test_block_size_clamped_to_stripe_cap() {
        let mut d = RoundRobin::new(2);
        d.set("block-size", STRIPE_CAP * 4);
        d.reset(STRIPE_CAP * 2, 0);
        let stride = d.next_stride().unwrap();
        assert_eq!(stride.length, STRIPE_CAP);
    }

    #[test]
    fn test_document_round_trip() {
        let mut d = Weighted::new(3);
        d.set("block-size", 65536);
        d.set2("weight", 0, 1);
        d.set2("weight", 1, 2);
        d.set2("weight", 2, 3);

        let document = d.document();
        let bytes = postcard::to_allocvec(&document).unwrap();
        let decoded: DistributionDocument = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, document);

        // The tag selects the deserializer; parameters survive.
        let mut rebuilt = from_document(&decoded, 3);
        d.reset(1_000_000, 0);
        rebuilt.reset(1_000_000, 0);
        loop {
            let a = d.next_stride();
            let b = rebuilt.next_stride();
            assert_eq!(a, b);
            if a.is_none() {
                break;
            }
        }
    }

    #[test]
    fn test_document_tags() {
        let rr = RoundRobin::new(2).document();
        assert!(matches!(rr, DistributionDocument::RoundRobin { .. }));
        let ss = SingleServer::new(2).document();
        assert!(matches!(ss, DistributionDocument::SingleServer { .. }));
        let w = Weighted::new(2).document();
        assert!(matches!(w, DistributionDocument::Weighted { .. }));
    }
}
