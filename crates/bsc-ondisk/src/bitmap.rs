//! Free space bitmap decoding.
//!
//! A `FREE_SPACE_BITMAP` item keyed `(start, FREE_SPACE_BITMAP, length)`
//! carries one bit per sector of `[start, start + length)`, least significant
//! bit first within each byte. A set bit means the sector is free. A maximal
//! run of set bits is one free extent, and runs continue across consecutive
//! bitmap items, so decoding is stateful: see [`BitRunCollector`].

use crate::btrfs::FreeExtent;

/// Get bit `idx` from a bitmap byte slice. Bits past the end read as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    let bit_idx = idx % 8;
    match bitmap.get(byte_idx) {
        Some(byte) => (byte >> bit_idx) & 1 == 1,
        None => false,
    }
}

/// Collapses runs of set bits spanning one or more bitmap items into extents.
#[derive(Debug, Clone, Default)]
pub struct BitRunCollector {
    run_start: Option<u64>,
}

impl BitRunCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one bitmap item whose first bit covers byte offset `base`.
    ///
    /// Returns the runs that ended inside this item, in address order. A run
    /// still open at the end of the item stays pending for the next item or
    /// for [`BitRunCollector::finish`].
    pub fn push_item(&mut self, base: u64, unit: u32, bits: &[u8], num_bits: u64) -> Vec<FreeExtent> {
        let unit = u64::from(unit);
        let mut closed = Vec::new();
        for idx in 0..num_bits {
            let offset = base.saturating_add(idx.saturating_mul(unit));
            let bit = bitmap_get(bits, idx);
            match (self.run_start, bit) {
                (Some(start), false) => {
                    closed.push(FreeExtent::new(start, offset - start));
                    self.run_start = None;
                }
                (None, true) => self.run_start = Some(offset),
                _ => {}
            }
        }
        closed
    }

    /// Close a pending run at `end` (the end of the block group).
    pub fn finish(&mut self, end: u64) -> Option<FreeExtent> {
        self.run_start
            .take()
            .map(|start| FreeExtent::new(start, end.saturating_sub(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: u32 = 4096;

    #[test]
    fn bitmap_get_lsb_first() {
        let bitmap = [0b0000_0101_u8, 0b1000_0000];
        assert!(bitmap_get(&bitmap, 0));
        assert!(!bitmap_get(&bitmap, 1));
        assert!(bitmap_get(&bitmap, 2));
        assert!(bitmap_get(&bitmap, 15));
        assert!(!bitmap_get(&bitmap, 16));
        assert!(!bitmap_get(&bitmap, u64::MAX));
    }

    #[test]
    fn runs_inside_one_item() {
        let mut collector = BitRunCollector::new();
        // bits 1..3 set, bit 5 set, bit 7 set (open at the end)
        let bits = [0b1010_0110_u8];
        let runs = collector.push_item(1 << 20, UNIT, &bits, 8);
        assert_eq!(
            runs,
            vec![
                FreeExtent::new((1 << 20) + 4096, 2 * 4096),
                FreeExtent::new((1 << 20) + 5 * 4096, 4096),
            ]
        );
        assert_eq!(
            collector.finish((1 << 20) + 8 * 4096),
            Some(FreeExtent::new((1 << 20) + 7 * 4096, 4096))
        );
        assert_eq!(collector.finish(0), None);
    }

    #[test]
    fn run_continues_across_items() {
        let mut collector = BitRunCollector::new();
        let first = collector.push_item(0, UNIT, &[0b1100_0000], 8);
        assert!(first.is_empty());
        let second = collector.push_item(8 * 4096, UNIT, &[0b0000_0011], 8);
        assert_eq!(second, vec![FreeExtent::new(6 * 4096, 4 * 4096)]);
        assert_eq!(collector.finish(16 * 4096), None);
    }

    #[test]
    fn num_bits_limits_decoding() {
        let mut collector = BitRunCollector::new();
        // Only the first 4 bits are meaningful; the set high bits are ignored.
        let runs = collector.push_item(0, UNIT, &[0b1111_0001], 4);
        assert_eq!(runs, vec![FreeExtent::new(0, 4096)]);
        assert_eq!(collector.finish(4 * 4096), None);
    }
}
