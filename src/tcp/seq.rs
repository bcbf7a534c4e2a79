use std::cmp::Ordering;
use std::ops::{Add, Sub};

const MAX_DIFF: u32 = u32::MAX / 2;

/// A TCP sequence number on the modulo-2^32 ring.
///
/// Comparisons are signed distances on the ring, so they stay correct
/// across wraparound within a connection's lifetime.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub struct SeqNum(pub u32);

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        let diff = self.0.wrapping_sub(other.0);
        if diff == 0 {
            Ordering::Equal
        } else if diff < MAX_DIFF {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl Add for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: Self) -> Self::Output {
        SeqNum(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: Self) -> Self::Output {
        SeqNum(self.0.wrapping_sub(rhs.0))
    }
}

impl SeqNum {
    pub fn add_num(self, n: u32) -> Self {
        SeqNum(self.0.wrapping_add(n))
    }

    /// Signed ring distance `self - other`.
    pub fn distance(self, other: SeqNum) -> i64 {
        self.0.wrapping_sub(other.0) as i32 as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_ordering() {
        assert!(SeqNum(1) < SeqNum(2));
        assert!(SeqNum(2) > SeqNum(1));
        assert_eq!(SeqNum(5), SeqNum(5));
        // across the wrap point
        assert!(SeqNum(u32::MAX) < SeqNum(0));
        assert!(SeqNum(u32::MAX - 10) < SeqNum(3));
        assert!(SeqNum(3) > SeqNum(u32::MAX - 10));
    }

    #[test]
    fn test_distance() {
        assert_eq!(SeqNum(10).distance(SeqNum(4)), 6);
        assert_eq!(SeqNum(4).distance(SeqNum(10)), -6);
        assert_eq!(SeqNum(2).distance(SeqNum(u32::MAX)), 3);
        assert_eq!(SeqNum(u32::MAX).distance(SeqNum(2)), -3);
    }

    #[test]
    fn test_add_wraps() {
        assert_eq!(SeqNum(u32::MAX).add_num(1), SeqNum(0));
        assert_eq!(SeqNum(u32::MAX).add_num(10), SeqNum(9));
        assert_eq!((SeqNum(7) - SeqNum(9)).0, u32::MAX - 1);
    }
}
