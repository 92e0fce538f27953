use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// Monotonically increasing number of a packet within its connection. Wrapped in a newtype to
///  keep it from being mixed up with stream offsets, which are u64 as well.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(u64);

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(raw: u64) -> PacketId {
        PacketId(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn checked_sub(self, rhs: u64) -> Option<PacketId> {
        self.0.checked_sub(rhs).map(PacketId)
    }
}

impl Add<u64> for PacketId {
    type Output = PacketId;

    fn add(self, rhs: u64) -> PacketId {
        PacketId(self.0 + rhs)
    }
}

impl AddAssign<u64> for PacketId {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1, None)]
    #[case(5, 3, Some(2))]
    #[case(5, 5, Some(0))]
    #[case(5, 6, None)]
    fn test_checked_sub(#[case] raw: u64, #[case] sub: u64, #[case] expected: Option<u64>) {
        assert_eq!(PacketId::from_raw(raw).checked_sub(sub), expected.map(PacketId::from_raw));
    }

    #[test]
    fn test_add() {
        let mut id = PacketId::ZERO + 4;
        id += 1;
        assert_eq!(id, PacketId::from_raw(5));
        assert_eq!(id.to_raw(), 5);
    }
}
