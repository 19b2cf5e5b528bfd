//! Saturating statistics counters.

/// A counter that pegs at `u32::MAX` instead of wrapping. Several legacy
/// diagnostic replies truncate it to 16 bits, which also saturates.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatCounter(u32);

impl StatCounter {
    pub fn bump(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn add(&mut self, other: StatCounter) {
        self.0 = self.0.saturating_add(other.0);
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_u16(self) -> u16 {
        self.0.min(u16::MAX as u32) as u16
    }
}

/// The six packet counters kept at both task and node level.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmitStats {
    pub usm_rcv: StatCounter,
    pub req_rcv: StatCounter,
    pub rpy_rcv: StatCounter,
    pub usm_xmt: StatCounter,
    pub req_xmt: StatCounter,
    pub rpy_xmt: StatCounter,
}

impl XmitStats {
    pub fn reset(&mut self) {
        *self = XmitStats::default();
    }

    pub fn total(&self) -> StatCounter {
        let mut sum = StatCounter::default();

        sum.add(self.usm_rcv);
        sum.add(self.req_rcv);
        sum.add(self.rpy_rcv);
        sum.add(self.usm_xmt);
        sum.add(self.req_xmt);
        sum.add(self.rpy_xmt);
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_instead_of_wrapping() {
        let mut c = StatCounter(u32::MAX - 1);

        c.bump();
        c.bump();
        assert_eq!(c.as_u32(), u32::MAX);
        assert_eq!(c.as_u16(), u16::MAX);
    }

    #[test]
    fn sixteen_bit_clamp() {
        let mut c = StatCounter::default();

        for _ in 0..70_000 {
            c.bump();
        }
        assert_eq!(c.as_u32(), 70_000);
        assert_eq!(c.as_u16(), u16::MAX);
    }
}
