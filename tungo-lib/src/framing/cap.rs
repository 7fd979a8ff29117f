use super::FrameError;

/// Largest payload length a single framed record may carry. The length
/// prefix is a u16, so the cap can never exceed 65 535.
pub const MAX_FRAME_CAP: i64 = u16::MAX as i64;

/// Validated upper bound for framed record payloads.
///
/// Lengths arrive from configuration as TOML integers (i64), so
/// validation accepts i64 and rejects non-positive and out-of-range
/// values before they can reach the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCap(u16);

impl FrameCap {
    pub fn new(cap: i64) -> Result<Self, FrameError> {
        if cap <= 0 {
            return Err(FrameError::ZeroCap);
        }
        if cap > MAX_FRAME_CAP {
            return Err(FrameError::CapExceeded { len: cap, cap: MAX_FRAME_CAP as usize });
        }
        Ok(Self(cap as u16))
    }

    /// Check a prospective payload length against the cap.
    pub fn validate_len(&self, len: i64) -> Result<(), FrameError> {
        if len < 0 {
            return Err(FrameError::NegativeLength(len));
        }
        if len > i64::from(self.0) {
            return Err(FrameError::CapExceeded { len, cap: self.get() });
        }
        Ok(())
    }

    pub fn get(&self) -> usize {
        usize::from(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_negative_caps() {
        assert!(matches!(FrameCap::new(0), Err(FrameError::ZeroCap)));
        assert!(matches!(FrameCap::new(-1), Err(FrameError::ZeroCap)));
    }

    #[test]
    fn rejects_caps_beyond_u16() {
        assert!(matches!(
            FrameCap::new(65_536),
            Err(FrameError::CapExceeded { .. })
        ));
    }

    #[test]
    fn accepts_full_u16_range() {
        let cap = FrameCap::new(65_535).unwrap();
        assert_eq!(cap.get(), 65_535);
        assert!(FrameCap::new(1).is_ok());
    }

    #[test]
    fn validate_len_rejects_negative() {
        let cap = FrameCap::new(1518).unwrap();
        assert!(matches!(
            cap.validate_len(-5),
            Err(FrameError::NegativeLength(-5))
        ));
    }

    #[test]
    fn validate_len_rejects_oversize() {
        let cap = FrameCap::new(1518).unwrap();
        assert!(matches!(
            cap.validate_len(1519),
            Err(FrameError::CapExceeded { len: 1519, cap: 1518 })
        ));
        assert!(cap.validate_len(1518).is_ok());
        assert!(cap.validate_len(0).is_ok());
    }
}
