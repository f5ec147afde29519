use std::hint;

/// An [exponential backoff] for spin loops.
///
/// Spins with an exponentially increasing number of [`hint::spin_loop`]
/// calls up to a maximum exponent, then holds steady there.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

impl Backoff {
    /// The default maximum exponent (2^8 spins per call).
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// # Panics
    ///
    /// Panics if `max` is larger than [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        assert!(max <= Self::DEFAULT_MAX_EXPONENT);
        Self { exp: 0, max }
    }

    /// Spin, issuing `2^exp` pause instructions, then grow the exponent.
    #[inline(always)]
    pub fn spin(&mut self) {
        let spins = 1_u32 << self.exp;
        for _ in 0..spins {
            hint::spin_loop();
        }
        if self.exp < self.max {
            self.exp += 1;
        }
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
