//! Utilities for adding a bit of jitter to reduce synchronized retries

use std::time::Duration;

/// A type that can jitter a delay
pub trait JitterSource {
    /// Jitters the given delay
    fn jitter(&mut self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, delay: Duration) -> Duration {
        delay
    }
}

mod random {
    use super::JitterSource;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    /// Jitters a delay later by a random amount
    ///
    /// Delays jittered by this type gain a uniformly distributed addend in
    /// the interval `[0, max_addend)`.
    #[derive(Debug)]
    pub struct RandomAdditiveJitter<R = rand::rngs::StdRng> {
        max_addend: Duration,
        rand_source: R,
    }

    impl RandomAdditiveJitter<rand::rngs::StdRng> {
        /// Constructs a new instance adding up to `max_addend` of jitter
        pub fn new(max_addend: Duration) -> Self {
            Self {
                max_addend,
                rand_source: rand::rngs::StdRng::from_rng(rand::thread_rng()).unwrap(),
            }
        }
    }

    impl<R: Rng> JitterSource for RandomAdditiveJitter<R> {
        fn jitter(&mut self, delay: Duration) -> Duration {
            let max_millis = self.max_addend.as_millis() as u64;
            if max_millis == 0 {
                return delay;
            }
            delay + Duration::from_millis(self.rand_source.gen_range(0..max_millis))
        }
    }
}

pub use random::RandomAdditiveJitter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_jitter_is_additive_and_bounded() {
        let mut jitter = RandomAdditiveJitter::new(Duration::from_millis(250));
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.jitter(base);
            assert!(jittered >= base);
            assert!(jittered < base + Duration::from_millis(250));
        }
    }

    #[test]
    fn zero_addend_is_a_no_op() {
        let mut jitter = RandomAdditiveJitter::new(Duration::ZERO);
        assert_eq!(jitter.jitter(Duration::from_secs(2)), Duration::from_secs(2));
    }
}
