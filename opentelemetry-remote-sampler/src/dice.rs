//! Probabilistic sampling at a rate out of a fixed scale.
use rand::Rng;

/// A biased dice used for probabilistic sampling.
///
/// A roll succeeds when a uniform draw over `[0, scale)` falls below `rate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dice {
    scale: u32,
    rate: u32,
}

impl Dice {
    /// Create a dice, `rate` is clamped to `[0, scale]`.
    pub fn new(scale: u32, rate: u32) -> Self {
        Dice {
            scale,
            rate: rate.min(scale),
        }
    }

    /// Update the scale and or the rate of the dice.
    pub fn update(&mut self, scale: Option<u32>, rate: Option<u32>) {
        self.scale = scale.unwrap_or(self.scale);
        self.rate = rate.unwrap_or(self.rate).min(self.scale);
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Roll the dice using the thread local generator.
    pub fn roll(&self) -> bool {
        self.roll_with(&mut rand::rng())
    }

    /// Roll the dice using the given generator.
    pub fn roll_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.scale == 0 {
            return false;
        }
        rng.random_range(0..self.scale) < self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SAMPLE_RATE_SCALE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(SAMPLE_RATE_SCALE, true)]
    fn extremes(#[case] rate: u32, #[case] expected: bool) {
        let dice = Dice::new(SAMPLE_RATE_SCALE, rate);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1_000 {
            assert_eq!(dice.roll_with(&mut rng), expected);
        }
    }

    #[test]
    fn rate_is_clamped_to_scale() {
        let mut dice = Dice::new(100, 1_000);
        assert_eq!(dice.rate(), 100);

        dice.update(Some(10), None);
        assert_eq!(dice.scale(), 10);
        assert_eq!(dice.rate(), 10);

        dice.update(None, Some(5));
        assert_eq!(dice.rate(), 5);
    }

    #[test]
    fn zero_scale_never_succeeds() {
        let dice = Dice::new(0, 0);
        assert!(!dice.roll());
    }

    #[test]
    fn success_ratio_follows_rate() {
        let dice = Dice::new(SAMPLE_RATE_SCALE, SAMPLE_RATE_SCALE / 4);
        let mut rng = StdRng::seed_from_u64(7);
        let total = 100_000;
        let successes = (0..total).filter(|_| dice.roll_with(&mut rng)).count();
        let ratio = successes as f64 / total as f64;
        assert!((ratio - 0.25).abs() < 0.01, "ratio was {}", ratio);
    }
}
