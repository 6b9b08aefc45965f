//! Descriptive statistics over samples of measurements.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Arithmetic mean, or `None` for an empty sample.
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().mean())
    }
}

/// Population standard deviation (divides by `n`), or `None` for an empty sample. A single
/// sample has a standard deviation of zero.
pub fn population_std_dev(samples: &[f64]) -> Option<f64> {
    match samples.len() {
        0 => None,
        1 => Some(0.0),
        _ => Some(samples.iter().population_std_dev()),
    }
}

/// Mean and population standard deviation of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: f64,
    pub std_dev: f64,
    pub n: usize,
}

impl MeanStd {
    pub fn of(samples: &[f64]) -> Option<Self> {
        Some(Self {
            mean: mean(samples)?,
            std_dev: population_std_dev(samples)?,
            n: samples.len(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty() {
        assert_eq!(mean(&[]), None);
        assert_eq!(population_std_dev(&[]), None);
        assert_eq!(MeanStd::of(&[]), None);
    }

    #[test]
    fn single() {
        let s = MeanStd::of(&[0.25]).unwrap();
        assert_eq!(s.mean, 0.25);
        assert_eq!(s.std_dev, 0.0);
        assert_eq!(s.n, 1);
    }

    #[test]
    fn population() {
        // population std dev of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&xs).unwrap() - 5.0).abs() < 1e-12);
        assert!((population_std_dev(&xs).unwrap() - 2.0).abs() < 1e-12);
    }
}
