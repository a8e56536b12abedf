//! Numeric series with the aggregate helpers used by analysis summaries.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// An ordered series of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatSeries(pub Vec<f64>);

impl FloatSeries {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, v: f64) {
        self.0.push(v);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Largest sample, 0 for an empty series.
    pub fn max(&self) -> f64 {
        self.0.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Smallest sample, 0 for an empty series.
    pub fn min(&self) -> f64 {
        self.0.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    /// Arithmetic mean over every sample, 0 for an empty series.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        self.0.iter().sum::<f64>() / self.0.len() as f64
    }
}

impl FromIterator<f64> for FloatSeries {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_series_aggregates_to_zero() {
        let s = FloatSeries::new();
        assert!(s.is_empty());
        assert!(s.max().abs() < f64::EPSILON);
        assert!(s.min().abs() < f64::EPSILON);
        assert!(s.avg().abs() < f64::EPSILON);
    }

    #[test]
    fn avg_counts_the_first_sample() {
        let s: FloatSeries = [10.0, 2.0, 3.0].into_iter().collect();
        assert!((s.avg() - 5.0).abs() < 1e-9);
        assert!((s.max() - 10.0).abs() < f64::EPSILON);
        assert!((s.min() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_samples() {
        let s = FloatSeries(vec![-1.0, -5.0]);
        assert!((s.max() + 1.0).abs() < f64::EPSILON);
        assert!((s.min() + 5.0).abs() < f64::EPSILON);
        assert!((s.avg() + 3.0).abs() < f64::EPSILON);
    }
}
