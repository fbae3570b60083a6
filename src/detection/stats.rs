//! Small statistics helpers used by the detection rules.

use crate::error::{RampartError, Result};

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> Result<f64> {
    if values.is_empty() {
        return Err(RampartError::Detection("mean of empty sample".to_string()));
    }
    finite(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Result<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    finite(variance.sqrt())
}

/// Differences between consecutive values.
pub fn intervals(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

fn finite(value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RampartError::Detection(format!("non-finite statistic {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values).unwrap(), 5.0);
        assert_eq!(std_dev(&values).unwrap(), 2.0);
    }

    #[test]
    fn test_empty_sample_is_error() {
        assert!(mean(&[]).is_err());
        assert!(std_dev(&[]).is_err());
    }

    #[test]
    fn test_non_finite_is_error() {
        assert!(mean(&[f64::INFINITY, 1.0]).is_err());
    }

    #[test]
    fn test_intervals() {
        assert_eq!(intervals(&[1.0, 3.0, 6.0]), vec![2.0, 3.0]);
        assert!(intervals(&[1.0]).is_empty());
    }
}
