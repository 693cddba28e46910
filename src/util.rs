/// Arithmetic mean, `None` for an empty slice
pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        None
    } else {
        Some(data.iter().sum::<f64>() / data.len() as f64)
    }
}

/// Population standard deviation, `None` for an empty slice
pub fn std_dev(data: &[f64]) -> Option<f64> {
    let m = mean(data)?;
    let variance = data.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / data.len() as f64;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[10., 20., 30., 15., 22.]), Some(19.4));
        assert_eq!(mean(&[42.0]), Some(42.0));
        assert_eq!(mean(&[-10.0, 0.0, 10.0]), Some(0.0));
    }

    #[test]
    fn test_mean_empty_slice() {
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(std_dev(&[5.0, 5.0, 5.0, 5.0]), Some(0.0));
        let result = std_dev(&[0.2, 0.4, 0.6]).unwrap();
        assert!((result - 0.163299316185545).abs() < 1e-12);
        assert_eq!(std_dev(&[]), None);
    }
}
