use sonoscope_foundation::WindowKind;

/// Compute window coefficients for the given kind and length. Callers
/// cache the result per (kind, size) and only recompute on change.
pub fn coefficients(kind: WindowKind, size: usize) -> Vec<f32> {
    let n = size.max(1);
    let denom = (n - 1).max(1) as f32;
    (0..n)
        .map(|i| {
            let x = i as f32 / denom;
            match kind {
                WindowKind::Hann => 0.5 * (1.0 - (std::f32::consts::TAU * x).cos()),
                WindowKind::Hamming => 0.54 - 0.46 * (std::f32::consts::TAU * x).cos(),
                WindowKind::Blackman => {
                    0.42 - 0.5 * (std::f32::consts::TAU * x).cos()
                        + 0.08 * (2.0 * std::f32::consts::TAU * x).cos()
                }
                WindowKind::Rectangular => 1.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_endpoints_are_zero() {
        let w = coefficients(WindowKind::Hann, 1024);
        assert!(w[0].abs() < 1e-6);
        assert!(w[1023].abs() < 1e-6);
        // Peak at the center
        assert!((w[511] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn hamming_endpoints_are_raised() {
        let w = coefficients(WindowKind::Hamming, 512);
        assert!((w[0] - 0.08).abs() < 1e-4);
        assert!((w[511] - 0.08).abs() < 1e-4);
    }

    #[test]
    fn blackman_is_near_zero_at_edges() {
        let w = coefficients(WindowKind::Blackman, 512);
        assert!(w[0].abs() < 1e-4);
    }

    #[test]
    fn rectangular_is_all_ones() {
        let w = coefficients(WindowKind::Rectangular, 64);
        assert!(w.iter().all(|&c| c == 1.0));
    }

    #[test]
    fn coefficients_are_deterministic() {
        let a = coefficients(WindowKind::Hann, 8192);
        let b = coefficients(WindowKind::Hann, 8192);
        assert_eq!(a, b);
    }
}
