//! Fixed-precision float comparison.
//!
//! Upstream sources report chapter numbers with inconsistent precision
//! (`12` vs `12.0` vs `12.04` for the same chapter), so chapter identity is
//! decided at one decimal place rather than by bitwise equality.

/// Rounds `x` to the closest value at `scale` decimal places.
pub fn scale_round(x: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (x * factor).round() / factor
}

/// Compares two floats at `scale` decimal places.
pub fn scale_equals(x: f64, y: f64, scale: u32) -> bool {
    scale_round(x, scale) == scale_round(y, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_one_decimal() {
        assert_eq!(scale_round(12.04, 1), 12.0);
        assert_eq!(scale_round(12.06, 1), 12.1);
        assert_eq!(scale_round(12.0, 1), 12.0);
        assert_eq!(scale_round(7.25, 1), 7.3);
    }

    #[test]
    fn equality_collides_within_tolerance() {
        assert!(scale_equals(12.0, 12.04, 1));
        assert!(scale_equals(12.0, 12.0, 1));
        assert!(scale_equals(5.5, 5.54, 1));
    }

    #[test]
    fn equality_separates_outside_tolerance() {
        // 12.06 rounds to 12.1, not 12.0
        assert!(!scale_equals(12.0, 12.06, 1));
        assert!(!scale_equals(3.0, 3.5, 1));
    }

    #[test]
    fn integers_and_their_float_forms_collide() {
        assert!(scale_equals(12.0, 12.000001, 1));
    }
}
