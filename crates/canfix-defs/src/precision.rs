//! Decimal precision for scaled values
//!
//! A UINT with multiplier 0.01 should print as `29.92`, not
//! `29.919999999999998`.

/// Number of decimal places implied by a multiplier
///
/// - 1.0 → 0
/// - 0.1 → 1
/// - 0.25 → 2
/// - 0.001 → 3
pub fn decimals_for(multiplier: f64) -> u8 {
    let m = multiplier.abs();
    if m == 0.0 {
        return 4;
    }
    if m >= 1.0 && (m - m.round()).abs() < 1e-9 {
        return 0;
    }

    let mut temp = m;
    let mut decimals = 0u8;
    while decimals < 6 {
        if (temp - temp.round()).abs() < 1e-9 {
            break;
        }
        temp *= 10.0;
        decimals += 1;
    }
    decimals
}

pub fn round_to(value: f64, decimals: u8) -> f64 {
    if decimals == 0 {
        value.round()
    } else {
        let factor = 10_f64.powi(decimals as i32);
        (value * factor).round() / factor
    }
}

/// Round a scaled value to the precision its multiplier carries
pub fn round_for_multiplier(value: f64, multiplier: f64) -> f64 {
    round_to(value, decimals_for(multiplier))
}
