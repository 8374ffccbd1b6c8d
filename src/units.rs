//! Conversion between millimetres and the device's native integer unit.
//!
//! The controller counts in tenths of a micrometre. Its firmware cannot take
//! a target whose last decimal digit is 3, so every conversion into device
//! units nudges such values up by one unit (0.1 µm). Every value sent to the
//! device as a distance must go through [`to_device_units`] (or
//! [`format_mm`]) so the correction is never skipped.
//!
//! Values that are not finite, or too large to count in device units, are
//! rejected with an [`InvalidArgumentError`] before anything is sent.

use crate::error::InvalidArgumentError;

/// Device units per millimetre.
pub const UNIT_SCALE: f64 = 10_000.0;

/// The largest magnitude, in device units, that converts exactly: 2^53.
pub const MAX_DEVICE_UNITS: i64 = 1 << 53;

fn check_finite(value: f64) -> Result<f64, InvalidArgumentError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InvalidArgumentError::new(format!("{value} is not a finite number")))
    }
}

/// Convert a distance in millimetres to device units.
///
/// The result is `round(mm * UNIT_SCALE)`, plus one if that would end in the
/// digit 3. The sign is ignored when looking at the last digit, so `-13`
/// becomes `-12`.
///
/// NaN, infinities and distances beyond [`MAX_DEVICE_UNITS`] are rejected.
///
/// ## Example
///
/// ```
/// # use asistage::units::to_device_units;
/// assert_eq!(to_device_units(12.5).unwrap(), 125_000);
/// assert_eq!(to_device_units(0.0003).unwrap(), 4);
/// assert!(to_device_units(f64::NAN).is_err());
/// ```
pub fn to_device_units(mm: f64) -> Result<i64, InvalidArgumentError> {
    let scaled = (check_finite(mm)? * UNIT_SCALE).round();
    if scaled.abs() > MAX_DEVICE_UNITS as f64 {
        return Err(InvalidArgumentError::new(format!(
            "{mm} mm is out of range"
        )));
    }
    let units = scaled as i64;
    if units.unsigned_abs() % 10 == 3 {
        Ok(units + 1)
    } else {
        Ok(units)
    }
}

/// Convert device units to millimetres.
pub fn from_device_units(units: i64) -> f64 {
    units as f64 / UNIT_SCALE
}

/// Format a distance in millimetres for commands that take millimetres,
/// such as soft limits and backlash.
///
/// The value is passed through [`to_device_units`] first so that it never
/// lands on a forbidden encoding, then printed with the controller's four
/// decimal places.
pub fn format_mm(mm: f64) -> Result<String, InvalidArgumentError> {
    Ok(format!("{:.4}", from_device_units(to_device_units(mm)?)))
}

/// Format a parameter that is not a distance, such as a speed, with four
/// decimal places.
pub fn format_value(value: f64) -> Result<String, InvalidArgumentError> {
    Ok(format!("{:.4}", check_finite(value)?))
}
