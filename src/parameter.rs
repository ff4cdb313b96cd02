//! Property model - typed, validated device settings.
//!
//! Every device exposes its settings as a list of [`Property`] records. A
//! property is rebuilt from the device's internal state on every read, so the
//! `value` a caller sees always reflects what the device will actually use.
//! Writes go through [`validate`] first; an invalid value is rejected at the
//! boundary and never stored.
//!
//! # Validation rules
//!
//! Checked in order, stopping at the first failure:
//!
//! 1. the candidate is non-empty (`"must send actual value"`)
//! 2. numeric types parse as a finite number (`"expected int"` / `"expected double"`)
//! 3. numeric types lie within `[min, max]` (`"outside of bounds"`)
//! 4. numeric types sit on the increment grid, to 5 decimal places of the
//!    quotient (`"not incremented by set value"`)
//! 5. strings fit `max_length` (`"exceeds max length"`)
//!
//! # Example
//!
//! ```rust
//! use lab_capture::parameter::{validate, DataType, PropertyBuilder};
//!
//! let decl = PropertyBuilder::new("scan_average", DataType::Int)
//!     .display_name("Scan Averaging")
//!     .range(1.0, 10000.0)
//!     .increment(1.0)
//!     .value("1")
//!     .build();
//!
//! assert!(validate(&decl, "25").is_ok());
//! assert!(validate(&decl, "2.5").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DeviceError, DeviceResult};

/// Quotient precision used by the increment check (5 decimal digits).
const INCREMENT_PRECISION: f64 = 1e5;

/// Value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Whole number (still validated as a float, then against the increment)
    Int,
    /// Floating point number
    Double,
    /// `"true"` / `"false"`
    Bool,
    /// Free text, bounded by `max_length`
    String,
    /// One of `possible_enum_values`
    Enum,
}

impl DataType {
    /// Whether bounds and increment rules apply.
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int | DataType::Double)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "int",
            DataType::Double => "double",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A device setting as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Stable key, e.g. `scan_average`
    pub id: String,
    /// Human readable label
    #[serde(rename = "userReadableName")]
    pub display_name: String,
    /// Value type
    pub data_type: DataType,
    /// Current value in string form
    pub value: String,
    /// Inclusive lower bound (numeric types)
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound (numeric types)
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step size (numeric types)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub increment: Option<f64>,
    /// Origin of the increment grid; zero when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub increment_base: Option<f64>,
    /// Maximum length in characters (strings)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Allowed values (enums)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possible_enum_values: Option<Vec<String>>,
    /// Display order among a device's properties
    pub order: u32,
}

/// Check a candidate value against a property declaration.
///
/// Pure function: the declaration is not modified and nothing is logged.
pub fn validate(decl: &Property, candidate: &str) -> DeviceResult<()> {
    if candidate.is_empty() {
        return Err(DeviceError::validation("must send actual value"));
    }

    match decl.data_type {
        DataType::Int | DataType::Double => {
            let value = parse_finite(candidate)
                .ok_or_else(|| DeviceError::validation(format!("expected {}", decl.data_type)))?;

            if !within_bounds(value, decl.min, decl.max) {
                return Err(DeviceError::validation("outside of bounds"));
            }

            if let Some(increment) = decl.increment {
                let base = decl.increment_base.unwrap_or(0.0);
                if !on_increment(value, base, increment) {
                    return Err(DeviceError::validation("not incremented by set value"));
                }
            }
        }
        DataType::String => {
            if let Some(max_length) = decl.max_length {
                if candidate.chars().count() > max_length {
                    return Err(DeviceError::validation("exceeds max length"));
                }
            }
        }
        // Checked against the device's own enumeration when the value is applied.
        DataType::Bool | DataType::Enum => {}
    }

    Ok(())
}

fn parse_finite(candidate: &str) -> Option<f64> {
    candidate
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn within_bounds(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}

/// `round5((value - base) / increment)` must be a whole number.
fn on_increment(value: f64, base: f64, increment: f64) -> bool {
    if increment == 0.0 {
        return true;
    }
    let scaled = ((value - base) / increment * INCREMENT_PRECISION).round();
    scaled % INCREMENT_PRECISION == 0.0
}

// =============================================================================
// Property Builder (Fluent API)
// =============================================================================

/// Builder for property declarations.
///
/// Devices use it to describe each setting they expose; the value is filled
/// from live device state every time the property is read.
#[derive(Debug, Clone)]
pub struct PropertyBuilder {
    property: Property,
}

impl PropertyBuilder {
    /// Start a declaration with an id and value type.
    pub fn new(id: impl Into<String>, data_type: DataType) -> Self {
        let id = id.into();
        Self {
            property: Property {
                display_name: id.clone(),
                id,
                data_type,
                value: String::new(),
                min: None,
                max: None,
                increment: None,
                increment_base: None,
                max_length: None,
                possible_enum_values: None,
                order: 0,
            },
        }
    }

    /// Human readable label.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.property.display_name = name.into();
        self
    }

    /// Inclusive numeric bounds.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.property.min = Some(min);
        self.property.max = Some(max);
        self
    }

    /// Step size of the numeric grid.
    pub fn increment(mut self, increment: f64) -> Self {
        self.property.increment = Some(increment);
        self
    }

    /// Origin of the numeric grid.
    pub fn increment_base(mut self, base: f64) -> Self {
        self.property.increment_base = Some(base);
        self
    }

    /// Maximum string length in characters.
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.property.max_length = Some(max_length);
        self
    }

    /// Allowed values of an enum property.
    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.property.possible_enum_values = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// Display order.
    pub fn order(mut self, order: u32) -> Self {
        self.property.order = order;
        self
    }

    /// Current value.
    pub fn value(mut self, value: impl ToString) -> Self {
        self.property.value = value.to_string();
        self
    }

    /// Finish the declaration.
    pub fn build(self) -> Property {
        self.property
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_decl() -> Property {
        PropertyBuilder::new("scan_average", DataType::Int)
            .range(1.0, 10000.0)
            .increment(1.0)
            .value(1)
            .build()
    }

    fn reason(result: DeviceResult<()>) -> String {
        match result {
            Err(DeviceError::ValidationFailed(reason)) => reason,
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_value_rejected_first() {
        let decl = int_decl();
        assert_eq!(reason(validate(&decl, "")), "must send actual value");
    }

    #[test]
    fn test_numeric_type_check() {
        let decl = int_decl();
        assert_eq!(reason(validate(&decl, "ten")), "expected int");
        assert_eq!(reason(validate(&decl, "NaN")), "expected int");
        assert_eq!(reason(validate(&decl, "inf")), "expected int");

        let double = PropertyBuilder::new("exposure", DataType::Double).build();
        assert_eq!(reason(validate(&double, "abc")), "expected double");
        assert!(validate(&double, "-12.75").is_ok());
    }

    #[test]
    fn test_bounds_inclusive() {
        let decl = int_decl();
        assert!(validate(&decl, "1").is_ok());
        assert!(validate(&decl, "10000").is_ok());
        assert_eq!(reason(validate(&decl, "0")), "outside of bounds");
        assert_eq!(reason(validate(&decl, "10001")), "outside of bounds");
    }

    #[test]
    fn test_fractional_int_not_on_increment() {
        let decl = int_decl();
        assert_eq!(
            reason(validate(&decl, "2.5")),
            "not incremented by set value"
        );
    }

    #[test]
    fn test_increment_tolerance_is_five_decimals() {
        let decl = PropertyBuilder::new("gain", DataType::Double)
            .range(0.0, 10.0)
            .increment(0.1)
            .build();

        // 0.3 / 0.1 is 2.9999999999999996 in f64
        assert!(validate(&decl, "0.3").is_ok());
        assert!(validate(&decl, "0.3000001").is_ok());
        assert_eq!(
            reason(validate(&decl, "0.35")),
            "not incremented by set value"
        );
    }

    #[test]
    fn test_increment_base_offsets_grid() {
        let decl = PropertyBuilder::new("wavelength", DataType::Double)
            .range(0.0, 100.0)
            .increment(2.0)
            .increment_base(1.0)
            .build();

        assert!(validate(&decl, "3").is_ok());
        assert_eq!(reason(validate(&decl, "4")), "not incremented by set value");
    }

    #[test]
    fn test_string_max_length() {
        let decl = PropertyBuilder::new("scan_filename", DataType::String)
            .max_length(5)
            .build();

        assert!(validate(&decl, "abcde").is_ok());
        assert_eq!(reason(validate(&decl, "abcdef")), "exceeds max length");
    }

    #[test]
    fn test_bool_and_enum_pass_type_stage() {
        let flag = PropertyBuilder::new("calibrate", DataType::Bool).build();
        assert!(validate(&flag, "true").is_ok());

        let mode = PropertyBuilder::new("mode", DataType::Enum)
            .choices(["fast", "slow"])
            .build();
        assert!(validate(&mode, "fast").is_ok());
    }

    #[test]
    fn test_accepts_iff_in_bounds_and_on_grid() {
        for increment in [1.0, 0.5, 0.25, 5.0] {
            let decl = PropertyBuilder::new("p", DataType::Double)
                .range(-10.0, 10.0)
                .increment(increment)
                .build();

            for step in -100..=100 {
                let value = step as f64 * 0.125;
                let quotient = value / increment;
                let on_grid = (quotient - quotient.round()).abs() < 1e-5;
                let in_bounds = (-10.0..=10.0).contains(&value);
                let accepted = validate(&decl, &value.to_string()).is_ok();
                assert_eq!(
                    accepted,
                    on_grid && in_bounds,
                    "value {} increment {}",
                    value,
                    increment
                );
            }
        }
    }

    #[test]
    fn test_property_serializes_camel_case() {
        let json = serde_json::to_value(int_decl()).unwrap();
        assert_eq!(json["id"], "scan_average");
        assert_eq!(json["dataType"], "int");
        assert_eq!(json["minValue"], 1.0);
        assert_eq!(json["maxValue"], 10000.0);
        assert!(json.get("maxLength").is_none());
    }
}
