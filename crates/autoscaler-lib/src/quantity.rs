//! Kubernetes resource quantity conversion
//!
//! CPU quantities are normalized to milli-cores and memory quantities to
//! bytes. Fractional results are rounded up, as the API server does.

use crate::error::ScaleError;
use crate::models::{ResourceKind, ResourceVector};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Binary suffixes as powers of 1024
const BINARY_SUFFIXES: &[(&str, i32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

/// Decimal suffixes as powers of ten
const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Rounding slack absorbing binary floating point error before `ceil`
const ROUNDING_EPSILON: f64 = 1e-6;

/// Parse a quantity and express it in units of `10^unit_exponent`
fn parse_scaled(value: &str, unit_exponent: i32) -> Result<i64, ScaleError> {
    let invalid = |reason: &str| ScaleError::InvalidQuantity {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty quantity"));
    }

    let (number, scale) = if let Some((number, power)) = BINARY_SUFFIXES
        .iter()
        .find_map(|(suffix, power)| trimmed.strip_suffix(suffix).map(|n| (n, *power)))
    {
        (number, 1024f64.powi(power) * 10f64.powi(-unit_exponent))
    } else if let Some((number, exponent)) = DECIMAL_SUFFIXES
        .iter()
        .find_map(|(suffix, exp)| trimmed.strip_suffix(suffix).map(|n| (n, *exp)))
    {
        (number, 10f64.powi(exponent - unit_exponent))
    } else {
        // Plain numbers, including exponent notation such as "1e3"
        (trimmed, 10f64.powi(-unit_exponent))
    };

    let parsed: f64 = number
        .parse()
        .map_err(|_| invalid("not a decimal number"))?;
    let scaled = parsed * scale;
    if !scaled.is_finite() || scaled < 0.0 {
        return Err(invalid("out of range"));
    }

    let rounded = (scaled - ROUNDING_EPSILON).ceil().max(0.0);
    if rounded >= i64::MAX as f64 {
        return Err(invalid("overflows i64"));
    }
    Ok(rounded as i64)
}

/// CPU quantity in milli-cores ("250m" -> 250, "1.5" -> 1500)
pub fn cpu_millicores(quantity: &Quantity) -> Result<i64, ScaleError> {
    parse_scaled(&quantity.0, -3)
}

/// Memory quantity in bytes ("128Mi" -> 134217728)
pub fn memory_bytes(quantity: &Quantity) -> Result<i64, ScaleError> {
    parse_scaled(&quantity.0, 0)
}

pub fn cpu_quantity(millicores: i64) -> Quantity {
    Quantity(format!("{}m", millicores))
}

pub fn memory_quantity(bytes: i64) -> Quantity {
    Quantity(bytes.to_string())
}

/// Read CPU and memory from a Kubernetes resource map; absent kinds are `None`
pub fn read_resources(
    map: &BTreeMap<String, Quantity>,
) -> Result<(Option<i64>, Option<i64>), ScaleError> {
    let cpu = map
        .get(ResourceKind::Cpu.as_str())
        .map(cpu_millicores)
        .transpose()?;
    let memory = map
        .get(ResourceKind::Memory.as_str())
        .map(memory_bytes)
        .transpose()?;
    Ok((cpu, memory))
}

/// Resource map holding exactly the given CPU and memory
pub fn resource_map(resources: ResourceVector) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        (
            ResourceKind::Cpu.as_str().to_string(),
            cpu_quantity(resources.cpu_millicores),
        ),
        (
            ResourceKind::Memory.as_str().to_string(),
            memory_quantity(resources.memory_bytes),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_cpu_parsing() {
        assert_eq!(cpu_millicores(&q("250m")).unwrap(), 250);
        assert_eq!(cpu_millicores(&q("1")).unwrap(), 1000);
        assert_eq!(cpu_millicores(&q("1.5")).unwrap(), 1500);
        assert_eq!(cpu_millicores(&q("500000u")).unwrap(), 500);
        assert_eq!(cpu_millicores(&q("1e-1")).unwrap(), 100);
    }

    #[test]
    fn test_memory_parsing() {
        assert_eq!(memory_bytes(&q("128Mi")).unwrap(), 134_217_728);
        assert_eq!(memory_bytes(&q("1Gi")).unwrap(), 1_073_741_824);
        assert_eq!(memory_bytes(&q("1G")).unwrap(), 1_000_000_000);
        assert_eq!(memory_bytes(&q("2048")).unwrap(), 2048);
        assert_eq!(memory_bytes(&q("1e3")).unwrap(), 1000);
    }

    #[test]
    fn test_invalid_quantities() {
        assert!(cpu_millicores(&q("")).is_err());
        assert!(cpu_millicores(&q("abc")).is_err());
        assert!(memory_bytes(&q("-5Mi")).is_err());
    }

    #[test]
    fn test_formatting_parses_back() {
        let map = resource_map(ResourceVector::new(133, 64 * 1024 * 1024));
        assert_eq!(map["cpu"], q("133m"));
        let (cpu, memory) = read_resources(&map).unwrap();
        assert_eq!(cpu, Some(133));
        assert_eq!(memory, Some(64 * 1024 * 1024));
    }
}
