//! Static unit-conversion table for the trailing `convert(...)` form.
//!
//! Each dimension maps unit names to a factor relative to that dimension's
//! base unit (metres, square metres, cubic metres, kilograms, watts).
//! Conversion is `value * factor(from) / factor(to)` and only valid inside
//! one dimension.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::FormulaError;

struct Dimension {
    name: &'static str,
    factors: HashMap<&'static str, f64>,
}

lazy_static! {
    static ref DIMENSIONS: Vec<Dimension> = vec![
        Dimension {
            name: "length",
            factors: HashMap::from([
                ("mm", 0.001),
                ("cm", 0.01),
                ("m", 1.0),
                ("km", 1000.0),
                ("in", 0.0254),
                ("ft", 0.3048),
                ("yd", 0.9144),
            ]),
        },
        Dimension {
            name: "area",
            factors: HashMap::from([
                ("sqmm", 1.0e-6),
                ("sqcm", 1.0e-4),
                ("sqm", 1.0),
                ("sqin", 0.00064516),
                ("sqft", 0.09290304),
            ]),
        },
        Dimension {
            name: "volume",
            factors: HashMap::from([
                ("ml", 1.0e-6),
                ("l", 0.001),
                ("m3", 1.0),
                ("gal", 0.003785411784),
                ("ft3", 0.028316846592),
            ]),
        },
        Dimension {
            name: "weight",
            factors: HashMap::from([
                ("g", 0.001),
                ("kg", 1.0),
                ("t", 1000.0),
                ("oz", 0.028349523125),
                ("lb", 0.45359237),
            ]),
        },
        Dimension {
            name: "power",
            factors: HashMap::from([("w", 1.0), ("kw", 1000.0), ("hp", 745.699872)]),
        },
    ];
}

pub fn convert(value: f64, from_unit: &str, to_unit: &str) -> Result<f64, FormulaError> {
    let from_key = from_unit.to_lowercase();
    let to_key = to_unit.to_lowercase();

    let from_dim = DIMENSIONS
        .iter()
        .find(|d| d.factors.contains_key(from_key.as_str()))
        .ok_or_else(|| FormulaError::UnknownUnit(from_unit.to_string()))?;
    let to_dim = DIMENSIONS
        .iter()
        .find(|d| d.factors.contains_key(to_key.as_str()))
        .ok_or_else(|| FormulaError::UnknownUnit(to_unit.to_string()))?;

    if from_dim.name != to_dim.name {
        return Err(FormulaError::UnitMismatch {
            from: from_unit.to_string(),
            to: to_unit.to_string(),
        });
    }

    let from_factor = from_dim.factors[from_key.as_str()];
    let to_factor = to_dim.factors[to_key.as_str()];
    Ok(value * from_factor / to_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_conversion() {
        let metres = convert(3000.0, "mm", "m").unwrap();
        assert!((metres - 3.0).abs() < 1e-9);

        let feet = convert(1.0, "m", "ft").unwrap();
        assert!((feet - 3.280839895).abs() < 1e-6);
    }

    #[test]
    fn test_area_and_power() {
        let sqft = convert(10.0, "sqm", "sqft").unwrap();
        assert!((sqft - 107.639104).abs() < 1e-4);

        let kw = convert(1500.0, "w", "kw").unwrap();
        assert!((kw - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_unit() {
        assert_eq!(
            convert(1.0, "parsec", "m"),
            Err(FormulaError::UnknownUnit("parsec".into()))
        );
    }

    #[test]
    fn test_cross_dimension_rejected() {
        assert!(matches!(
            convert(1.0, "kg", "m"),
            Err(FormulaError::UnitMismatch { .. })
        ));
    }
}
