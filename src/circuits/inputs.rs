use serde_json::{Map, Value};

use crate::{coordinate::GridCoordinate, error::ToolchainError};

/// Names of the four verification signals, in declaration order.
pub const VERIFY_SIGNALS: [&str; 4] = ["latDegVerify", "latMinVerify", "lonDegVerify", "lonMinVerify"];

/// Build the named input assignment for witness generation.
pub fn verify_inputs(query: &GridCoordinate) -> Value {
    let values = [query.lat_deg, query.lat_min, query.lon_deg, query.lon_min];
    let mut map = Map::new();
    for (name, value) in VERIFY_SIGNALS.iter().zip(values) {
        map.insert((*name).to_string(), Value::String(value.to_string()));
    }
    Value::Object(map)
}

/// Read a named input assignment back; every signal must be present.
pub fn parse_verify_inputs(circuit: &str, json: &Value) -> Result<GridCoordinate, ToolchainError> {
    let mut values = [0i64; 4];
    for (slot, name) in values.iter_mut().zip(VERIFY_SIGNALS) {
        *slot = parse_signal(json, name).ok_or_else(|| ToolchainError::ProofGeneration {
            circuit: circuit.to_string(),
            reason: format!("input signal {name} missing or not an integer"),
        })?;
    }
    let [lat_deg, lat_min, lon_deg, lon_min] = values;
    Ok(GridCoordinate::new(lat_deg, lat_min, lon_deg, lon_min))
}

fn parse_signal(json: &Value, name: &str) -> Option<i64> {
    match json.get(name)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inputs_use_decimal_strings() {
        let json = verify_inputs(&GridCoordinate::new(-23, 6, 18, 18));
        assert_eq!(
            json,
            json!({
                "latDegVerify": "-23",
                "latMinVerify": "6",
                "lonDegVerify": "18",
                "lonMinVerify": "18",
            })
        );
    }

    #[test]
    fn test_parse_accepts_numbers_and_strings() {
        let json = json!({
            "latDegVerify": -23,
            "latMinVerify": "6",
            "lonDegVerify": 18,
            "lonMinVerify": " 18 ",
        });
        assert_eq!(
            parse_verify_inputs("c", &json).unwrap(),
            GridCoordinate::new(-23, 6, 18, 18)
        );
    }

    #[test]
    fn test_missing_signal_is_proof_generation_error() {
        let json = json!({ "latDegVerify": "-23", "latMinVerify": "6", "lonDegVerify": "18" });
        let err = parse_verify_inputs("c", &json).unwrap_err();
        assert!(matches!(err, ToolchainError::ProofGeneration { .. }));
        assert!(err.to_string().contains("lonMinVerify"));
    }
}
