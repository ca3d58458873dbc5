// Archivo: hashing.rs
// Propósito: huellas blake3 sobre JSON canónico (claves ordenadas).
use serde_json::Value as JsonValue;

/// Hash hex de un valor JSON. `serde_json::Map` ordena sus claves, así que
/// dos valores iguales producen la misma huella.
pub fn hash_value(value: &JsonValue) -> String {
    let canonical = value.to_string();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"a": 1, "b": [1, 2]});
        let b = json!({"b": [1, 2], "a": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_ne!(hash_value(&a), hash_value(&json!({"a": 2, "b": [1, 2]})));
    }
}
