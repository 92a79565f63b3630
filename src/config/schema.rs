//! JSON-schema validation for the layered YAML config, per §6.
//!
//! The schema is deliberately loose (it only pins down the shapes that would
//! otherwise fail confusingly deep inside a worker): hex addresses, byte32
//! hashes, and the top-level section names.

use once_cell::sync::Lazy;
use serde_json::{json, Value};

static SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["global", "chains"],
        "properties": {
            "global": { "type": "object" },
            "ambs": { "type": "array" },
            "chains": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["chainId", "rpc"],
                    "properties": {
                        "chainId": { "type": "integer", "minimum": 1 },
                        "rpc": { "type": "string" },
                    }
                }
            },
            "endpoints": { "type": "array" },
        }
    })
});

/// Hex address, `^0x[0-9a-fA-F]{40}$` per §6.
pub fn is_hex_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Hex byte32, `^0x[0-9a-fA-F]{64}$` per §6.
pub fn is_hex_bytes32(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validates the raw config document against the structural schema above.
/// Field-level hex/bytes32 checks happen at parse time in `mod.rs`, since
/// `jsonschema`'s pattern support on a dynamically-built schema is more
/// friction than it is worth for two regexes.
pub fn validate(document: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(&SCHEMA)
        .map_err(|e| format!("invalid embedded schema: {e}"))?;
    if let Err(errors) = compiled.validate(document) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(messages.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_document() {
        let doc = json!({
            "global": {"port": 8080},
            "chains": [{"chainId": 1, "rpc": "ws://localhost:8545"}],
        });
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn rejects_missing_chains() {
        let doc = json!({"global": {}});
        assert!(validate(&doc).is_err());
    }

    #[test]
    fn hex_validators() {
        assert!(is_hex_address("0x0000000000000000000000000000000000000000"));
        assert!(!is_hex_address("0x123"));
        assert!(is_hex_bytes32(&format!("0x{}", "00".repeat(32))));
        assert!(!is_hex_bytes32("0xdead"));
    }
}
