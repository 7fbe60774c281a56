//! Hashing helpers shared by the replication surrogate-key path and the
//! vault builders.

use sha2::{Digest, Sha256};

use crate::row::{value_text, Row};

/// Hex-encoded SHA-256 of the input.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Deterministic hash over the named columns of a row, `|`-joined in column
/// order. Missing or null values contribute the empty string.
pub fn hash_columns(row: &Row, columns: &[String]) -> String {
    let joined = columns
        .iter()
        .map(|c| {
            row.get(c)
                .filter(|v| !v.is_null())
                .map(value_text)
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(&joined)
}

/// Surrogate row hash over the full ordered row image, used for tables
/// without a primary key.
pub fn row_image_hash(row: &Row, column_order: &[String]) -> String {
    hash_columns(row, column_order)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_sha256_is_stable() {
        assert_eq!(
            sha256_hex("AA|1"),
            sha256_hex("AA|1"),
        );
        assert_ne!(sha256_hex("AA|1"), sha256_hex("AA|2"));
        assert_eq!(sha256_hex("").len(), 64);
    }

    #[test]
    fn test_hash_columns_ignores_extra_fields() {
        let a = row_of(&[("k", json!("AA")), ("v", json!(1))]);
        let b = row_of(&[("k", json!("AA")), ("v", json!(999))]);
        let cols = vec!["k".to_string()];
        assert_eq!(hash_columns(&a, &cols), hash_columns(&b, &cols));
    }
}
