//! Embedding catalog payloads.
//!
//! The catalog is a JSON array of
//! `{"username": .., "member_id": .., "image_vector": [<ignored>, [f32; D]]}`.
//! Entries are parsed one by one so a malformed entry only drops itself.

use crate::types::MemberId;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog is not a JSON array: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One catalog entry. A `None` field means it was absent or unusable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntry {
    pub username: Option<String>,
    pub member_id: Option<MemberId>,
    pub embedding: Option<Vec<f32>>,
}

impl CatalogEntry {
    pub fn new(username: &str, member_id: &str, embedding: Vec<f32>) -> Self {
        Self {
            username: Some(username.to_string()),
            member_id: Some(MemberId(member_id.to_string())),
            embedding: Some(embedding),
        }
    }
}

#[derive(Deserialize)]
struct RawEntry {
    username: Option<String>,
    member_id: Option<serde_json::Value>,
    image_vector: Option<Vec<serde_json::Value>>,
}

/// Parse a catalog response body.
pub fn parse_catalog(body: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let items: Vec<serde_json::Value> = serde_json::from_str(body)?;
    Ok(items.into_iter().map(parse_entry).collect())
}

fn parse_entry(value: serde_json::Value) -> CatalogEntry {
    let Ok(raw) = serde_json::from_value::<RawEntry>(value) else {
        return CatalogEntry::default();
    };

    CatalogEntry {
        username: raw.username.filter(|u| !u.is_empty()),
        member_id: raw.member_id.and_then(member_id_from_json),
        embedding: raw
            .image_vector
            .and_then(|v| v.into_iter().nth(1))
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v).ok())
            .filter(|v| !v.is_empty()),
    }
}

/// Numbers and non-empty strings are accepted; zero counts as absent, like
/// every other falsy member id the catalog service emits.
fn member_id_from_json(value: serde_json::Value) -> Option<MemberId> {
    match value {
        serde_json::Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                None
            } else {
                Some(MemberId(n.to_string()))
            }
        }
        serde_json::Value::String(s) if !s.is_empty() => Some(MemberId(s)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_entry() {
        let body = r#"[{"username":"alice","member_id":7,"image_vector":["ghostface",[0.1,0.2,0.3]]}]"#;
        let entries = parse_catalog(body).unwrap();
        assert_eq!(entries, vec![CatalogEntry::new("alice", "7", vec![0.1, 0.2, 0.3])]);
    }

    #[test]
    fn test_parse_string_member_id() {
        let body = r#"[{"username":"bob","member_id":"M-12","image_vector":[null,[1.0]]}]"#;
        let entries = parse_catalog(body).unwrap();
        assert_eq!(entries[0].member_id, Some(MemberId("M-12".into())));
    }

    #[test]
    fn test_parse_incomplete_entries() {
        let body = r#"[
            {"username":"a","member_id":1},
            {"member_id":2,"image_vector":[0,[1.0]]},
            {"username":"c","member_id":0,"image_vector":[0,[1.0]]},
            {"username":"d","member_id":4,"image_vector":[[1.0]]},
            {"username":"e","member_id":5,"image_vector":[0,[]]},
            "not an object"
        ]"#;
        let entries = parse_catalog(body).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries[0].embedding.is_none());
        assert!(entries[1].username.is_none());
        assert!(entries[2].member_id.is_none());
        assert!(entries[3].embedding.is_none());
        assert!(entries[4].embedding.is_none());
        assert_eq!(entries[5], CatalogEntry::default());
    }

    #[test]
    fn test_parse_non_array_fails() {
        assert!(parse_catalog(r#"{"error":"nope"}"#).is_err());
    }
}
