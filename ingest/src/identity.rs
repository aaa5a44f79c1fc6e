//! Deterministic identifiers and content hashes.
//!
//! Ids are UUIDv5 over a fixed namespace per kind, so the same input yields
//! the same id across runs and processes.

use sha2::{Digest, Sha256};
use uuid::Uuid;

const FILE_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_8a52_9d7e_4c1b_a3e6_1f2d_7b90_c4e1);
const NODE_NAMESPACE: Uuid = Uuid::from_u128(0x2b7d_41c8_0e65_4f3a_9c17_d85e_6a02_b3f9);
const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0xa91e_37f4_6c28_4d05_b7e3_0c64_f18a_52d7);

/// Id of the file at `path` within `project_id`.
pub fn file_id(project_id: &str, path: &str) -> Uuid {
    Uuid::new_v5(&FILE_NAMESPACE, format!("{project_id}\0{path}").as_bytes())
}

/// Id of a content node, from its project, source path and structural
/// signature (for example `function:parseConfig` or `section:Intro/Install`).
pub fn node_id(project_id: &str, path: &str, signature: &str) -> Uuid {
    Uuid::new_v5(
        &NODE_NAMESPACE,
        format!("{project_id}\0{path}\0{signature}").as_bytes(),
    )
}

/// Id of an extracted entity, from its type and canonical name.
/// Case-insensitive so differently cased mentions share one node.
pub fn entity_id(entity_type: &str, name: &str) -> Uuid {
    let key = format!("{}\0{}", entity_type.to_lowercase(), name.to_lowercase());
    Uuid::new_v5(&ENTITY_NAMESPACE, key.as_bytes())
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ids_are_deterministic() {
        assert_eq!(file_id("p", "/a.ts"), file_id("p", "/a.ts"));
        assert_ne!(file_id("p", "/a.ts"), file_id("q", "/a.ts"));
        assert_eq!(node_id("p", "/a.ts", "function:foo"), node_id("p", "/a.ts", "function:foo"));
        assert_ne!(node_id("p", "/a.ts", "function:foo"), node_id("p", "/b.ts", "function:foo"));
        assert_eq!(entity_id("Org", "NVIDIA"), entity_id("org", "nvidia"));
    }

    #[test]
    fn test_node_ids_are_scoped_to_project() {
        assert_ne!(
            node_id("docs", "/README.md", "section:Intro"),
            node_id("site", "/README.md", "section:Intro")
        );
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(content_hash("a"), content_hash("b"));
    }
}
