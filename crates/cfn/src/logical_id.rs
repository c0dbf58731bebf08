//! Deterministic logical ids derived from construct paths.

use sha1::{Digest, Sha1};

/// Maximum length CloudFormation accepts for a logical id.
const MAX_LOGICAL_ID_LEN: usize = 255;

/// Length of the hash suffix appended to nested paths.
const HASH_LEN: usize = 8;

/// Build a logical id from a construct path.
///
/// Top-level constructs keep their (sanitized) name. Nested paths get the
/// alphanumeric concatenation of every component followed by the first eight
/// hex digits of the SHA-1 of the full path, so two paths that sanitize to
/// the same text still get distinct ids.
#[must_use]
pub fn logical_id(path: &[&str]) -> String {
    let human: String = path
        .iter()
        .flat_map(|component| component.chars())
        .filter(char::is_ascii_alphanumeric)
        .collect();

    if path.len() <= 1 {
        return truncate(human, MAX_LOGICAL_ID_LEN);
    }

    let mut hasher = Sha1::new();
    hasher.update(path.join("/").as_bytes());
    let digest = hex::encode_upper(hasher.finalize());

    format!(
        "{}{}",
        truncate(human, MAX_LOGICAL_ID_LEN - HASH_LEN),
        &digest[..HASH_LEN]
    )
}

fn truncate(mut s: String, max: usize) -> String {
    s.truncate(max);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_component_is_sanitized() {
        assert_eq!(logical_id(&["vpc-cni"]), "vpccni");
        assert_eq!(logical_id(&["EKSCluster"]), "EKSCluster");
    }

    #[test]
    fn test_nested_path_gets_hash_suffix() {
        let id = logical_id(&["erigon", "eks-dmz", "Subnet1"]);
        assert!(id.starts_with("erigoneksdmzSubnet1"));
        assert_eq!(id.len(), "erigoneksdmzSubnet1".len() + HASH_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_colliding_sanitized_paths_differ() {
        assert_ne!(logical_id(&["a-b", "c"]), logical_id(&["ab", "c"]));
    }

    #[test]
    fn test_is_stable() {
        assert_eq!(
            logical_id(&["EKSCluster", "KubectlHandler"]),
            logical_id(&["EKSCluster", "KubectlHandler"])
        );
    }
}
