use sha2::{Digest, Sha256};

const MASK_PREFIX: &str = "u_";
const MASK_HEX_LEN: usize = 12;

/// Mask a user identity before it is stored or returned.
///
/// The mask is a truncated SHA-256 digest, so the same user always maps to the
/// same token and usage can still be grouped per user. Empty input stays empty.
pub fn mask_identity(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(MASK_HEX_LEN);
    format!("{MASK_PREFIX}{hex}")
}
