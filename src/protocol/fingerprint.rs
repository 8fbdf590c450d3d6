use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// OpenSSH-style SHA-256 fingerprint of a public key blob (`SHA256:...`).
pub fn fingerprint(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ssh_keygen_format() {
        // sha256("") in unpadded base64
        assert_eq!(
            fingerprint(b""),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn distinct_blobs_have_distinct_fingerprints() {
        assert_ne!(fingerprint(b"key-a"), fingerprint(b"key-b"));
        assert_eq!(fingerprint(b"key-a"), fingerprint(b"key-a"));
    }
}
