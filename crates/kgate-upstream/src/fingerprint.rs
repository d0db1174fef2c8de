//! Machine fingerprint and agent-mode derivation for upstream headers.

use sha2::{Digest, Sha256};

/// Credentials that carry a machine id run in `spec` mode, anonymous ones
/// in `vibe` mode.
pub fn agent_mode(machine_id: Option<&str>) -> &'static str {
    if machine_id.is_some() { "spec" } else { "vibe" }
}

/// Normalize to a 64-char lowercase hex fingerprint: accepted as-is,
/// doubled from a 32-hex UUID form, or derived from the refresh token.
pub fn machine_fingerprint(machine_id: Option<&str>, refresh_token: Option<&str>) -> String {
    if let Some(raw) = machine_id {
        let cleaned: String = raw
            .chars()
            .filter(|c| *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if cleaned.len() == 64 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return cleaned;
        }
        if cleaned.len() == 32 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return format!("{cleaned}{cleaned}");
        }
    }
    let seed = format!("KotlinNativeAPI/{}", refresh_token.unwrap_or_default());
    hex::encode(Sha256::digest(seed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_hex_passes_through() {
        let id = "a".repeat(64);
        assert_eq!(machine_fingerprint(Some(&id), None), id);
    }

    #[test]
    fn uuid_form_doubles() {
        let id = "123e4567-e89b-12d3-a456-426614174000";
        let fp = machine_fingerprint(Some(id), None);
        assert_eq!(fp.len(), 64);
        assert!(fp.starts_with("123e4567e89b12d3a456426614174000"));
        assert_eq!(&fp[..32], &fp[32..]);
    }

    #[test]
    fn fallback_hashes_refresh_token() {
        let a = machine_fingerprint(None, Some("token-a"));
        let b = machine_fingerprint(None, Some("token-b"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        // Deterministic for the same token.
        assert_eq!(a, machine_fingerprint(None, Some("token-a")));
    }

    #[test]
    fn agent_mode_tracks_machine_id() {
        assert_eq!(agent_mode(Some("x")), "spec");
        assert_eq!(agent_mode(None), "vibe");
    }
}
