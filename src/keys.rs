//! Storage-key derivation.
//!
//! Logical identifiers (invite codes, password hashes, peer ids, PINs,
//! session ids) never appear in storage keys. Each key is the namespace
//! prefix plus a truncated base64url SHA-256 over the prefix and the
//! identifier parts, so holding one identifier does not let a client
//! enumerate neighbouring records. The hash is enumeration resistance,
//! not authentication; it carries no secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Namespace prefixes for every record family.
pub const PREFIX_SESSION: &str = "sess";
pub const PREFIX_ACK: &str = "ack";
pub const PREFIX_PIN: &str = "pin";
pub const PREFIX_PEER: &str = "peer";
pub const PREFIX_SIGNAL: &str = "signal";
pub const PREFIX_DEVICE: &str = "devices";
pub const PREFIX_HANDSHAKE: &str = "envelope-session";

/// All prefixes the sweeper walks.
pub const ALL_PREFIXES: &[&str] = &[
    PREFIX_SESSION,
    PREFIX_ACK,
    PREFIX_PIN,
    PREFIX_PEER,
    PREFIX_SIGNAL,
    PREFIX_DEVICE,
    PREFIX_HANDSHAKE,
];

const HASH_LEN: usize = 32;

/// Invite codes are exactly 8 case-sensitive alphanumerics.
pub fn is_valid_invite_code(code: &str) -> bool {
    code.len() == 8 && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Password hashes are opaque client-supplied strings in a base64, base64url
/// or hex alphabet, at most 256 chars.
pub fn is_valid_password_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash.len() <= 256
        && hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'_' | b'-'))
}

/// Peer ids are client-minted opaque strings, at most 128 chars.
pub fn is_valid_peer_id(peer_id: &str) -> bool {
    !peer_id.is_empty() && peer_id.len() <= 128
}

/// Derive the storage key `prefix/<hash>` for the given identifier parts.
pub fn storage_key(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    for part in parts {
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(HASH_LEN);
    format!("{prefix}/{encoded}")
}

pub fn session_key(invite_code: &str, password_hash: &str) -> String {
    storage_key(PREFIX_SESSION, &[invite_code, password_hash])
}

pub fn ack_key(invite_code: &str, password_hash: &str) -> String {
    storage_key(PREFIX_ACK, &[invite_code, password_hash])
}

pub fn pin_key(pin: &str) -> String {
    storage_key(PREFIX_PIN, &[pin])
}

pub fn peer_key(invite_code: &str) -> String {
    storage_key(PREFIX_PEER, &[invite_code])
}

pub fn signal_key(peer_id: &str) -> String {
    storage_key(PREFIX_SIGNAL, &[peer_id])
}

pub fn device_key(device_id: &str) -> String {
    storage_key(PREFIX_DEVICE, &[device_id])
}

pub fn handshake_key(session_id: &str) -> String {
    storage_key(PREFIX_HANDSHAKE, &[session_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_and_fixed_length() {
        let key = session_key("Ab3Xy9Zk", "h1");
        assert!(key.starts_with("sess/"));
        assert_eq!(key.len(), "sess/".len() + HASH_LEN);
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(session_key("Ab3Xy9Zk", "h1"), session_key("Ab3Xy9Zk", "h1"));
    }

    #[test]
    fn parts_are_delimited() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            storage_key(PREFIX_SESSION, &["ab", "c"]),
            storage_key(PREFIX_SESSION, &["a", "bc"])
        );
    }

    #[test]
    fn prefixes_partition_the_keyspace() {
        let sess = session_key("Uv9Wx1Yz", "p");
        let ack = ack_key("Uv9Wx1Yz", "p");
        assert_ne!(sess.split('/').nth(1), ack.split('/').nth(1));
    }

    #[test]
    fn invite_code_format() {
        assert!(is_valid_invite_code("Ab3Xy9Zk"));
        assert!(!is_valid_invite_code("Ab3Xy9Z"));
        assert!(!is_valid_invite_code("Ab3Xy9Zk2"));
        assert!(!is_valid_invite_code("Ab3Xy9Z!"));
        assert!(!is_valid_invite_code(""));
    }

    #[test]
    fn password_hash_charset() {
        assert!(is_valid_password_hash("h1"));
        assert!(is_valid_password_hash("qk3J/8bZ+w==")); // base64
        assert!(is_valid_password_hash("qk3J_8bZ-w")); // base64url
        assert!(!is_valid_password_hash(""));
        assert!(!is_valid_password_hash("has space"));
        assert!(!is_valid_password_hash(&"a".repeat(257)));
    }

    #[test]
    fn peer_id_bounds() {
        assert!(is_valid_peer_id("p1"));
        assert!(is_valid_peer_id(&"x".repeat(128)));
        assert!(!is_valid_peer_id(&"x".repeat(129)));
        assert!(!is_valid_peer_id(""));
    }
}
