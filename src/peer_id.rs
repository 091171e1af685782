//! Local peer-id generation.
//!
//! Azureus-style convention: an 8-byte client tag sandwiched in dashes,
//! followed by 12 random bytes. Shared by the tracker client (announced as
//! `peer_id`) and the peer handshake (sent on the wire).
use rand::Rng;

/// Stable per-build client tag. `BE` = "bitengine".
const CLIENT_TAG: &[u8; 8] = b"-BE0001-";

/// Generates a fresh 20-byte peer-id for this run of the engine.
pub fn generate() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..CLIENT_TAG.len()].copy_from_slice(CLIENT_TAG);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[CLIENT_TAG.len()..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_client_tag_prefix() {
        let id = generate();
        assert_eq!(&id[..8], CLIENT_TAG);
    }

    #[test]
    fn is_twenty_bytes() {
        assert_eq!(generate().len(), 20);
    }
}
