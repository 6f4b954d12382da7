//! X25519 key agreement derived from Ed25519 identities

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::errors::{CommunityError, CommunityResult};
use super::types::{Identity, MemberKey};

/// Derive the X25519 secret matching an Ed25519 identity
pub fn x25519_secret(identity: &Identity) -> StaticSecret {
    let mut seed = identity.seed();
    let hash = Sha512::digest(seed);
    seed.zeroize();
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    let secret = StaticSecret::from(scalar);
    scalar.zeroize();
    secret
}

/// Convert an Ed25519 public key into its Montgomery form
pub fn x25519_public(key: &MemberKey) -> CommunityResult<X25519PublicKey> {
    let point = CompressedEdwardsY(*key.as_bytes())
        .decompress()
        .ok_or_else(|| CommunityError::InvalidKey("not a valid curve point".to_string()))?;
    Ok(X25519PublicKey::from(point.to_montgomery().to_bytes()))
}

/// Diffie-Hellman shared secret between a local identity and a peer key
pub fn shared_secret(identity: &Identity, peer: &MemberKey) -> CommunityResult<[u8; 32]> {
    let secret = x25519_secret(identity);
    let public = x25519_public(peer)?;
    Ok(secret.diffie_hellman(&public).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_public_matches_converted_public() {
        let identity = Identity::from_seed([9u8; 32]);
        let from_secret = X25519PublicKey::from(&x25519_secret(&identity));
        let converted = x25519_public(&identity.public_key()).unwrap();
        assert_eq!(from_secret.as_bytes(), converted.as_bytes());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let ab = shared_secret(&alice, &bob.public_key()).unwrap();
        let ba = shared_secret(&bob, &alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }
}
