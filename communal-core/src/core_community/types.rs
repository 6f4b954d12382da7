//! Identity types for communities and their members

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

use super::errors::{CommunityError, CommunityResult};

/// Logical clock value carried by every authoritative description
pub type Clock = u64;

/// Local channel identifier (unique within one community)
pub type ChatId = String;

/// Length of an Ed25519 signature prefix on signed payloads
pub const SIGNATURE_LENGTH: usize = 64;

/// Public key of a member
///
/// Serialized as a lowercase hex string so it can be used as a map key
/// in field-tagged encodings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey([u8; 32]);

impl MemberKey {
    /// Create a MemberKey from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MemberKey(bytes)
    }

    /// Create a MemberKey from a slice, rejecting wrong lengths
    pub fn from_slice(bytes: &[u8]) -> CommunityResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CommunityError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(MemberKey(arr))
    }

    /// Parse a hex encoded key
    pub fn from_hex(s: &str) -> CommunityResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CommunityError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Get bytes representation
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decompress into a verifying key, checking the point is valid
    pub fn verifying_key(&self) -> CommunityResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CommunityError::InvalidKey(e.to_string()))
    }

    /// Verify `signature` over `message` was produced by this key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CommunityResult<()> {
        let key = self.verifying_key()?;
        let signature =
            Signature::from_slice(signature).map_err(|e| CommunityError::Signature(e.to_string()))?;
        key.verify(message, &signature)
            .map_err(|e| CommunityError::Signature(e.to_string()))
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberKey({})", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for MemberKey {
    fn from(bytes: [u8; 32]) -> Self {
        MemberKey(bytes)
    }
}

impl Serialize for MemberKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MemberKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MemberKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Unique identifier for a community: the public key of its community key pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(MemberKey);

impl CommunityId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        CommunityId(MemberKey::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// The community key, which is the control node unless ownership moved
    pub fn public_key(&self) -> MemberKey {
        self.0
    }

    /// Fully qualified identifier of a chat in this community
    pub fn chat_id(&self, chat_id: &str) -> String {
        format!("{}{}", self.0.to_hex(), chat_id)
    }
}

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommunityId({})", &self.0.to_hex()[..16])
    }
}

impl From<MemberKey> for CommunityId {
    fn from(key: MemberKey) -> Self {
        CommunityId(key)
    }
}

/// An Ed25519 signing identity
///
/// Used both for member identities and for the community key pair held
/// by the control node. The seed is zeroized on drop.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS random source
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let identity = Self::from_seed(seed);
        seed.zeroize();
        identity
    }

    /// Build an identity from a 32 byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> MemberKey {
        MemberKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message, returning the 64 byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Produce `signature || payload`
    pub fn sign_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_LENGTH + payload.len());
        out.extend_from_slice(&self.sign(payload));
        out.extend_from_slice(payload);
        out
    }

    /// Raw seed bytes, used for X25519 derivation
    pub(crate) fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Split a `signature || payload` blob and check it against `signer`
pub fn open_signed_payload<'a>(data: &'a [u8], signer: &MemberKey) -> CommunityResult<&'a [u8]> {
    if data.len() <= SIGNATURE_LENGTH {
        return Err(CommunityError::Signature("payload too short".to_string()));
    }
    let (signature, payload) = data.split_at(SIGNATURE_LENGTH);
    signer.verify(payload, signature)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_key_hex_round_trip() {
        let key = Identity::from_seed([7u8; 32]).public_key();
        let parsed = MemberKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_member_key_rejects_wrong_length() {
        assert!(MemberKey::from_slice(&[1, 2, 3]).is_err());
        assert!(MemberKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_member_key_serializes_as_string() {
        let key = MemberKey::from_bytes([0xAB; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }

    #[test]
    fn test_signed_payload() {
        let identity = Identity::generate();
        let signed = identity.sign_payload(b"hello");
        let payload = open_signed_payload(&signed, &identity.public_key()).unwrap();
        assert_eq!(payload, b"hello");

        let other = Identity::generate();
        assert!(open_signed_payload(&signed, &other.public_key()).is_err());
        assert!(open_signed_payload(&signed[..10], &identity.public_key()).is_err());
    }

    #[test]
    fn test_chat_id_is_prefixed_with_community() {
        let id = CommunityId::from_bytes([1u8; 32]);
        let full = id.chat_id("general");
        assert!(full.starts_with(&"01".repeat(32)));
        assert!(full.ends_with("general"));
    }
}
