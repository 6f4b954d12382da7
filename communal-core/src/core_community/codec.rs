//! Pluggable encoding of community descriptions
//!
//! Descriptions travel as `signature || encoded description`. Both codecs
//! are field tagged through serde and tolerate missing fields on decode.

use std::fmt;

use super::description::CommunityDescription;
use super::errors::{CommunityError, CommunityResult};
use super::types::{Identity, MemberKey, SIGNATURE_LENGTH};

pub trait DescriptionCodec: Send + Sync + fmt::Debug {
    fn encode(&self, description: &CommunityDescription) -> CommunityResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> CommunityResult<CommunityDescription>;
}

/// Self-describing JSON encoding, forward and backward compatible
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl DescriptionCodec for JsonCodec {
    fn encode(&self, description: &CommunityDescription) -> CommunityResult<Vec<u8>> {
        Ok(serde_json::to_vec(description)?)
    }

    fn decode(&self, bytes: &[u8]) -> CommunityResult<CommunityDescription> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary encoding for peers that agree on the schema
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl DescriptionCodec for BincodeCodec {
    fn encode(&self, description: &CommunityDescription) -> CommunityResult<Vec<u8>> {
        Ok(bincode::serialize(description)?)
    }

    fn decode(&self, bytes: &[u8]) -> CommunityResult<CommunityDescription> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Encode and sign a description
pub fn sign_description(
    codec: &dyn DescriptionCodec,
    signer: &Identity,
    description: &CommunityDescription,
) -> CommunityResult<Vec<u8>> {
    Ok(signer.sign_payload(&codec.encode(description)?))
}

/// Check a signed description against `signer` and decode it
pub fn open_description(
    codec: &dyn DescriptionCodec,
    data: &[u8],
    signer: &MemberKey,
) -> CommunityResult<CommunityDescription> {
    if data.len() <= SIGNATURE_LENGTH {
        return Err(CommunityError::InvalidDescription("payload too short".to_string()));
    }
    let (signature, payload) = data.split_at(SIGNATURE_LENGTH);
    signer.verify(payload, signature)?;
    codec.decode(payload)
}
