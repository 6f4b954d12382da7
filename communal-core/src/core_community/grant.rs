//! Short-lived, control-node-signed membership proofs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{CommunityError, CommunityResult};
use super::types::{ChatId, Clock, CommunityId, Identity, MemberKey, SIGNATURE_LENGTH};

/// Default lifetime of a grant
pub const GRANT_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// A capability proving a member's standing at a given clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub community_id: CommunityId,
    /// Compressed public key of the member
    pub member_id: Vec<u8>,
    /// Empty for community-wide grants
    pub chat_id: ChatId,
    pub clock: Clock,
    /// Expiry in milliseconds since the Unix epoch
    pub expires: u64,
}

impl Grant {
    /// Decompress the member id
    pub fn member_key(&self) -> CommunityResult<MemberKey> {
        let key = MemberKey::from_slice(&self.member_id)?;
        key.verifying_key()?;
        Ok(key)
    }
}

/// Serialize and sign a grant, producing `signature || payload`
pub fn build_grant(
    signer: &Identity,
    community_id: CommunityId,
    member: &MemberKey,
    chat_id: &str,
    clock: Clock,
    now_millis: u64,
    expiration: Duration,
) -> CommunityResult<Vec<u8>> {
    let grant = Grant {
        community_id,
        member_id: member.as_bytes().to_vec(),
        chat_id: chat_id.to_string(),
        clock,
        expires: now_millis.saturating_add(expiration.as_millis() as u64),
    };
    let payload = bincode::serialize(&grant)?;
    Ok(signer.sign_payload(&payload))
}

/// Verify a grant issued by `control_node` for `community_id`
///
/// Never consults the member list.
pub fn verify_grant(
    data: &[u8],
    community_id: &CommunityId,
    control_node: &MemberKey,
    now_millis: u64,
) -> CommunityResult<Grant> {
    if data.len() <= SIGNATURE_LENGTH {
        return Err(CommunityError::InvalidGrant("payload too short".to_string()));
    }
    let (signature, payload) = data.split_at(SIGNATURE_LENGTH);

    let grant: Grant = bincode::deserialize(payload)
        .map_err(|e| CommunityError::InvalidGrant(e.to_string()))?;

    if grant.clock == 0 {
        return Err(CommunityError::InvalidGrant("clock is zero".to_string()));
    }
    if grant.member_id.is_empty() {
        return Err(CommunityError::InvalidGrant("member id is empty".to_string()));
    }
    if &grant.community_id != community_id {
        return Err(CommunityError::InvalidGrant("community id mismatch".to_string()));
    }
    if grant.expires < now_millis {
        return Err(CommunityError::GrantExpired);
    }

    control_node
        .verify(payload, signature)
        .map_err(|_| CommunityError::InvalidGrant("not signed by the control node".to_string()))?;

    Ok(grant)
}
