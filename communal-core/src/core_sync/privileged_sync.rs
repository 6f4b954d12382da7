//! Signed messages the control node sends privately to privileged members

use serde::{Deserialize, Serialize};

use crate::core_community::types::open_signed_payload;
use crate::core_community::{CommunityResult, Identity, MemberKey};

use super::persistence::RequestToJoin;

/// Request-to-join bookkeeping shared with Owners, TokenMasters and Admins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivilegedUserSync {
    AcceptRequestToJoin(RequestToJoin),
    RejectRequestToJoin(RequestToJoin),
    AllPendingRequestsSync(Vec<RequestToJoin>),
    EditSharedAddresses {
        request_id: String,
        member: MemberKey,
        addresses: Vec<String>,
    },
}

impl PrivilegedUserSync {
    /// Sign with the community key, producing `signature || payload`
    pub fn sign(&self, control_node: &Identity) -> CommunityResult<Vec<u8>> {
        Ok(control_node.sign_payload(&serde_json::to_vec(self)?))
    }

    /// Open a message, accepting only signatures of `control_node`
    pub fn open(data: &[u8], control_node: &MemberKey) -> CommunityResult<Self> {
        let payload = open_signed_payload(data, control_node)?;
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PrivilegedUserSync::AcceptRequestToJoin(_) => "accept_request_to_join",
            PrivilegedUserSync::RejectRequestToJoin(_) => "reject_request_to_join",
            PrivilegedUserSync::AllPendingRequestsSync(_) => "all_pending_requests_sync",
            PrivilegedUserSync::EditSharedAddresses { .. } => "edit_shared_addresses",
        }
    }
}
