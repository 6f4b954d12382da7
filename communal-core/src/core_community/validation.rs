//! Structural validation of descriptions, chats and permissions

use super::description::{CommunityChat, CommunityDescription};
use super::errors::{CommunityError, CommunityResult};
use super::permissions::TokenPermission;

pub fn validate_chat(chat: &CommunityChat) -> CommunityResult<()> {
    if chat.identity.display_name.trim().is_empty() {
        return Err(CommunityError::InvalidChat("display name is empty".to_string()));
    }
    if chat.position < 0 {
        return Err(CommunityError::InvalidChat("negative position".to_string()));
    }
    Ok(())
}

pub fn validate_token_permission(permission: &TokenPermission) -> CommunityResult<()> {
    if permission.id.is_empty() {
        return Err(CommunityError::InvalidTokenPermission("id is empty".to_string()));
    }
    if permission.permission_type.is_channel_permission() && permission.chat_ids.is_empty() {
        return Err(CommunityError::InvalidTokenPermission(
            "channel permission without channels".to_string(),
        ));
    }
    if !permission.permission_type.is_channel_permission() && permission.token_criteria.is_empty()
    {
        return Err(CommunityError::InvalidTokenPermission(
            "community permission without token criteria".to_string(),
        ));
    }
    Ok(())
}

/// Validate a description received from the transport
pub fn validate_description(description: &CommunityDescription) -> CommunityResult<()> {
    if description.clock == 0 {
        return Err(CommunityError::InvalidDescription("clock is zero".to_string()));
    }
    if !description.ban_exclusivity_holds() {
        return Err(CommunityError::InvalidDescription(
            "banned identity holds membership".to_string(),
        ));
    }
    for (chat_id, chat) in &description.chats {
        validate_chat(chat)?;
        if !chat.category_id.is_empty() && !description.categories.contains_key(&chat.category_id) {
            return Err(CommunityError::InvalidDescription(format!(
                "chat {} references unknown category {}",
                chat_id, chat.category_id
            )));
        }
        if let Some(stray) = chat.members.keys().find(|k| !description.has_member(k)) {
            return Err(CommunityError::InvalidDescription(format!(
                "chat {} member {} is not a community member",
                chat_id, stray
            )));
        }
    }
    for (id, permission) in &description.token_permissions {
        if id != &permission.id {
            return Err(CommunityError::InvalidDescription(format!(
                "token permission key {} does not match id {}",
                id, permission.id
            )));
        }
    }
    Ok(())
}
