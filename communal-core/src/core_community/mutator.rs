//! State-changing operations on a community
//!
//! Each operation follows the same dual-authority shape. The control node
//! applies the change and advances the clock. A delegated member holding
//! a role authorized for the corresponding event records a provisional
//! [`CommunityEvent`] instead, and receives the change-set the action will
//! produce once the control node replays it.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::changes::{chat_changes, CommunityChanges};
use super::community::Community;
use super::description::{
    BanInfo, CommunityCategory, CommunityChat, CommunityMember, CommunityMetadata, TokenMetadata,
};
use super::errors::{CommunityError, CommunityResult};
use super::events::{CommunityEvent, CommunityEventKind, CommunityEventType};
use super::permissions::TokenPermission;
use super::roles::{can_role_modify_permission, ChannelRole, MemberRole};
use super::shard::Shard;
use super::types::{ChatId, MemberKey};
use super::validation::{validate_chat, validate_token_permission};

impl Community {
    /// Apply directly as control node, or record `kind` as a provisional event
    fn commit<F>(&mut self, kind: CommunityEventKind, apply: F) -> CommunityResult<CommunityChanges>
    where
        F: FnOnce(&mut Community) -> CommunityChanges,
    {
        if self.is_control_node() {
            let changes = apply(self);
            self.increase_clock();
            debug!(community_id = %self.id, clock = self.clock(), "Applied change as control node");
            return Ok(changes);
        }
        let mut preview = self.clone();
        let changes = apply(&mut preview);
        let event = self.new_event(kind);
        self.add_new_community_event(event)?;
        Ok(changes)
    }

    /// Control-node-only mutation that always advances the clock
    fn commit_as_control_node<F>(&mut self, apply: F) -> CommunityResult<CommunityChanges>
    where
        F: FnOnce(&mut Community) -> CommunityChanges,
    {
        self.require_control_node()?;
        let changes = apply(self);
        self.increase_clock();
        Ok(changes)
    }

    fn validate_category_ref(&self, category_id: &str) -> CommunityResult<()> {
        if !category_id.is_empty() && !self.description.categories.contains_key(category_id) {
            return Err(CommunityError::CategoryNotFound(category_id.to_string()));
        }
        Ok(())
    }

    fn validate_chats_exist(&self, chat_ids: &[ChatId]) -> CommunityResult<()> {
        match chat_ids.iter().find(|id| !self.description.chats.contains_key(*id)) {
            Some(missing) => Err(CommunityError::ChatNotFound(missing.clone())),
            None => Ok(()),
        }
    }

    fn validate_unique_chat_name(&self, chat_id: &str, chat: &CommunityChat) -> CommunityResult<()> {
        let name = &chat.identity.display_name;
        if self
            .description
            .chats
            .iter()
            .any(|(id, c)| id != chat_id && &c.identity.display_name == name)
        {
            return Err(CommunityError::DuplicatedChatName(name.clone()));
        }
        Ok(())
    }

    /// Record chat-level differences between `before` and the current chats
    fn chat_layout_changes(
        &self,
        before: &BTreeMap<ChatId, CommunityChat>,
        changes: &mut CommunityChanges,
    ) {
        for (chat_id, chat) in &self.description.chats {
            if let Some(previous) = before.get(chat_id) {
                let diff = chat_changes(previous, chat);
                if !diff.is_empty() {
                    changes.chats_modified.insert(chat_id.clone(), diff);
                }
            }
        }
    }

    /// Place `chat_id` into `category_id` at `position`, renumbering both categories
    fn move_chat(&mut self, chat_id: &str, category_id: &str, position: Option<usize>) {
        let Some(previous_category) = self
            .description
            .chats
            .get(chat_id)
            .map(|c| c.category_id.clone())
        else {
            return;
        };
        let mut order: Vec<ChatId> = self
            .description
            .chats_in_category(category_id)
            .into_iter()
            .map(|(id, _)| id.clone())
            .filter(|id| id != chat_id)
            .collect();
        let index = position.unwrap_or(order.len()).min(order.len());
        order.insert(index, chat_id.to_string());
        for (i, id) in order.iter().enumerate() {
            if let Some(chat) = self.description.chats.get_mut(id) {
                chat.category_id = category_id.to_string();
                chat.position = i as i32;
            }
        }
        if previous_category != category_id {
            self.normalize_chat_positions(&previous_category);
        }
    }

    fn normalize_chat_positions(&mut self, category_id: &str) {
        let order: Vec<ChatId> = self
            .description
            .chats_in_category(category_id)
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        for (i, id) in order.iter().enumerate() {
            if let Some(chat) = self.description.chats.get_mut(id) {
                chat.position = i as i32;
            }
        }
    }

    fn place_category(&mut self, category_id: &str, position: Option<usize>) {
        let mut order: Vec<(i32, String)> = self
            .description
            .categories
            .values()
            .filter(|c| c.category_id != category_id)
            .map(|c| (c.position, c.category_id.clone()))
            .collect();
        order.sort();
        let mut ids: Vec<String> = order.into_iter().map(|(_, id)| id).collect();
        if self.description.categories.contains_key(category_id) {
            let index = position.unwrap_or(ids.len()).min(ids.len());
            ids.insert(index, category_id.to_string());
        }
        for (i, id) in ids.iter().enumerate() {
            if let Some(category) = self.description.categories.get_mut(id) {
                category.position = i as i32;
            }
        }
    }

    // Chats

    /// Create a chat
    ///
    /// The chat is seeded with every current community member and placed
    /// at the end of its category.
    pub fn create_chat(
        &mut self,
        chat_id: ChatId,
        chat: CommunityChat,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::ChannelCreate)?;
        self.validate_create_chat(&chat_id, &chat)?;
        info!(community_id = %self.id, chat_id = %chat_id, "Creating chat");
        let kind = CommunityEventKind::ChannelCreate {
            chat_id: chat_id.clone(),
            chat: chat.clone(),
        };
        self.commit(kind, move |c| c.apply_create_chat(chat_id, chat))
    }

    fn validate_create_chat(&self, chat_id: &str, chat: &CommunityChat) -> CommunityResult<()> {
        if chat_id.is_empty() {
            return Err(CommunityError::InvalidChat("chat id is empty".to_string()));
        }
        validate_chat(chat)?;
        if self.description.chats.contains_key(chat_id) {
            return Err(CommunityError::ChatAlreadyExists(chat_id.to_string()));
        }
        self.validate_unique_chat_name(chat_id, chat)?;
        self.validate_category_ref(&chat.category_id)
    }

    fn apply_create_chat(&mut self, chat_id: ChatId, mut chat: CommunityChat) -> CommunityChanges {
        chat.position = self.description.chats_in_category(&chat.category_id).len() as i32;
        chat.members_list = None;
        chat.members = self
            .description
            .members
            .iter()
            .map(|(key, member)| {
                (
                    *key,
                    CommunityMember {
                        roles: member.roles.clone(),
                        channel_role: ChannelRole::Poster,
                        last_update_clock: 0,
                    },
                )
            })
            .collect();
        let mut changes = self.empty_changes();
        changes.chats_added.insert(chat_id.clone(), chat.clone());
        self.description.chats.insert(chat_id, chat);
        changes
    }

    /// Edit a chat's identity, permissions or category; members are kept
    pub fn edit_chat(
        &mut self,
        chat_id: ChatId,
        chat: CommunityChat,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::ChannelEdit)?;
        self.validate_edit_chat(&chat_id, &chat)?;
        let kind = CommunityEventKind::ChannelEdit {
            chat_id: chat_id.clone(),
            chat: chat.clone(),
        };
        self.commit(kind, move |c| c.apply_edit_chat(&chat_id, chat))
    }

    fn validate_edit_chat(&self, chat_id: &str, chat: &CommunityChat) -> CommunityResult<()> {
        if !self.description.chats.contains_key(chat_id) {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        }
        validate_chat(chat)?;
        self.validate_unique_chat_name(chat_id, chat)?;
        self.validate_category_ref(&chat.category_id)
    }

    fn apply_edit_chat(&mut self, chat_id: &str, chat: CommunityChat) -> CommunityChanges {
        let before = self.description.chats.clone();
        let mut category_changed = false;
        if let Some(existing) = self.description.chats.get_mut(chat_id) {
            existing.identity = chat.identity;
            existing.permissions = chat.permissions;
            existing.viewers_can_post_reactions = chat.viewers_can_post_reactions;
            existing.hide_if_permissions_not_met = chat.hide_if_permissions_not_met;
            category_changed = existing.category_id != chat.category_id;
        }
        if category_changed {
            self.move_chat(chat_id, &chat.category_id, None);
        }
        let mut changes = self.empty_changes();
        self.chat_layout_changes(&before, &mut changes);
        changes
    }

    pub fn delete_chat(&mut self, chat_id: &str) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::ChannelDelete)?;
        if !self.description.chats.contains_key(chat_id) {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        }
        info!(community_id = %self.id, chat_id, "Deleting chat");
        let kind = CommunityEventKind::ChannelDelete {
            chat_id: chat_id.to_string(),
        };
        self.commit(kind, |c| c.apply_delete_chat(chat_id))
    }

    fn apply_delete_chat(&mut self, chat_id: &str) -> CommunityChanges {
        let mut changes = self.empty_changes();
        let Some(chat) = self.description.chats.remove(chat_id) else {
            return changes;
        };
        self.normalize_chat_positions(&chat.category_id);
        changes.chats_removed.insert(chat_id.to_string(), chat);

        // Permissions must not reference a deleted chat
        let mut emptied = Vec::new();
        for (id, permission) in self.description.token_permissions.iter_mut() {
            if permission.applies_to_chat(chat_id) {
                permission.chat_ids.retain(|c| c != chat_id);
                if permission.chat_ids.is_empty() && permission.permission_type.is_channel_permission() {
                    emptied.push(id.clone());
                } else {
                    changes
                        .token_permissions_modified
                        .insert(id.clone(), permission.clone());
                }
            }
        }
        for id in emptied {
            if let Some(permission) = self.description.token_permissions.remove(&id) {
                changes.token_permissions_removed.insert(id, permission);
            }
        }
        changes
    }

    /// Move a chat within or across categories
    pub fn reorder_chat(
        &mut self,
        chat_id: &str,
        category_id: &str,
        position: i32,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::ChannelReorder)?;
        self.validate_reorder_chat(chat_id, category_id, position)?;
        let kind = CommunityEventKind::ChannelReorder {
            chat_id: chat_id.to_string(),
            category_id: category_id.to_string(),
            position,
        };
        self.commit(kind, |c| c.apply_reorder_chat(chat_id, category_id, position))
    }

    fn validate_reorder_chat(&self, chat_id: &str, category_id: &str, position: i32) -> CommunityResult<()> {
        if !self.description.chats.contains_key(chat_id) {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        }
        if position < 0 {
            return Err(CommunityError::InvalidChat("negative position".to_string()));
        }
        self.validate_category_ref(category_id)
    }

    fn apply_reorder_chat(&mut self, chat_id: &str, category_id: &str, position: i32) -> CommunityChanges {
        let before = self.description.chats.clone();
        self.move_chat(chat_id, category_id, Some(position as usize));
        let mut changes = self.empty_changes();
        self.chat_layout_changes(&before, &mut changes);
        changes
    }

    // Categories

    pub fn create_category(
        &mut self,
        category_id: &str,
        name: &str,
        chat_ids: Vec<ChatId>,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::CategoryCreate)?;
        let category = CommunityCategory {
            category_id: category_id.to_string(),
            name: name.to_string(),
            position: 0,
        };
        self.validate_create_category(&category, &chat_ids)?;
        let kind = CommunityEventKind::CategoryCreate {
            category: category.clone(),
            chat_ids: chat_ids.clone(),
        };
        self.commit(kind, move |c| c.apply_create_category(category, &chat_ids))
    }

    fn validate_create_category(&self, category: &CommunityCategory, chat_ids: &[ChatId]) -> CommunityResult<()> {
        if category.category_id.is_empty() || category.name.trim().is_empty() {
            return Err(CommunityError::InvalidDescription(
                "category id and name are required".to_string(),
            ));
        }
        if self.description.categories.contains_key(&category.category_id) {
            return Err(CommunityError::CategoryAlreadyExists(category.category_id.clone()));
        }
        self.validate_chats_exist(chat_ids)
    }

    fn apply_create_category(&mut self, mut category: CommunityCategory, chat_ids: &[ChatId]) -> CommunityChanges {
        let before = self.description.chats.clone();
        category.position = self.description.categories.len() as i32;
        let category_id = category.category_id.clone();
        self.description.categories.insert(category_id.clone(), category.clone());
        for chat_id in chat_ids {
            self.move_chat(chat_id, &category_id, None);
        }
        let mut changes = self.empty_changes();
        changes.categories_added.insert(category_id, category);
        self.chat_layout_changes(&before, &mut changes);
        changes
    }

    /// Rename a category and set its chats; chats left out become uncategorized
    pub fn edit_category(
        &mut self,
        category_id: &str,
        name: &str,
        chat_ids: Vec<ChatId>,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::CategoryEdit)?;
        self.validate_edit_category(category_id, name, &chat_ids)?;
        let category = CommunityCategory {
            category_id: category_id.to_string(),
            name: name.to_string(),
            position: 0,
        };
        let kind = CommunityEventKind::CategoryEdit {
            category: category.clone(),
            chat_ids: chat_ids.clone(),
        };
        self.commit(kind, move |c| c.apply_edit_category(category, &chat_ids))
    }

    fn validate_edit_category(&self, category_id: &str, name: &str, chat_ids: &[ChatId]) -> CommunityResult<()> {
        if !self.description.categories.contains_key(category_id) {
            return Err(CommunityError::CategoryNotFound(category_id.to_string()));
        }
        if name.trim().is_empty() {
            return Err(CommunityError::InvalidDescription("category name is empty".to_string()));
        }
        self.validate_chats_exist(chat_ids)
    }

    fn apply_edit_category(&mut self, category: CommunityCategory, chat_ids: &[ChatId]) -> CommunityChanges {
        let before = self.description.chats.clone();
        let category_id = category.category_id.clone();
        let mut changes = self.empty_changes();
        if let Some(existing) = self.description.categories.get_mut(&category_id) {
            existing.name = category.name;
            changes.categories_modified.insert(category_id.clone(), existing.clone());
        }
        let leaving: Vec<ChatId> = self
            .description
            .chats_in_category(&category_id)
            .into_iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !chat_ids.contains(id))
            .collect();
        for chat_id in leaving {
            self.move_chat(&chat_id, "", None);
        }
        for chat_id in chat_ids {
            let in_category = self
                .description
                .chats
                .get(chat_id)
                .is_some_and(|c| c.category_id == category_id);
            if !in_category {
                self.move_chat(chat_id, &category_id, None);
            }
        }
        self.chat_layout_changes(&before, &mut changes);
        changes
    }

    /// Delete a category, moving its chats to the uncategorized list
    pub fn delete_category(&mut self, category_id: &str) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::CategoryDelete)?;
        if !self.description.categories.contains_key(category_id) {
            return Err(CommunityError::CategoryNotFound(category_id.to_string()));
        }
        let kind = CommunityEventKind::CategoryDelete {
            category_id: category_id.to_string(),
        };
        self.commit(kind, |c| c.apply_delete_category(category_id))
    }

    fn apply_delete_category(&mut self, category_id: &str) -> CommunityChanges {
        let before = self.description.chats.clone();
        let mut changes = self.empty_changes();
        let chats: Vec<ChatId> = self
            .description
            .chats_in_category(category_id)
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        for chat_id in chats {
            self.move_chat(&chat_id, "", None);
        }
        if let Some(category) = self.description.categories.remove(category_id) {
            changes.categories_removed.insert(category_id.to_string(), category);
        }
        self.place_category(category_id, None);
        self.chat_layout_changes(&before, &mut changes);
        changes
    }

    pub fn reorder_category(&mut self, category_id: &str, position: i32) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::CategoryReorder)?;
        if !self.description.categories.contains_key(category_id) {
            return Err(CommunityError::CategoryNotFound(category_id.to_string()));
        }
        if position < 0 {
            return Err(CommunityError::InvalidDescription("negative position".to_string()));
        }
        let kind = CommunityEventKind::CategoryReorder {
            category_id: category_id.to_string(),
            position,
        };
        self.commit(kind, |c| c.apply_reorder_category(category_id, position))
    }

    fn apply_reorder_category(&mut self, category_id: &str, position: i32) -> CommunityChanges {
        let before = self.description.categories.clone();
        self.place_category(category_id, Some(position as usize));
        let mut changes = self.empty_changes();
        for (id, category) in &self.description.categories {
            if before.get(id) != Some(category) {
                changes.categories_modified.insert(id.clone(), category.clone());
            }
        }
        changes
    }

    // Community metadata

    pub fn edit(&mut self, metadata: CommunityMetadata) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::CommunityEdit)?;
        if metadata.identity.display_name.trim().is_empty() {
            return Err(CommunityError::InvalidDescription("display name is empty".to_string()));
        }
        let kind = CommunityEventKind::CommunityEdit {
            metadata: metadata.clone(),
        };
        self.commit(kind, move |c| {
            c.description.apply_metadata(metadata);
            c.empty_changes()
        })
    }

    pub fn add_tokens_metadata(&mut self, metadata: TokenMetadata) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::TokenAdd)?;
        if metadata.contract_addresses.is_empty() {
            return Err(CommunityError::InvalidDescription(
                "token without contract address".to_string(),
            ));
        }
        let kind = CommunityEventKind::TokenAdd {
            metadata: metadata.clone(),
        };
        self.commit(kind, move |c| {
            if !c.description.tokens_metadata.contains(&metadata) {
                c.description.tokens_metadata.push(metadata);
            }
            c.empty_changes()
        })
    }

    // Members

    /// Add a member with a single role, control node only
    pub fn add_member(&mut self, key: MemberKey, role: MemberRole) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        if self.is_banned(&key) {
            return Err(CommunityError::MemberBanned);
        }
        if self.has_member(&key) {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(move |c| {
            let mut member = CommunityMember::with_role(role);
            member.last_update_clock = c.clock();
            let mut changes = c.empty_changes();
            changes.members_added.insert(key, member.clone());
            c.description.members.insert(key, member);
            changes
        })
    }

    pub fn add_member_to_chat(
        &mut self,
        key: MemberKey,
        chat_id: &str,
        channel_role: ChannelRole,
    ) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        let roles = self
            .description
            .members
            .get(&key)
            .map(|m| m.roles.clone())
            .ok_or(CommunityError::MemberNotFound)?;
        if !self.description.chats.contains_key(chat_id) {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        }
        self.commit_as_control_node(move |c| {
            let member = CommunityMember {
                roles,
                channel_role,
                last_update_clock: 0,
            };
            let mut changes = c.empty_changes();
            if let Some(chat) = c.description.chats.get_mut(chat_id) {
                chat.members.insert(key, member.clone());
                changes.add_chat_member(chat_id, key, member);
            }
            changes
        })
    }

    /// Remove a member from one chat; a no-op for unknown members or chats
    pub fn remove_user_from_chat(&mut self, key: &MemberKey, chat_id: &str) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        if !self.has_member(key) || !self.is_member_in_chat(key, chat_id) {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(|c| {
            let mut changes = c.empty_changes();
            if let Some(removed) = c
                .description
                .chats
                .get_mut(chat_id)
                .and_then(|chat| chat.members.remove(key))
            {
                changes.remove_chat_member(chat_id, *key, removed);
            }
            changes
        })
    }

    pub fn populate_chat_with_all_members(&mut self, chat_id: &str) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        let Some(chat) = self.description.chats.get(chat_id) else {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        };
        let missing: Vec<(MemberKey, CommunityMember)> = self
            .description
            .members
            .iter()
            .filter(|(k, _)| !chat.members.contains_key(*k))
            .map(|(k, m)| {
                (
                    *k,
                    CommunityMember {
                        roles: m.roles.clone(),
                        channel_role: ChannelRole::Poster,
                        last_update_clock: 0,
                    },
                )
            })
            .collect();
        if missing.is_empty() {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(move |c| {
            let mut changes = c.empty_changes();
            if let Some(chat) = c.description.chats.get_mut(chat_id) {
                for (key, member) in missing {
                    chat.members.insert(key, member.clone());
                    changes.add_chat_member(chat_id, key, member);
                }
            }
            changes
        })
    }

    fn apply_remove_member(&mut self, key: &MemberKey) -> CommunityChanges {
        let mut changes = self.empty_changes();
        if let Some(member) = self.description.members.remove(key) {
            changes.members_removed.insert(*key, member);
        }
        for (chat_id, chat) in self.description.chats.iter_mut() {
            if let Some(member) = chat.members.remove(key) {
                changes.remove_chat_member(chat_id, *key, member);
            }
        }
        changes
    }

    /// Kick a member from the community
    pub fn remove_user_from_org(&mut self, key: &MemberKey) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::MemberKick)?;
        if !self.is_control_node() && self.is_privileged_member(key) {
            return Err(CommunityError::CannotRemoveOwnerOrAdmin);
        }
        if !self.has_member(key) {
            return Err(CommunityError::MemberNotFound);
        }
        info!(community_id = %self.id, member = %key, "Removing member");
        let kind = CommunityEventKind::MemberKick { member: *key };
        self.commit(kind, |c| c.apply_remove_member(key))
    }

    /// Ban a member, removing it from the community and every chat
    ///
    /// `delete_all_messages` is carried on the ban record for the message
    /// deletion collaborator.
    pub fn ban_user_from_community(
        &mut self,
        key: &MemberKey,
        delete_all_messages: bool,
    ) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::MemberBan)?;
        if !self.is_control_node() && self.is_privileged_member(key) {
            return Err(CommunityError::CannotBanOwnerOrAdmin);
        }
        info!(community_id = %self.id, member = %key, delete_all_messages, "Banning member");
        let kind = CommunityEventKind::MemberBan {
            member: *key,
            delete_all_messages,
        };
        self.commit(kind, |c| c.apply_ban(key, delete_all_messages))
    }

    fn apply_ban(&mut self, key: &MemberKey, delete_all_messages: bool) -> CommunityChanges {
        let mut changes = self.apply_remove_member(key);
        self.description.ban_list.insert(*key);
        self.description
            .banned_members
            .insert(*key, BanInfo { delete_all_messages });
        changes.banned.insert(*key, delete_all_messages);
        changes
    }

    pub fn unban_user_from_community(&mut self, key: &MemberKey) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::MemberUnban)?;
        if !self.is_banned(key) {
            return Err(CommunityError::BannedMemberNotFound);
        }
        info!(community_id = %self.id, member = %key, "Unbanning member");
        let kind = CommunityEventKind::MemberUnban { member: *key };
        self.commit(kind, |c| c.apply_unban(key))
    }

    fn apply_unban(&mut self, key: &MemberKey) -> CommunityChanges {
        self.description.ban_list.remove(key);
        self.description.banned_members.remove(key);
        let mut changes = self.empty_changes();
        changes.unbanned.push(*key);
        changes
    }

    /// Flag a banned member's messages for deletion
    pub fn delete_banned_member_messages(&mut self, key: &MemberKey) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::DeleteBannedMemberMessages)?;
        if !self.is_banned(key) {
            return Err(CommunityError::BannedMemberNotFound);
        }
        let kind = CommunityEventKind::DeleteBannedMemberMessages { member: *key };
        self.commit(kind, |c| {
            c.description.ban_list.insert(*key);
            c.description.banned_members.entry(*key).or_default().delete_all_messages = true;
            let mut changes = c.empty_changes();
            changes.banned.insert(*key, true);
            changes
        })
    }

    // Roles

    /// Replace a member's roles with exactly `role`
    pub fn set_role_to_member(&mut self, key: &MemberKey, role: MemberRole) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        if !self.has_member(key) {
            return Err(CommunityError::MemberNotFound);
        }
        let roles = CommunityMember::with_role(role).roles;
        if self.description.members.get(key).is_some_and(|m| m.roles == roles) {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(|c| c.update_member_roles(key, |r| *r = roles.clone()))
    }

    /// Add a role on top of the existing ones
    #[deprecated(note = "breaks the single-role invariant; use set_role_to_member")]
    pub fn add_role_to_member(&mut self, key: &MemberKey, role: MemberRole) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        if !self.has_member(key) {
            return Err(CommunityError::MemberNotFound);
        }
        self.commit_as_control_node(|c| {
            c.update_member_roles(key, |r| {
                if role != MemberRole::None {
                    r.insert(role);
                }
            })
        })
    }

    pub fn remove_role_from_member(&mut self, key: &MemberKey, role: MemberRole) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        if !self.has_member(key) {
            return Err(CommunityError::MemberNotFound);
        }
        if !self.description.members.get(key).is_some_and(|m| m.roles.contains(&role)) {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(|c| c.update_member_roles(key, |r| {
            r.remove(&role);
        }))
    }

    fn update_member_roles<F>(&mut self, key: &MemberKey, update: F) -> CommunityChanges
    where
        F: Fn(&mut super::roles::RoleSet),
    {
        let clock = self.clock();
        let mut changes = self.empty_changes();
        if let Some(member) = self.description.members.get_mut(key) {
            update(&mut member.roles);
            member.last_update_clock = clock;
            changes.members_modified.insert(*key, member.clone());
        }
        for chat in self.description.chats.values_mut() {
            if let Some(member) = chat.members.get_mut(key) {
                update(&mut member.roles);
            }
        }
        changes
    }

    // Token permissions

    fn authorize_permission(&self, event_type: CommunityEventType, permission: &TokenPermission) -> CommunityResult<()> {
        if self.is_control_node() {
            return Ok(());
        }
        self.authorize(event_type)?;
        let role = self.role_of(&self.member_identity());
        let stored = self.description.token_permissions.get(&permission.id);
        if !can_role_modify_permission(role, permission.permission_type)
            || stored.is_some_and(|p| !can_role_modify_permission(role, p.permission_type))
        {
            return Err(CommunityError::NotAuthorized);
        }
        Ok(())
    }

    pub fn upsert_token_permission(&mut self, permission: TokenPermission) -> CommunityResult<CommunityChanges> {
        self.authorize_permission(CommunityEventType::TokenPermissionChange, &permission)?;
        self.validate_upsert_token_permission(&permission)?;
        info!(community_id = %self.id, permission_id = %permission.id, "Upserting token permission");
        let kind = CommunityEventKind::TokenPermissionChange {
            permission: permission.clone(),
        };
        self.commit(kind, move |c| c.apply_upsert_token_permission(permission))
    }

    fn validate_upsert_token_permission(&self, permission: &TokenPermission) -> CommunityResult<()> {
        validate_token_permission(permission)?;
        self.validate_chats_exist(&permission.chat_ids)
    }

    fn apply_upsert_token_permission(&mut self, permission: TokenPermission) -> CommunityChanges {
        let mut changes = self.empty_changes();
        let id = permission.id.clone();
        match self.description.token_permissions.insert(id.clone(), permission.clone()) {
            None => {
                changes.token_permissions_added.insert(id, permission);
            }
            Some(previous) if previous != permission => {
                changes.token_permissions_modified.insert(id, permission);
            }
            Some(_) => {}
        }
        changes
    }

    pub fn delete_token_permission(&mut self, permission_id: &str) -> CommunityResult<CommunityChanges> {
        let permission = self
            .description
            .token_permissions
            .get(permission_id)
            .cloned()
            .ok_or_else(|| CommunityError::TokenPermissionNotFound(permission_id.to_string()))?;
        self.authorize_permission(CommunityEventType::TokenPermissionDelete, &permission)?;
        info!(community_id = %self.id, permission_id, "Deleting token permission");
        let kind = CommunityEventKind::TokenPermissionDelete { permission };
        self.commit(kind, |c| c.apply_delete_token_permission(permission_id))
    }

    fn apply_delete_token_permission(&mut self, permission_id: &str) -> CommunityChanges {
        let mut changes = self.empty_changes();
        if let Some(permission) = self.description.token_permissions.remove(permission_id) {
            changes
                .token_permissions_removed
                .insert(permission_id.to_string(), permission);
        }
        changes
    }

    // Requests to join

    /// Accept a join request; the member joins every public chat
    pub fn accept_request_to_join(&mut self, key: &MemberKey) -> CommunityResult<CommunityChanges> {
        self.authorize(CommunityEventType::RequestToJoinAccept)?;
        if self.is_banned(key) {
            return Err(CommunityError::MemberBanned);
        }
        let kind = CommunityEventKind::RequestToJoinAccept { member: *key };
        self.commit(kind, |c| c.apply_accept_request_to_join(key))
    }

    fn apply_accept_request_to_join(&mut self, key: &MemberKey) -> CommunityChanges {
        let mut changes = self.empty_changes();
        if self.has_member(key) {
            return changes;
        }
        let mut member = CommunityMember::with_role(MemberRole::None);
        member.last_update_clock = self.clock();
        self.description.members.insert(*key, member.clone());
        changes.members_added.insert(*key, member);

        let public: Vec<ChatId> = self
            .description
            .chats
            .keys()
            .filter(|id| !self.channel_encrypted(id))
            .cloned()
            .collect();
        for chat_id in public {
            if let Some(chat) = self.description.chats.get_mut(&chat_id) {
                let chat_member = CommunityMember::default();
                chat.members.insert(*key, chat_member.clone());
                changes.add_chat_member(&chat_id, *key, chat_member);
            }
        }
        changes
    }

    /// Decline a join request; returns whether a delegated event was created
    pub fn decline_request_to_join(&mut self, key: &MemberKey) -> CommunityResult<bool> {
        self.authorize(CommunityEventType::RequestToJoinReject)?;
        if self.is_control_node() {
            if self.has_member(key) {
                self.apply_remove_member(key);
                self.increase_clock();
            }
            return Ok(false);
        }
        let event = self.new_event(CommunityEventKind::RequestToJoinReject { member: *key });
        self.add_new_community_event(event)?;
        Ok(true)
    }

    // Control node bookkeeping

    /// Returns whether the count changed
    pub fn set_active_members_count(&mut self, count: u64) -> CommunityResult<bool> {
        self.require_control_node()?;
        if self.description.active_members_count == count {
            return Ok(false);
        }
        self.description.active_members_count = count;
        self.increase_clock();
        Ok(true)
    }

    /// Record an earlier first-message timestamp for a chat
    pub fn update_chat_first_message_timestamp(
        &mut self,
        chat_id: &str,
        timestamp: u32,
    ) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        let Some(chat) = self.description.chats.get(chat_id) else {
            return Err(CommunityError::ChatNotFound(chat_id.to_string()));
        };
        let current = chat.identity.first_message_timestamp;
        if current != 0 && current <= timestamp {
            return Ok(self.empty_changes());
        }
        self.commit_as_control_node(|c| {
            let before = c.description.chats.clone();
            if let Some(chat) = c.description.chats.get_mut(chat_id) {
                chat.identity.first_message_timestamp = timestamp;
            }
            let mut changes = c.empty_changes();
            c.chat_layout_changes(&before, &mut changes);
            changes
        })
    }

    pub fn set_shard(&mut self, shard: Option<Shard>) -> CommunityResult<()> {
        self.require_control_node()?;
        if self.description.shard != shard {
            self.description.shard = shard;
            self.increase_clock();
        }
        Ok(())
    }

    // Replay

    /// Validate and apply an event as control node, without advancing the clock
    pub(super) fn replay_event(&mut self, event: &CommunityEvent) -> CommunityResult<CommunityChanges> {
        self.require_control_node()?;
        use CommunityEventKind as K;
        let changes = match &event.kind {
            K::CommunityEdit { metadata } => {
                self.description.apply_metadata(metadata.clone());
                self.empty_changes()
            }
            K::TokenPermissionChange { permission } => {
                self.validate_upsert_token_permission(permission)?;
                self.apply_upsert_token_permission(permission.clone())
            }
            K::TokenPermissionDelete { permission } => {
                if !self.description.token_permissions.contains_key(&permission.id) {
                    return Err(CommunityError::TokenPermissionNotFound(permission.id.clone()));
                }
                self.apply_delete_token_permission(&permission.id)
            }
            K::CategoryCreate { category, chat_ids } => {
                self.validate_create_category(category, chat_ids)?;
                self.apply_create_category(category.clone(), chat_ids)
            }
            K::CategoryEdit { category, chat_ids } => {
                self.validate_edit_category(&category.category_id, &category.name, chat_ids)?;
                self.apply_edit_category(category.clone(), chat_ids)
            }
            K::CategoryDelete { category_id } => {
                if !self.description.categories.contains_key(category_id) {
                    return Err(CommunityError::CategoryNotFound(category_id.clone()));
                }
                self.apply_delete_category(category_id)
            }
            K::CategoryReorder { category_id, position } => {
                if !self.description.categories.contains_key(category_id) {
                    return Err(CommunityError::CategoryNotFound(category_id.clone()));
                }
                if *position < 0 {
                    return Err(CommunityError::InvalidDescription("negative position".to_string()));
                }
                self.apply_reorder_category(category_id, *position)
            }
            K::ChannelCreate { chat_id, chat } => {
                self.validate_create_chat(chat_id, chat)?;
                self.apply_create_chat(chat_id.clone(), chat.clone())
            }
            K::ChannelEdit { chat_id, chat } => {
                self.validate_edit_chat(chat_id, chat)?;
                self.apply_edit_chat(chat_id, chat.clone())
            }
            K::ChannelDelete { chat_id } => {
                if !self.description.chats.contains_key(chat_id) {
                    return Err(CommunityError::ChatNotFound(chat_id.clone()));
                }
                self.apply_delete_chat(chat_id)
            }
            K::ChannelReorder {
                chat_id,
                category_id,
                position,
            } => {
                self.validate_reorder_chat(chat_id, category_id, *position)?;
                self.apply_reorder_chat(chat_id, category_id, *position)
            }
            K::RequestToJoinAccept { member } => {
                if self.is_banned(member) {
                    return Err(CommunityError::MemberBanned);
                }
                self.apply_accept_request_to_join(member)
            }
            K::RequestToJoinReject { member } => self.apply_remove_member(member),
            K::MemberKick { member } => {
                if !self.has_member(member) {
                    return Err(CommunityError::MemberNotFound);
                }
                self.apply_remove_member(member)
            }
            K::MemberBan {
                member,
                delete_all_messages,
            } => self.apply_ban(member, *delete_all_messages),
            K::MemberUnban { member } => {
                if !self.is_banned(member) {
                    return Err(CommunityError::BannedMemberNotFound);
                }
                self.apply_unban(member)
            }
            K::DeleteBannedMemberMessages { member } => {
                if !self.is_banned(member) {
                    return Err(CommunityError::BannedMemberNotFound);
                }
                self.description.banned_members.entry(*member).or_default().delete_all_messages = true;
                let mut changes = self.empty_changes();
                changes.banned.insert(*member, true);
                changes
            }
            K::TokenAdd { metadata } => {
                if !self.description.tokens_metadata.contains(metadata) {
                    self.description.tokens_metadata.push(metadata.clone());
                }
                self.empty_changes()
            }
        };
        Ok(changes)
    }
}
