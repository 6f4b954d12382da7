//! Community state: the authoritative description plus local-only state
//!
//! A [`Community`] is never shared directly. It lives behind a
//! [`CommunityHandle`](super::handle::CommunityHandle) which serializes all
//! access, and readers outside the lock receive a [`CommunitySnapshot`].
//!
//! Every mutating operation (see `mutator.rs`) validates first and applies
//! second, so a failed call leaves the record untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::changes::{evaluate_community_changes, CommunityChanges, EvaluationContext};
use super::clock::{next_clock, SystemTimeSource, TimeSource};
use super::codec::{open_description, sign_description, DescriptionCodec, JsonCodec};
use super::description::{AccessMode, CommunityDescription, CommunityMember, CommunityMetadata};
use super::errors::{CommunityError, CommunityResult};
use super::events::{
    roles_authorized_to_perform_event, role_can_perform, CommunityEvent, CommunityEventType,
    CommunityEventsMessage, EventsData, MAX_EVENT_CLOCK_LEAD,
};
use super::grant::{build_grant, verify_grant, Grant, GRANT_EXPIRATION};
use super::membership_filter::MembershipFilter;
use super::overlay::{
    pending_and_banned_members, pending_token_permissions, prune_events, FirstEventWins,
    MemberState, PendingResolution,
};
use super::permissions::{channel_encrypted, PermissionView};
use super::roles::{can_role_modify_permission, ChannelRole, MemberRole};
use super::shard::PublicShardInfo;
use super::types::{Clock, CommunityId, Identity, MemberKey};
use super::validation::validate_description;

/// Default false-positive target of channel membership filters
pub const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Local-only state, never sent to peers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub joined: bool,
    pub spectated: bool,
    pub muted: bool,
    /// Mute expiry in milliseconds, `None` for an indefinite mute
    pub mute_till: Option<u64>,
    pub requested_to_join_at: u64,
    pub last_opened_at: u64,
}

/// Policies and collaborators a community is built with
#[derive(Debug, Clone)]
pub struct CommunityOptions {
    pub grant_expiration: Duration,
    pub bloom_false_positive_rate: f64,
    pub resolution: Arc<dyn PendingResolution>,
    pub codec: Arc<dyn DescriptionCodec>,
    pub time_source: Arc<dyn TimeSource>,
}

impl Default for CommunityOptions {
    fn default() -> Self {
        Self {
            grant_expiration: GRANT_EXPIRATION,
            bloom_false_positive_rate: DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
            resolution: Arc::new(FirstEventWins),
            codec: Arc::new(JsonCodec),
            time_source: Arc::new(SystemTimeSource),
        }
    }
}

impl CommunityOptions {
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_resolution(mut self, resolution: Arc<dyn PendingResolution>) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn DescriptionCodec>) -> Self {
        self.codec = codec;
        self
    }
}

/// Everything needed to rebuild a community from storage or the wire
#[derive(Debug, Clone)]
pub struct CommunityConfig {
    pub id: CommunityId,
    pub member_identity: Identity,
    /// Defaults to the community id
    pub control_node: Option<MemberKey>,
    /// Signing key of the control node, held only by the control node
    pub control_node_key: Option<Identity>,
    pub description: CommunityDescription,
    pub raw_description: Vec<u8>,
    pub local: LocalState,
}

/// Kind of message checked by [`Community::can_post`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    PinMessage,
    EmojiReaction,
}

/// Outcome of processing a batch of delegated events
#[derive(Debug, Clone, PartialEq)]
pub struct EventsOutcome {
    pub accepted: usize,
    pub rejected: usize,
    /// Authoritative changes, present only when the control node applied events
    pub changes: Option<CommunityChanges>,
}

/// Deep copy of a community taken under the lock
#[derive(Debug, Clone, PartialEq)]
pub struct CommunitySnapshot {
    pub id: CommunityId,
    pub control_node: MemberKey,
    pub member_identity: MemberKey,
    pub is_control_node: bool,
    pub description: CommunityDescription,
    pub raw_description: Vec<u8>,
    pub local: LocalState,
    pub events_data: Option<EventsData>,
}

impl CommunitySnapshot {
    pub fn clock(&self) -> Clock {
        self.description.clock
    }

    pub fn is_encrypted(&self) -> bool {
        self.description.is_encrypted()
    }

    pub fn is_privileged_member(&self) -> bool {
        self.description.role_of(&self.member_identity).is_privileged()
    }
}

/// The per-community state machine
#[derive(Debug, Clone)]
pub struct Community {
    pub(super) id: CommunityId,
    pub(super) member_identity: Identity,
    pub(super) control_node: MemberKey,
    pub(super) control_node_key: Option<Identity>,
    pub(super) description: CommunityDescription,
    pub(super) raw_description: Vec<u8>,
    pub(super) local: LocalState,
    pub(super) events_data: Option<EventsData>,
    pub(super) options: CommunityOptions,
}

impl Community {
    pub fn new(config: CommunityConfig, options: CommunityOptions) -> Self {
        Self {
            id: config.id,
            control_node: config.control_node.unwrap_or_else(|| config.id.public_key()),
            member_identity: config.member_identity,
            control_node_key: config.control_node_key,
            description: config.description,
            raw_description: config.raw_description,
            local: config.local,
            events_data: None,
            options,
        }
    }

    /// Create a new community controlled by `community_key`, owned by `owner`
    pub fn create(
        community_key: Identity,
        owner: Identity,
        metadata: CommunityMetadata,
        options: CommunityOptions,
    ) -> CommunityResult<Self> {
        if metadata.identity.display_name.trim().is_empty() {
            return Err(CommunityError::InvalidDescription(
                "display name is empty".to_string(),
            ));
        }
        let id = CommunityId::from(community_key.public_key());
        let mut description = CommunityDescription::default();
        description.apply_metadata(metadata);
        description.clock = next_clock(0, options.time_source.now_millis()).max(1);
        description
            .members
            .insert(owner.public_key(), CommunityMember::with_role(MemberRole::Owner));

        info!(community_id = %id, "Creating community");

        let mut community = Self::new(
            CommunityConfig {
                id,
                member_identity: owner,
                control_node: None,
                control_node_key: Some(community_key),
                description,
                raw_description: Vec::new(),
                local: LocalState {
                    joined: true,
                    ..Default::default()
                },
            },
            options,
        );
        community.raw_description = community.signed_description()?;
        Ok(community)
    }

    pub fn id(&self) -> CommunityId {
        self.id
    }

    pub fn clock(&self) -> Clock {
        self.description.clock
    }

    pub fn control_node(&self) -> MemberKey {
        self.control_node
    }

    pub fn member_identity(&self) -> MemberKey {
        self.member_identity.public_key()
    }

    pub(crate) fn control_node_key(&self) -> Option<&Identity> {
        self.control_node_key
            .as_ref()
            .filter(|k| k.public_key() == self.control_node)
    }

    /// Whether the local node holds the signing key of the current control node
    pub fn is_control_node(&self) -> bool {
        self.control_node_key().is_some()
    }

    pub fn description(&self) -> &CommunityDescription {
        &self.description
    }

    pub fn raw_description(&self) -> &[u8] {
        &self.raw_description
    }

    pub fn local_state(&self) -> &LocalState {
        &self.local
    }

    pub fn events_data(&self) -> Option<&EventsData> {
        self.events_data.as_ref()
    }

    pub fn options(&self) -> &CommunityOptions {
        &self.options
    }

    pub fn is_encrypted(&self) -> bool {
        self.description.is_encrypted()
    }

    pub fn channel_encrypted(&self, chat_id: &str) -> bool {
        channel_encrypted(&self.description.token_permissions, chat_id)
    }

    pub fn has_member(&self, key: &MemberKey) -> bool {
        self.description.has_member(key)
    }

    pub fn is_banned(&self, key: &MemberKey) -> bool {
        self.description.is_banned(key)
    }

    pub fn role_of(&self, key: &MemberKey) -> MemberRole {
        self.description.role_of(key)
    }

    pub fn is_privileged_member(&self, key: &MemberKey) -> bool {
        self.role_of(key).is_privileged()
    }

    pub fn is_member_owner(&self, key: &MemberKey) -> bool {
        self.role_of(key) == MemberRole::Owner
    }

    pub fn is_member_admin(&self, key: &MemberKey) -> bool {
        self.role_of(key) == MemberRole::Admin
    }

    pub fn is_member_token_master(&self, key: &MemberKey) -> bool {
        self.role_of(key) == MemberRole::TokenMaster
    }

    pub fn snapshot(&self) -> CommunitySnapshot {
        CommunitySnapshot {
            id: self.id,
            control_node: self.control_node,
            member_identity: self.member_identity(),
            is_control_node: self.is_control_node(),
            description: self.description.clone(),
            raw_description: self.raw_description.clone(),
            local: self.local.clone(),
            events_data: self.events_data.clone(),
        }
    }

    pub(super) fn now(&self) -> u64 {
        self.options.time_source.now_millis()
    }

    pub(super) fn increase_clock(&mut self) {
        self.description.clock = next_clock(self.description.clock, self.now());
    }

    pub(super) fn empty_changes(&self) -> CommunityChanges {
        CommunityChanges::empty(self.id, self.member_identity())
    }

    // Local state

    pub fn join(&mut self) {
        self.local.joined = true;
        self.local.spectated = false;
    }

    pub fn leave(&mut self) {
        self.local.joined = false;
        self.local.spectated = false;
        self.events_data = None;
    }

    pub fn spectate(&mut self) {
        self.local.spectated = true;
    }

    pub fn mute(&mut self, till: Option<u64>) {
        self.local.muted = true;
        self.local.mute_till = till;
    }

    pub fn unmute(&mut self) {
        self.local.muted = false;
        self.local.mute_till = None;
    }

    pub fn is_muted(&self) -> bool {
        self.local.muted && self.local.mute_till.map_or(true, |till| till > self.now())
    }

    pub fn update_last_opened_at(&mut self, timestamp: u64) {
        self.local.last_opened_at = timestamp;
    }

    pub fn set_requested_to_join_at(&mut self, timestamp: u64) {
        self.local.requested_to_join_at = timestamp;
    }

    fn interested(&self) -> bool {
        self.local.joined || self.local.spectated || self.local.requested_to_join_at > 0
    }

    // Authorization

    /// Whether the local identity may propose `event_type` as a delegated member
    pub fn has_permission_to_send_event(&self, event_type: CommunityEventType) -> bool {
        !self.is_control_node() && role_can_perform(self.role_of(&self.member_identity()), event_type)
    }

    pub(super) fn authorize(&self, event_type: CommunityEventType) -> CommunityResult<()> {
        if self.is_control_node() || self.has_permission_to_send_event(event_type) {
            Ok(())
        } else {
            Err(CommunityError::NotAuthorized)
        }
    }

    pub(super) fn require_control_node(&self) -> CommunityResult<&Identity> {
        self.control_node_key().ok_or(CommunityError::NotControlNode)
    }

    /// Validate an event proposed by `signer` against the current record
    pub fn validate_event(&self, event: &CommunityEvent, signer: &MemberKey) -> CommunityResult<()> {
        event.validate()?;
        let sender = self
            .description
            .members
            .get(signer)
            .ok_or(CommunityError::MemberNotFound)?;
        let target_role = event
            .target_member()
            .map(|t| self.role_of(&t))
            .unwrap_or(MemberRole::None);
        if !roles_authorized_to_perform_event(sender.role(), target_role, event) {
            return Err(CommunityError::NotAuthorized);
        }
        // The stored permission's type governs, not the one the event claims
        if let Some(stored) = event
            .token_permission()
            .and_then(|p| self.description.token_permissions.get(&p.id))
        {
            if !can_role_modify_permission(sender.role(), stored.permission_type) {
                return Err(CommunityError::NotAuthorized);
            }
        }
        Ok(())
    }

    /// Reject events at or below the last applied clock for the same action and target
    fn check_event_not_applied(&self, event: &CommunityEvent) -> CommunityResult<()> {
        if event.clock > self.clock().saturating_add(MAX_EVENT_CLOCK_LEAD) {
            return Err(CommunityError::InvalidEvent(format!(
                "clock {} too far ahead of {}",
                event.clock,
                self.clock()
            )));
        }
        match self.description.last_applied_events.get(&event.applied_key()) {
            Some(&last_applied) if event.clock <= last_applied => Err(CommunityError::EventAlreadyApplied {
                clock: event.clock,
                last_applied,
            }),
            _ => Ok(()),
        }
    }

    /// Record a provisional event proposed by the local identity
    pub(super) fn add_new_community_event(&mut self, event: CommunityEvent) -> CommunityResult<()> {
        self.validate_event(&event, &self.member_identity())?;
        let clock = self.description.clock;
        let raw = self.raw_description.clone();
        let data = self
            .events_data
            .get_or_insert_with(|| EventsData::new(clock, raw));
        debug!(
            community_id = %self.id,
            event_type = ?event.event_type(),
            pending = data.events.len() + 1,
            "Recording community event"
        );
        data.events.push(event);
        Ok(())
    }

    pub(super) fn new_event(&self, kind: super::events::CommunityEventKind) -> CommunityEvent {
        let latest = self
            .events_data
            .iter()
            .flat_map(|d| d.events.iter().map(|e| e.clock))
            .fold(self.description.clock, Clock::max);
        CommunityEvent::new(latest + 1, kind)
    }

    // Read paths

    /// Token permissions, with pending changes for privileged members
    pub fn token_permissions(&self) -> BTreeMap<String, PermissionView> {
        let events = match &self.events_data {
            Some(data) if self.is_privileged_member(&self.member_identity()) => data.events.as_slice(),
            _ => &[],
        };
        pending_token_permissions(
            &self.description.token_permissions,
            events,
            self.options.resolution.as_ref(),
        )
    }

    pub fn pending_and_banned_members(&self) -> BTreeMap<MemberKey, MemberState> {
        let events = self
            .events_data
            .as_ref()
            .map(|d| d.events.as_slice())
            .unwrap_or(&[]);
        pending_and_banned_members(&self.description, events, self.options.resolution.as_ref())
    }

    pub fn is_member_in_chat(&self, key: &MemberKey, chat_id: &str) -> bool {
        self.description
            .chats
            .get(chat_id)
            .is_some_and(|c| c.members.contains_key(key))
    }

    pub fn can_view(&self, key: &MemberKey, chat_id: &str) -> bool {
        let Some(chat) = self.description.chats.get(chat_id) else {
            debug!(chat_id, "can_view: no chat with id");
            return false;
        };
        if key == &self.control_node {
            return true;
        }
        if self.is_banned(key) {
            debug!(chat_id, "can_view: user is banned");
            return false;
        }
        if !self.has_member(key) {
            debug!(chat_id, "can_view: not a community member");
            return false;
        }
        chat.members.contains_key(key)
    }

    pub fn can_post(&self, key: &MemberKey, chat_id: &str, kind: MessageKind) -> bool {
        if !self.can_view(key, chat_id) {
            return false;
        }
        let Some(chat) = self.description.chats.get(chat_id) else {
            return false;
        };
        let channel_role = chat
            .members
            .get(key)
            .map(|m| m.channel_role)
            .unwrap_or_default();
        match kind {
            MessageKind::PinMessage => {
                self.is_privileged_member(key)
                    || self.description.admin_settings.pin_message_all_members_enabled
            }
            MessageKind::EmojiReaction => {
                channel_role == ChannelRole::Poster
                    || (channel_role == ChannelRole::Viewer && chat.viewers_can_post_reactions)
            }
            MessageKind::Text => channel_role == ChannelRole::Poster,
        }
    }

    pub fn can_request_access(&self, key: &MemberKey) -> bool {
        !self.has_member(key) && !self.is_banned(key)
    }

    /// Check that `key` may ask to join this community
    pub fn validate_request_to_join(&self, key: &MemberKey) -> CommunityResult<()> {
        if self.is_banned(key) {
            return Err(CommunityError::MemberBanned);
        }
        if self.has_member(key) {
            return Err(CommunityError::AlreadyMember);
        }
        Ok(())
    }

    /// Whether join requests are accepted without review
    pub fn auto_accept(&self) -> bool {
        self.description.permissions.access == AccessMode::AutoAccept
    }

    pub fn can_manage_users(&self, key: &MemberKey) -> bool {
        key == &self.control_node || (self.has_member(key) && self.is_privileged_member(key))
    }

    pub fn can_delete_message_for_everyone(&self, key: &MemberKey) -> bool {
        self.can_manage_users(key)
    }

    /// Estimate whether the local identity is a member of `chat_id`
    ///
    /// Never yields a false negative for a member included in the filter.
    pub fn is_member_likely_in_chat(&self, chat_id: &str) -> bool {
        let me = self.member_identity();
        if self.is_control_node() || self.is_privileged_member(&me) || !self.channel_encrypted(chat_id) {
            return true;
        }
        let Some(chat) = self.description.chats.get(chat_id) else {
            return false;
        };
        let Some(filter) = &chat.members_list else {
            return false;
        };
        match filter.verify_membership(&self.member_identity, &self.control_node, chat_id, self.clock()) {
            Ok(result) => result,
            Err(e) => {
                warn!(community_id = %self.id, chat_id, error = %e, "Failed to estimate membership");
                false
            }
        }
    }

    // Grants

    /// Build a grant for `member`, control node only
    pub fn build_grant(&self, member: &MemberKey, chat_id: &str) -> CommunityResult<Vec<u8>> {
        let signer = self.require_control_node()?;
        build_grant(
            signer,
            self.id,
            member,
            chat_id,
            self.clock(),
            self.now(),
            self.options.grant_expiration,
        )
    }

    pub fn verify_grant_signature(&self, data: &[u8]) -> CommunityResult<Grant> {
        verify_grant(data, &self.id, &self.control_node, self.now())
    }

    // Publication

    /// Rebuild channel membership filters and sign the description
    ///
    /// Stores the result as the current raw description.
    pub fn signed_description(&mut self) -> CommunityResult<Vec<u8>> {
        let signer = self.require_control_node()?.clone();
        let clock = self.description.clock;
        let rate = self.options.bloom_false_positive_rate;
        let encrypted: Vec<String> = self
            .description
            .chats
            .keys()
            .filter(|id| channel_encrypted(&self.description.token_permissions, id))
            .cloned()
            .collect();
        for (chat_id, chat) in self.description.chats.iter_mut() {
            chat.members_list = if encrypted.contains(chat_id) {
                Some(MembershipFilter::build(&signer, chat.members.keys(), chat_id, clock, rate)?)
            } else {
                None
            };
        }
        let signed = sign_description(self.options.codec.as_ref(), &signer, &self.description)?;
        self.raw_description = signed.clone();
        Ok(signed)
    }

    /// Sign the public shard announcement with the community key
    pub fn signed_shard_info(&self) -> CommunityResult<Vec<u8>> {
        let signer = self.require_control_node()?;
        PublicShardInfo {
            community_id: self.id,
            shard: self.description.shard,
            clock: self.clock(),
        }
        .sign(signer)
    }

    /// Sign the pending events of the local delegated member for publication
    pub fn events_message(&self) -> CommunityResult<Option<CommunityEventsMessage>> {
        let Some(data) = &self.events_data else {
            return Ok(None);
        };
        if data.events.is_empty() {
            return Ok(None);
        }
        let events = data
            .events
            .iter()
            .map(|e| e.sign(&self.member_identity))
            .collect::<CommunityResult<Vec<_>>>()?;
        Ok(Some(CommunityEventsMessage {
            community_id: self.id,
            events_base_description: data.events_base_description.clone(),
            events,
        }))
    }

    // Merge

    /// Merge a description received from the transport
    ///
    /// Fails with the staleness error if `new_description` is older than the
    /// current record. Equal clocks are reprocessed. Returns an empty
    /// change-set when the local member has no interest in the community.
    pub fn update_community_description(
        &mut self,
        new_description: CommunityDescription,
        raw: Vec<u8>,
        new_control_node: Option<MemberKey>,
    ) -> CommunityResult<CommunityChanges> {
        if new_description.clock < self.description.clock {
            return Err(CommunityError::InvalidCommunityDescriptionClockOutdated {
                incoming: new_description.clock,
                current: self.description.clock,
            });
        }
        validate_description(&new_description)?;

        let previous = std::mem::replace(&mut self.description, new_description);
        self.raw_description = raw;

        let mut control_node_changed = None;
        if let Some(control_node) = new_control_node {
            if control_node != self.control_node {
                info!(community_id = %self.id, control_node = %control_node, "Control node changed");
                self.control_node = control_node;
                control_node_changed = Some(control_node);
            }
        }

        self.events_data = if self.is_privileged_member(&self.member_identity()) {
            prune_events(self.events_data.as_ref(), &self.description, &self.raw_description)
        } else {
            None
        };

        if !self.interested() {
            return Ok(self.empty_changes());
        }

        let mut changes = evaluate_community_changes(
            &previous,
            &self.description,
            &EvaluationContext {
                community_id: self.id,
                member_identity: self.member_identity(),
                requested_to_join: self.local.requested_to_join_at > 0,
            },
        );
        changes.control_node_changed = control_node_changed;
        Ok(changes)
    }

    /// Verify and merge a signed description
    ///
    /// The signature must come from `new_control_node` when given, otherwise
    /// from the current control node.
    pub fn update_from_signed(
        &mut self,
        data: &[u8],
        new_control_node: Option<MemberKey>,
    ) -> CommunityResult<CommunityChanges> {
        let signer = new_control_node.unwrap_or(self.control_node);
        let description = open_description(self.options.codec.as_ref(), data, &signer)?;
        self.update_community_description(description, data.to_vec(), new_control_node)
    }

    // Delegated events

    /// Handle a batch of events from delegated members
    ///
    /// The control node replays valid events and advances the clock once.
    /// An event is replayed at most once: its clock must exceed the last
    /// applied clock for the same action and target. Privileged members merge them into their pending view when the batch
    /// was built against the record they hold. Invalid events are skipped.
    pub fn process_events_message(
        &mut self,
        message: &CommunityEventsMessage,
    ) -> CommunityResult<EventsOutcome> {
        if message.community_id != self.id {
            return Err(CommunityError::OrgNotFound(message.community_id.to_string()));
        }

        let mut outcome = EventsOutcome {
            accepted: 0,
            rejected: 0,
            changes: None,
        };

        if self.is_control_node() {
            let mut changes = self.empty_changes();
            for signed in &message.events {
                let result = signed
                    .open()
                    .and_then(|event| {
                        self.validate_event(&event, &signed.signer)?;
                        self.check_event_not_applied(&event)?;
                        Ok(event)
                    })
                    .and_then(|event| {
                        let replayed = self.replay_event(&event)?;
                        self.description
                            .last_applied_events
                            .insert(event.applied_key(), event.clock);
                        Ok(replayed)
                    });
                match result {
                    Ok(event_changes) => {
                        merge_changes(&mut changes, event_changes);
                        outcome.accepted += 1;
                    }
                    Err(e) => {
                        warn!(community_id = %self.id, signer = %signed.signer, error = %e, "Rejecting community event");
                        outcome.rejected += 1;
                    }
                }
            }
            if outcome.accepted > 0 {
                self.increase_clock();
                info!(community_id = %self.id, accepted = outcome.accepted, clock = self.clock(), "Applied community events");
                outcome.changes = Some(changes);
            }
            return Ok(outcome);
        }

        if !self.is_privileged_member(&self.member_identity()) {
            return Ok(outcome);
        }

        let base = open_description(
            self.options.codec.as_ref(),
            &message.events_base_description,
            &self.control_node,
        )?;
        if base.clock != self.description.clock {
            debug!(
                community_id = %self.id,
                base_clock = base.clock,
                clock = self.description.clock,
                "Discarding events built against another description"
            );
            return Ok(outcome);
        }

        let clock = self.description.clock;
        let raw = self.raw_description.clone();
        let mut accepted = Vec::new();
        for signed in &message.events {
            match signed
                .open()
                .and_then(|event| self.validate_event(&event, &signed.signer).map(|_| event))
            {
                Ok(event) => accepted.push(event),
                Err(e) => {
                    warn!(community_id = %self.id, error = %e, "Ignoring invalid community event");
                    outcome.rejected += 1;
                }
            }
        }
        let data = self
            .events_data
            .get_or_insert_with(|| EventsData::new(clock, raw));
        for event in accepted {
            if !data.events.contains(&event) {
                data.events.push(event);
                outcome.accepted += 1;
            }
        }
        Ok(outcome)
    }
}

/// Fold `other` into `into`, later entries overriding earlier ones
pub(super) fn merge_changes(into: &mut CommunityChanges, other: CommunityChanges) {
    into.members_added.extend(other.members_added);
    into.members_removed.extend(other.members_removed);
    into.members_modified.extend(other.members_modified);
    into.token_permissions_added.extend(other.token_permissions_added);
    into.token_permissions_modified.extend(other.token_permissions_modified);
    into.token_permissions_removed.extend(other.token_permissions_removed);
    into.chats_added.extend(other.chats_added);
    into.chats_removed.extend(other.chats_removed);
    for (chat_id, chat_changes) in other.chats_modified {
        let entry = into.chats_modified.entry(chat_id).or_default();
        entry.members_added.extend(chat_changes.members_added);
        entry.members_removed.extend(chat_changes.members_removed);
        entry.category_modified = chat_changes.category_modified.or(entry.category_modified.take());
        entry.position_modified = chat_changes.position_modified.or(entry.position_modified);
        entry.first_message_timestamp_modified = chat_changes
            .first_message_timestamp_modified
            .or(entry.first_message_timestamp_modified);
        entry.identity_modified |= chat_changes.identity_modified;
        entry.permissions_modified |= chat_changes.permissions_modified;
    }
    into.categories_added.extend(other.categories_added);
    into.categories_removed.extend(other.categories_removed);
    into.categories_modified.extend(other.categories_modified);
    into.banned.extend(other.banned);
    for key in other.unbanned {
        if !into.unbanned.contains(&key) {
            into.unbanned.push(key);
        }
    }
}
