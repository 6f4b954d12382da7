//! Pending view of delegated events on top of the authoritative record

use std::collections::BTreeMap;
use std::fmt;

use super::description::CommunityDescription;
use super::events::{CommunityEvent, CommunityEventKind, EventsData};
use super::permissions::{PermissionView, TokenPermission, TokenPermissionState};
use super::types::MemberKey;

/// Picks, for each target, the event that determines its pending state
pub trait PendingResolution: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `target_of` returns `None` for events that do not concern the overlay
    fn select<'a>(
        &self,
        events: &'a [CommunityEvent],
        target_of: &dyn Fn(&CommunityEvent) -> Option<String>,
    ) -> Vec<&'a CommunityEvent>;
}

/// The earliest arriving event for a target wins; later ones are ignored
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstEventWins;

impl PendingResolution for FirstEventWins {
    fn name(&self) -> &'static str {
        "first-event-wins"
    }

    fn select<'a>(
        &self,
        events: &'a [CommunityEvent],
        target_of: &dyn Fn(&CommunityEvent) -> Option<String>,
    ) -> Vec<&'a CommunityEvent> {
        let mut seen = std::collections::HashSet::new();
        events
            .iter()
            .filter(|e| target_of(e).is_some_and(|t| seen.insert(t)))
            .collect()
    }
}

/// The event with the highest clock wins, arrival order breaks ties
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestClockWins;

impl PendingResolution for LatestClockWins {
    fn name(&self) -> &'static str {
        "latest-clock-wins"
    }

    fn select<'a>(
        &self,
        events: &'a [CommunityEvent],
        target_of: &dyn Fn(&CommunityEvent) -> Option<String>,
    ) -> Vec<&'a CommunityEvent> {
        let mut winners: BTreeMap<String, (usize, &'a CommunityEvent)> = BTreeMap::new();
        for (position, event) in events.iter().enumerate() {
            let Some(target) = target_of(event) else {
                continue;
            };
            let replace = winners
                .get(&target)
                .map_or(true, |(_, current)| event.clock >= current.clock);
            if replace {
                winners.insert(target, (position, event));
            }
        }
        let mut selected: Vec<_> = winners.into_values().collect();
        selected.sort_by_key(|(position, _)| *position);
        selected.into_iter().map(|(_, e)| e).collect()
    }
}

/// Ban and pending states of members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Banned,
    BanWithAllMessagesDelete,
    BanPending,
    UnbanPending,
    KickPending,
}

/// Authoritative permissions with pending changes layered on top
pub fn pending_token_permissions(
    authoritative: &BTreeMap<String, TokenPermission>,
    events: &[CommunityEvent],
    resolution: &dyn PendingResolution,
) -> BTreeMap<String, PermissionView> {
    let mut result: BTreeMap<String, PermissionView> = authoritative
        .iter()
        .map(|(id, p)| {
            (
                id.clone(),
                PermissionView {
                    permission: p.clone(),
                    state: TokenPermissionState::Approved,
                },
            )
        })
        .collect();

    let target_of = |e: &CommunityEvent| e.token_permission().map(|p| p.id.clone());
    for event in resolution.select(events, &target_of) {
        match &event.kind {
            CommunityEventKind::TokenPermissionChange { permission } => {
                let state = if result.contains_key(&permission.id) {
                    TokenPermissionState::UpdatePending
                } else {
                    TokenPermissionState::AdditionPending
                };
                result.insert(
                    permission.id.clone(),
                    PermissionView {
                        permission: permission.clone(),
                        state,
                    },
                );
            }
            CommunityEventKind::TokenPermissionDelete { permission } => {
                if let Some(view) = result.get_mut(&permission.id) {
                    view.state = TokenPermissionState::RemovalPending;
                }
            }
            _ => {}
        }
    }
    result
}

/// Banned members plus members with a pending kick, ban or unban
pub fn pending_and_banned_members(
    description: &CommunityDescription,
    events: &[CommunityEvent],
    resolution: &dyn PendingResolution,
) -> BTreeMap<MemberKey, MemberState> {
    let mut result = BTreeMap::new();
    for (key, info) in &description.banned_members {
        let state = if info.delete_all_messages {
            MemberState::BanWithAllMessagesDelete
        } else {
            MemberState::Banned
        };
        result.insert(*key, state);
    }
    for key in &description.ban_list {
        result.entry(*key).or_insert(MemberState::Banned);
    }

    let target_of = |e: &CommunityEvent| match &e.kind {
        CommunityEventKind::MemberKick { member }
        | CommunityEventKind::MemberBan { member, .. }
        | CommunityEventKind::MemberUnban { member } => Some(member.to_hex()),
        _ => None,
    };
    for event in resolution.select(events, &target_of) {
        match &event.kind {
            CommunityEventKind::MemberKick { member } => {
                result.insert(*member, MemberState::KickPending);
            }
            CommunityEventKind::MemberBan { member, .. } => {
                result.insert(*member, MemberState::BanPending);
            }
            CommunityEventKind::MemberUnban { member } => {
                result.insert(*member, MemberState::UnbanPending);
            }
            _ => {}
        }
    }
    result
}

/// Whether `description` already reflects the effect of `event`
pub fn event_reflected(event: &CommunityEvent, description: &CommunityDescription) -> bool {
    use CommunityEventKind as K;
    match &event.kind {
        K::CommunityEdit { metadata } => &description.metadata() == metadata,
        K::TokenPermissionChange { permission } => {
            description.token_permissions.get(&permission.id) == Some(permission)
        }
        K::TokenPermissionDelete { permission } => {
            !description.token_permissions.contains_key(&permission.id)
        }
        K::CategoryCreate { category, .. } | K::CategoryEdit { category, .. } => description
            .categories
            .get(&category.category_id)
            .is_some_and(|c| c.name == category.name),
        K::CategoryDelete { category_id } => !description.categories.contains_key(category_id),
        K::CategoryReorder {
            category_id,
            position,
        } => description
            .categories
            .get(category_id)
            .is_some_and(|c| c.position == *position),
        K::ChannelCreate { chat_id, chat } | K::ChannelEdit { chat_id, chat } => description
            .chats
            .get(chat_id)
            .is_some_and(|c| c.identity == chat.identity),
        K::ChannelDelete { chat_id } => !description.chats.contains_key(chat_id),
        K::ChannelReorder {
            chat_id,
            category_id,
            position,
        } => description
            .chats
            .get(chat_id)
            .is_some_and(|c| &c.category_id == category_id && c.position == *position),
        K::RequestToJoinAccept { member } => description.has_member(member),
        K::RequestToJoinReject { member } | K::MemberKick { member } => {
            !description.has_member(member)
        }
        K::MemberBan { member, .. } => description.is_banned(member),
        K::MemberUnban { member } => !description.is_banned(member),
        K::DeleteBannedMemberMessages { member } => description
            .banned_members
            .get(member)
            .is_some_and(|b| b.delete_all_messages),
        K::TokenAdd { metadata } => description.tokens_metadata.contains(metadata),
    }
}

/// Rebuild pending events against a newly merged description
///
/// Events reflected in `description` are dropped, as are events clocked at
/// or before it: the control node has already applied or rejected those.
/// The result replaces the previous events data wholesale.
pub fn prune_events(
    previous: Option<&EventsData>,
    description: &CommunityDescription,
    raw_description: &[u8],
) -> Option<EventsData> {
    let previous = previous?;
    let remaining: Vec<_> = previous
        .events
        .iter()
        .filter(|e| e.clock > description.clock && !event_reflected(e, description))
        .cloned()
        .collect();
    if remaining.is_empty() {
        return None;
    }
    Some(EventsData {
        base_clock: description.clock,
        events_base_description: raw_description.to_vec(),
        events: remaining,
    })
}
