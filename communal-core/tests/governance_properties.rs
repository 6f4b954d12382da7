/*
    governance_properties.rs - Invariants of the community record

    Clock ordering, stale rejection, ban exclusivity, grant round-trips,
    the delegated authorization gate and rekey-on-removal, plus the three
    reference scenarios of the governance model.
*/

mod common;

use proptest::prelude::*;
use std::sync::Arc;

use common::{identity, members_only, metadata};
use communal_core::core_community::grant::{build_grant, verify_grant};
use communal_core::core_community::{
    evaluate_community_changes, evaluate_encryption_key_actions, Community, CommunityChat,
    CommunityConfig, CommunityError, CommunityId, CommunityOptions, EncryptionKeyActionType,
    EvaluationContext, FixedTimeSource, Identity, LocalState, MemberRole, MemberState,
    GRANT_EXPIRATION,
};

fn control_node_at(now: u64) -> Community {
    let options = CommunityOptions::default().with_time_source(Arc::new(FixedTimeSource::new(now)));
    Community::create(identity(1), identity(2), metadata("props"), options).unwrap()
}

/// The community as held by `member`, built from the control node's latest description
fn replica_of(control: &mut Community, member: &Identity) -> Community {
    let raw = control.signed_description().unwrap();
    Community::new(
        CommunityConfig {
            id: control.id(),
            member_identity: member.clone(),
            control_node: Some(control.control_node()),
            control_node_key: None,
            description: control.description().clone(),
            raw_description: raw,
            local: LocalState {
                joined: true,
                ..Default::default()
            },
        },
        control.options().clone(),
    )
}

#[test]
fn test_scenario_create_chat_advances_clock() {
    let mut control = control_node_at(100);
    assert_eq!(control.clock(), 100);

    control
        .create_chat("general".to_string(), CommunityChat::new("general"))
        .unwrap();

    assert_eq!(control.clock(), 101);
    let chat = &control.description().chats["general"];
    assert!(chat.members.contains_key(&identity(2).public_key()));
    assert_eq!(chat.members.len(), control.description().members.len());
}

#[test]
fn test_scenario_admin_ban_replayed_by_control_node() {
    let mut control = control_node_at(1_000);
    let admin = identity(3);
    let target = identity(4).public_key();
    control.add_member(admin.public_key(), MemberRole::Admin).unwrap();
    control.add_member(target, MemberRole::None).unwrap();
    let mut replica = replica_of(&mut control, &admin);

    replica.ban_user_from_community(&target, false).unwrap();
    assert_eq!(
        replica.pending_and_banned_members().get(&target),
        Some(&MemberState::BanPending)
    );
    assert!(replica.has_member(&target));

    let message = replica.events_message().unwrap().unwrap();
    let outcome = control.process_events_message(&message).unwrap();

    assert_eq!(outcome.accepted, 1);
    assert!(control.is_banned(&target));
    assert!(!control.has_member(&target));
}

#[test]
fn test_scenario_stale_description_rejected() {
    let mut control = control_node_at(60);
    let mut replica = replica_of(&mut control, &identity(3));
    assert_eq!(replica.clock(), 60);
    let before = replica.snapshot();

    let mut old = control.description().clone();
    old.clock = 50;
    let raw = control.raw_description().to_vec();
    let err = replica.update_community_description(old, raw, None).unwrap_err();

    assert!(matches!(
        err,
        CommunityError::InvalidCommunityDescriptionClockOutdated { incoming: 50, current: 60 }
    ));
    assert_eq!(replica.snapshot(), before);
}

#[test]
fn test_member_without_role_cannot_create_chat() {
    let mut control = control_node_at(1_000);
    let member = identity(3);
    control.add_member(member.public_key(), MemberRole::None).unwrap();
    let mut replica = replica_of(&mut control, &member);

    let err = replica
        .create_chat("general".to_string(), CommunityChat::new("general"))
        .unwrap_err();

    assert_eq!(err, CommunityError::NotAuthorized);
    assert!(replica.description().chats.is_empty());
    assert!(replica.events_data().is_none());
}

#[test]
fn test_removal_from_encrypted_community_rekeys() {
    let mut control = control_node_at(1_000);
    let (stays, leaves) = (identity(3).public_key(), identity(4).public_key());
    control.add_member(stays, MemberRole::None).unwrap();
    control.add_member(leaves, MemberRole::None).unwrap();
    control.upsert_token_permission(members_only()).unwrap();
    let origin = control.description().clone();

    control.remove_user_from_org(&leaves).unwrap();
    let actions = evaluate_encryption_key_actions(&origin, control.description());

    let action = &actions.community_key_action;
    assert_eq!(action.action_type, EncryptionKeyActionType::Rekey);
    assert!(action.removed_members.contains_key(&leaves));
    assert!(action.members.contains_key(&stays));
    assert!(!action.members.contains_key(&leaves));
}

#[derive(Debug, Clone)]
enum Op {
    Add(u8, MemberRole),
    Ban(u8),
    Unban(u8),
    Kick(u8),
    SetRole(u8, MemberRole),
}

fn role() -> impl Strategy<Value = MemberRole> {
    prop_oneof![
        Just(MemberRole::None),
        Just(MemberRole::Admin),
        Just(MemberRole::TokenMaster),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    let seed = 3u8..12;
    prop_oneof![
        (seed.clone(), role()).prop_map(|(s, r)| Op::Add(s, r)),
        seed.clone().prop_map(Op::Ban),
        seed.clone().prop_map(Op::Unban),
        seed.clone().prop_map(Op::Kick),
        (seed, role()).prop_map(|(s, r)| Op::SetRole(s, r)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_control_node_operations_keep_invariants(ops in prop::collection::vec(op(), 1..40)) {
        let mut control = control_node_at(1_000);
        for op in ops {
            let before = control.description().clone();
            let result = match op {
                Op::Add(s, r) => control.add_member(identity(s).public_key(), r),
                Op::Ban(s) => control.ban_user_from_community(&identity(s).public_key(), false),
                Op::Unban(s) => control.unban_user_from_community(&identity(s).public_key()),
                Op::Kick(s) => control.remove_user_from_org(&identity(s).public_key()),
                Op::SetRole(s, r) => control.set_role_to_member(&identity(s).public_key(), r),
            };
            match result {
                Ok(changes) if !changes.is_empty() => prop_assert!(control.clock() > before.clock),
                Ok(_) => prop_assert!(control.clock() >= before.clock),
                Err(_) => prop_assert_eq!(control.description(), &before),
            }
            prop_assert!(control.description().ban_exclusivity_holds());
        }

        let ctx = EvaluationContext {
            community_id: control.id(),
            member_identity: identity(3).public_key(),
            requested_to_join: false,
        };
        let description = control.description();
        prop_assert!(evaluate_community_changes(description, description, &ctx).is_empty());
    }

    #[test]
    fn prop_grant_round_trip(
        signer_seed in 1u8..=255,
        member_seed in 1u8..=255,
        chat_id in "[a-z0-9-]{0,16}",
        clock in 1u64..u64::MAX / 2,
        now in 0u64..u64::MAX / 4,
    ) {
        let signer = identity(signer_seed);
        let member = identity(member_seed).public_key();
        let community_id = CommunityId::from(signer.public_key());

        let data = build_grant(&signer, community_id, &member, &chat_id, clock, now, GRANT_EXPIRATION).unwrap();
        let grant = verify_grant(&data, &community_id, &signer.public_key(), now).unwrap();

        prop_assert_eq!(grant.member_key().unwrap(), member);
        prop_assert_eq!(grant.chat_id, chat_id);
        prop_assert_eq!(grant.clock, clock);
    }
}
