/*
    sync_flow.rs - Multi-node sync scenarios

    Several sync managers exchange messages over an in-memory network.
    Each test drives a full flow: discovery, join, delegated governance,
    key rotation and removal.
*/

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{identity, members_only, metadata, Network, Node, START_MILLIS};
use communal_core::core_community::{
    CommunityId, FixedTimeSource, KeyScope, MemberRole, MemberState,
};
use communal_core::core_sync::{CommunityNotification, Destination, WireMessage};

struct Setup {
    network: Arc<Network>,
    time: Arc<FixedTimeSource>,
    owner: Node,
    id: CommunityId,
}

async fn community(name: &str) -> Setup {
    let network = Network::new();
    let time = Arc::new(FixedTimeSource::new(START_MILLIS));
    let community_key = identity(1);
    let owner = Node::new(identity(2), community_key.public_key(), &network, &time);
    let handle = owner
        .manager
        .create_community(community_key, metadata(name))
        .await
        .unwrap();
    Setup {
        network,
        time,
        owner,
        id: handle.id(),
    }
}

/// An encrypted community with one member who joined through a request
async fn joined_encrypted_community() -> (Setup, Node) {
    let setup = community("gated").await;
    let member = Node::member(3, &setup.network, &setup.time);
    setup
        .owner
        .manager
        .apply(setup.id, |c| c.upsert_token_permission(members_only()))
        .await
        .unwrap();
    setup.network.settle(&[&setup.owner, &member]).await;

    member.manager.request_to_join(setup.id, Vec::new()).await.unwrap();
    setup.network.settle(&[&setup.owner, &member]).await;
    (setup, member)
}

#[tokio::test]
async fn test_member_joins_encrypted_community_with_keys_and_grant() {
    let (setup, member) = joined_encrypted_community().await;

    let owner_view = setup.owner.manager.get(&setup.id).await.unwrap();
    assert!(owner_view.read(|c| c.has_member(&member.key())).await);

    let replica = member.manager.get(&setup.id).await.unwrap();
    assert!(replica.read(|c| c.is_encrypted() && c.has_member(&member.key())).await);
    assert!(replica.read(|c| c.local_state().joined).await);
    assert!(!member.manager.has_missing_encryption_key(setup.id).await.unwrap());
    assert!(member.manager.grant(&setup.id, "").await.is_some());
}

#[tokio::test]
async fn test_removed_member_kicked_and_excluded_from_rekey() {
    let (setup, member) = joined_encrypted_community().await;
    let mut notifications = member.manager.subscribe();
    setup.network.clear_history().await;

    let removed = member.key();
    setup
        .owner
        .manager
        .apply(setup.id, |c| c.remove_user_from_org(&removed))
        .await
        .unwrap();
    setup.network.settle(&[&setup.owner, &member]).await;

    let history = setup.network.history().await;
    assert!(history.iter().any(|e| {
        e.destination == Destination::Member(removed) && matches!(e.message, WireMessage::UserKicked { .. })
    }));
    assert!(!history.iter().any(|e| {
        e.destination == Destination::Member(removed)
            && matches!(e.message, WireMessage::EncryptionKeys { .. })
    }));

    let replica = member.manager.get(&setup.id).await.unwrap();
    assert!(!replica.read(|c| c.local_state().joined).await);

    let mut kicked = false;
    while let Ok(notification) = notifications.try_recv() {
        kicked |= matches!(notification, CommunityNotification::MemberKicked { .. });
    }
    assert!(kicked);
}

/// A community with an admin and a plain member, every replica in sync
async fn governed_community() -> (Setup, Node, Node) {
    let setup = community("governed").await;
    let admin = Node::member(4, &setup.network, &setup.time);
    let target = Node::member(5, &setup.network, &setup.time);
    let (admin_key, target_key) = (admin.key(), target.key());
    setup
        .owner
        .manager
        .apply(setup.id, |c| c.add_member(admin_key, MemberRole::Admin))
        .await
        .unwrap();
    setup
        .owner
        .manager
        .apply(setup.id, |c| c.add_member(target_key, MemberRole::None))
        .await
        .unwrap();
    setup.network.settle(&[&setup.owner, &admin, &target]).await;
    (setup, admin, target)
}

#[tokio::test]
async fn test_delegated_ban_reaches_every_replica() {
    let (setup, admin, target) = governed_community().await;
    let target_key = target.key();
    let nodes = [&setup.owner, &admin, &target];

    let admin_view = admin.manager.get(&setup.id).await.unwrap();
    admin
        .manager
        .apply(setup.id, |c| c.ban_user_from_community(&target_key, false))
        .await
        .unwrap();
    let pending = admin_view.read(|c| c.pending_and_banned_members()).await;
    assert_eq!(pending.get(&target_key), Some(&MemberState::BanPending));

    setup.network.settle(&nodes).await;

    for node in nodes {
        let view = node.manager.get(&setup.id).await.unwrap();
        assert!(view.read(|c| c.is_banned(&target_key) && !c.has_member(&target_key)).await);
    }
    let pending = admin_view.read(|c| c.pending_and_banned_members()).await;
    assert_eq!(pending.get(&target_key), Some(&MemberState::Banned));
}

#[tokio::test]
async fn test_replayed_old_description_does_not_regress_replica() {
    let setup = community("replay").await;
    let member = Node::member(3, &setup.network, &setup.time);
    let member_key = member.key();
    setup
        .owner
        .manager
        .apply(setup.id, |c| c.add_member(member_key, MemberRole::None))
        .await
        .unwrap();
    setup.network.settle(&[&setup.owner, &member]).await;
    let first = setup
        .network
        .history()
        .await
        .into_iter()
        .find(|e| matches!(e.message, WireMessage::CommunityDescription { .. }))
        .unwrap();

    setup
        .owner
        .manager
        .apply(setup.id, |c| c.set_role_to_member(&member_key, MemberRole::Admin))
        .await
        .unwrap();
    setup.network.settle(&[&setup.owner, &member]).await;

    let replica = member.manager.get(&setup.id).await.unwrap();
    let clock = replica.read(|c| c.clock()).await;
    let err = member
        .manager
        .handle_message(first.from, first.message)
        .await
        .unwrap_err();
    assert!(err.is_stale());
    assert_eq!(replica.read(|c| c.clock()).await, clock);
    assert_eq!(replica.read(|c| c.role_of(&member_key)).await, MemberRole::Admin);
}

#[tokio::test]
async fn test_overdue_key_rotated_to_current_members() {
    let (setup, member) = joined_encrypted_community().await;
    let group = KeyScope::Community.group_id(&setup.id);
    let before = setup
        .owner
        .manager
        .key_distributor()
        .encryptor()
        .current_key_id(&group)
        .await
        .unwrap();

    assert_eq!(setup.owner.manager.rekey_overdue().await, 0);
    setup.time.advance(Duration::from_secs(49 * 3600).as_millis() as u64);
    assert_eq!(setup.owner.manager.rekey_overdue().await, 1);
    setup.network.settle(&[&setup.owner, &member]).await;

    let owner_key = setup
        .owner
        .manager
        .key_distributor()
        .encryptor()
        .current_key_id(&group)
        .await
        .unwrap();
    let member_key = member
        .manager
        .key_distributor()
        .encryptor()
        .current_key_id(&group)
        .await
        .unwrap();
    assert_ne!(owner_key, before);
    assert_eq!(owner_key, member_key);
}

#[tokio::test]
async fn test_redelivered_ban_does_not_undo_unban() {
    let (setup, admin, target) = governed_community().await;
    let target_key = target.key();
    let nodes = [&setup.owner, &admin, &target];
    admin
        .manager
        .apply(setup.id, |c| c.ban_user_from_community(&target_key, false))
        .await
        .unwrap();
    setup.network.settle(&nodes).await;
    let ban = setup
        .network
        .history()
        .await
        .into_iter()
        .find(|e| matches!(e.message, WireMessage::CommunityEvents(_)))
        .unwrap();

    setup
        .owner
        .manager
        .apply(setup.id, |c| c.unban_user_from_community(&target_key))
        .await
        .unwrap();
    setup.network.settle(&nodes).await;

    // The old events message shows up again, out of order
    setup
        .owner
        .manager
        .handle_message(ban.from, ban.message)
        .await
        .unwrap();
    setup.network.clear_history().await;
    admin.manager.publish_pending().await;
    setup.network.settle(&nodes).await;

    let history = setup.network.history().await;
    assert!(!history
        .iter()
        .any(|e| matches!(e.message, WireMessage::CommunityEvents(_))));
    for node in nodes {
        let view = node.manager.get(&setup.id).await.unwrap();
        assert!(view.read(|c| !c.is_banned(&target_key)).await);
    }
    let admin_view = admin.manager.get(&setup.id).await.unwrap();
    assert!(admin_view.read(|c| c.events_data().is_none()).await);
}
