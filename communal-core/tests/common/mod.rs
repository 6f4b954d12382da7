/*
    common - Shared helpers for integration tests

    An in-memory network routing wire messages between sync managers, plus
    deterministic identities and metadata.
*/

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use communal_core::config::Config;
use communal_core::core_community::{
    CommunityIdentity, CommunityMetadata, FixedTimeSource, Identity, MemberKey, PermissionType,
    TokenCriteria, TokenPermission,
};
use communal_core::core_sync::{
    DefaultKeyEncryptor, Destination, MemoryCommunityStore, SyncCollaborators, SyncManager,
    Transport, WireMessage,
};

pub const START_MILLIS: u64 = 1_700_000_000_000;

pub fn identity(seed: u8) -> Identity {
    Identity::from_seed([seed; 32])
}

pub fn metadata(name: &str) -> CommunityMetadata {
    CommunityMetadata {
        identity: CommunityIdentity {
            display_name: name.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A token-gated membership permission, which turns encryption on
pub fn members_only() -> TokenPermission {
    TokenPermission::new("members-only", PermissionType::BecomeMember).with_criteria(TokenCriteria {
        symbol: "SNT".to_string(),
        amount: "1".to_string(),
        ..Default::default()
    })
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: MemberKey,
    pub destination: Destination,
    pub message: WireMessage,
}

/// Message bus shared by every node of a test
#[derive(Debug, Default)]
pub struct Network {
    queue: Mutex<Vec<Envelope>>,
    history: Mutex<Vec<Envelope>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent so far, in send order
    pub async fn history(&self) -> Vec<Envelope> {
        self.history.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    /// Deliver queued messages until no node sends anything new
    pub async fn settle(&self, nodes: &[&Node]) {
        for _ in 0..32 {
            let batch = std::mem::take(&mut *self.queue.lock().await);
            if batch.is_empty() {
                return;
            }
            for envelope in batch {
                for node in nodes {
                    let addressed = match &envelope.destination {
                        Destination::Member(key) => node.addresses.contains(key),
                        _ => !node.addresses.contains(&envelope.from),
                    };
                    if addressed {
                        // Rejections are part of normal operation
                        let _ = node
                            .manager
                            .handle_message(envelope.from, envelope.message.clone())
                            .await;
                    }
                }
            }
        }
        panic!("network did not settle");
    }
}

/// Transport of a single node, authenticated as `from`
pub struct NetworkTransport {
    from: MemberKey,
    network: Arc<Network>,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn send(&self, destination: Destination, message: WireMessage) -> anyhow::Result<()> {
        let envelope = Envelope {
            from: self.from,
            destination,
            message,
        };
        self.network.history.lock().await.push(envelope.clone());
        self.network.queue.lock().await.push(envelope);
        Ok(())
    }
}

pub struct Node {
    pub identity: Identity,
    /// Keys whose private deliveries reach this node
    pub addresses: Vec<MemberKey>,
    pub manager: Arc<SyncManager>,
}

impl Node {
    /// A node whose messages are authenticated as `transport_key`
    pub fn new(
        identity: Identity,
        transport_key: MemberKey,
        network: &Arc<Network>,
        time: &Arc<FixedTimeSource>,
    ) -> Self {
        let transport = Arc::new(NetworkTransport {
            from: transport_key,
            network: network.clone(),
        });
        let manager = SyncManager::new(
            identity.clone(),
            &Config::default(),
            SyncCollaborators {
                transport,
                store: Arc::new(MemoryCommunityStore::new()),
                encryptor: Arc::new(DefaultKeyEncryptor::new()),
            },
        )
        .with_time_source(time.clone());

        let mut addresses = vec![identity.public_key()];
        if transport_key != identity.public_key() {
            addresses.push(transport_key);
        }
        Self {
            identity,
            addresses,
            manager: Arc::new(manager),
        }
    }

    /// A plain member node
    pub fn member(seed: u8, network: &Arc<Network>, time: &Arc<FixedTimeSource>) -> Self {
        let identity = identity(seed);
        let key = identity.public_key();
        Self::new(identity, key, network, time)
    }

    pub fn key(&self) -> MemberKey {
        self.identity.public_key()
    }
}
