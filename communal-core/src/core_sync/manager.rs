//! Community registry and sync manager
//!
//! Owns one [`CommunityHandle`] per known community and connects them to
//! the collaborators: every local mutation goes through [`SyncManager::apply`],
//! every inbound message through [`SyncManager::handle_message`].
//! Publication, key distribution and grant delivery happen after the
//! community lock is released, on a snapshot taken under it.
//!
//! Failures to reach the transport never fail a mutation. They are logged
//! and the next scheduler tick retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::core_community::codec::open_description;
use crate::core_community::permissions::channel_encrypted;
use crate::core_community::types::open_signed_payload;
use crate::core_community::validation::validate_description;
use crate::core_community::{
    evaluate_encryption_key_actions, ChatId, Community, CommunityChanges, CommunityConfig,
    CommunityDescription, CommunityError, CommunityEventsMessage, CommunityHandle, CommunityId, CommunityMetadata,
    CommunityOptions, CommunityResult, EncryptionKeyAction, EncryptionKeyActionType,
    EncryptionKeyActions, Identity, KeyScope, LocalState, MemberKey, PublicShardInfo, Shard,
    ShardKey, TimeSource,
};
use crate::metrics::{record_gauge, MetricsCollector, Timer, COMMUNITIES_REGISTERED, PUBLISH_DURATION};

use super::capabilities::{ActiveMembersSource, OwnershipOracle};
use super::errors::{SyncError, SyncResult};
use super::key_distributor::{CommunityKeyDistributor, DistributionReport, KeyEncryptor, SealedKey};
use super::persistence::{CommunitySettings, CommunityStore, RequestToJoin, RequestToJoinState};
use super::privileged_sync::PrivilegedUserSync;
use super::subscription::{CommunityNotification, CommunityNotifier};
use super::transport::{Destination, Transport, WireMessage};

/// Collaborators every manager needs
#[derive(Clone)]
pub struct SyncCollaborators {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn CommunityStore>,
    pub encryptor: Arc<dyn KeyEncryptor>,
}

#[derive(Debug, Clone)]
struct Published {
    description: CommunityDescription,
    published_at: u64,
}

/// What a control node publishes, captured under the community lock
struct Prepared {
    signer: Identity,
    control_node: MemberKey,
    description: CommunityDescription,
    raw: Vec<u8>,
    shard_info: Vec<u8>,
}

pub struct SyncManager {
    identity: Identity,
    scheduler: SchedulerConfig,
    options: CommunityOptions,
    communities: RwLock<HashMap<CommunityId, CommunityHandle>>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CommunityStore>,
    keys: CommunityKeyDistributor,
    ownership: Option<Arc<dyn OwnershipOracle>>,
    active_members: Option<Arc<dyn ActiveMembersSource>>,
    notifier: CommunityNotifier,
    metrics: Arc<MetricsCollector>,
    published: Mutex<HashMap<CommunityId, Published>>,
    active_members_updated: Mutex<HashMap<CommunityId, u64>>,
    shard_info: Mutex<HashMap<CommunityId, PublicShardInfo>>,
    shard_keys: Mutex<HashMap<CommunityId, ShardKey>>,
    grants: Mutex<HashMap<(CommunityId, ChatId), Vec<u8>>>,
}

impl SyncManager {
    pub fn new(identity: Identity, config: &Config, collaborators: SyncCollaborators) -> Self {
        let keys = CommunityKeyDistributor::new(
            collaborators.encryptor,
            collaborators.transport.clone(),
            config.scheduler.key_retry_attempts,
        );
        Self {
            identity,
            scheduler: config.scheduler.clone(),
            options: config.community_options(),
            communities: RwLock::new(HashMap::new()),
            transport: collaborators.transport,
            store: collaborators.store,
            keys,
            ownership: None,
            active_members: None,
            notifier: CommunityNotifier::default(),
            metrics: Arc::new(MetricsCollector::new()),
            published: Mutex::new(HashMap::new()),
            active_members_updated: Mutex::new(HashMap::new()),
            shard_info: Mutex::new(HashMap::new()),
            shard_keys: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.options = self.options.with_time_source(time_source);
        self
    }

    pub fn with_ownership_oracle(mut self, oracle: Arc<dyn OwnershipOracle>) -> Self {
        self.ownership = Some(oracle);
        self
    }

    pub fn with_active_members_source(mut self, source: Arc<dyn ActiveMembersSource>) -> Self {
        self.active_members = Some(source);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn member_key(&self) -> MemberKey {
        self.identity.public_key()
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn CommunityStore> {
        &self.store
    }

    pub fn key_distributor(&self) -> &CommunityKeyDistributor {
        &self.keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommunityNotification> {
        self.notifier.subscribe()
    }

    fn now(&self) -> u64 {
        self.options.time_source.now_millis()
    }

    fn notify(&self, notification: CommunityNotification) {
        self.notifier.emit(notification);
    }

    // Registry

    /// Start tracking `community`, replacing any previous handle
    pub async fn register(&self, community: Community) -> CommunityHandle {
        let handle = CommunityHandle::new(community);
        let count = {
            let mut communities = self.communities.write().await;
            communities.insert(handle.id(), handle.clone());
            communities.len()
        };
        record_gauge(COMMUNITIES_REGISTERED, count as f64);
        info!(community_id = %handle.id(), "Registered community");
        handle
    }

    /// Create a community controlled by `community_key` and owned by the local identity
    pub async fn create_community(
        &self,
        community_key: Identity,
        metadata: CommunityMetadata,
    ) -> SyncResult<CommunityHandle> {
        let community = Community::create(community_key, self.identity.clone(), metadata, self.options.clone())?;
        let community_id = community.id();
        let clock = community.clock();
        let handle = self.register(community).await;
        self.store
            .save_settings(CommunitySettings {
                community_id,
                history_archive_support_enabled: false,
                clock,
            })
            .await
            .map_err(SyncError::persistence)?;
        self.publish_best_effort(community_id).await;
        Ok(handle)
    }

    pub async fn unregister(&self, community_id: &CommunityId) -> SyncResult<()> {
        let removed = self.communities.write().await.remove(community_id);
        if removed.is_none() {
            return Err(SyncError::CommunityNotFound(*community_id));
        }
        self.keys.forget_community(community_id).await;
        self.published.lock().await.remove(community_id);
        self.active_members_updated.lock().await.remove(community_id);
        self.store
            .delete_settings(community_id)
            .await
            .map_err(SyncError::persistence)?;
        info!(community_id = %community_id, "Unregistered community");
        Ok(())
    }

    pub async fn get(&self, community_id: &CommunityId) -> SyncResult<CommunityHandle> {
        self.lookup(community_id)
            .await
            .ok_or(SyncError::CommunityNotFound(*community_id))
    }

    async fn lookup(&self, community_id: &CommunityId) -> Option<CommunityHandle> {
        self.communities.read().await.get(community_id).cloned()
    }

    pub async fn community_ids(&self) -> Vec<CommunityId> {
        let mut ids: Vec<_> = self.communities.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn handles(&self) -> Vec<CommunityHandle> {
        let mut handles: Vec<_> = self.communities.read().await.values().cloned().collect();
        handles.sort_by_key(|h| h.id());
        handles
    }

    // Local mutations

    /// Run a mutation under the community lock, then publish its effect
    ///
    /// The control node republishes the description; a delegated member
    /// broadcasts its pending events. Publication failures are logged only.
    pub async fn apply<R, F>(&self, community_id: CommunityId, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Community) -> CommunityResult<R>,
    {
        let handle = self.get(&community_id).await?;
        let value = handle.mutate(f).await?;
        self.after_local_change(&handle).await;
        Ok(value)
    }

    async fn after_local_change(&self, handle: &CommunityHandle) {
        let (is_control_node, events) = handle
            .read(|c| (c.is_control_node(), c.events_message()))
            .await;
        if is_control_node {
            self.publish_best_effort(handle.id()).await;
            return;
        }
        match events {
            Ok(Some(message)) => self.send_events(message).await,
            Ok(None) => {}
            Err(e) => warn!(community_id = %handle.id(), error = %e, "Failed to sign community events"),
        }
    }

    async fn send_events(&self, message: CommunityEventsMessage) {
        let community_id = message.community_id;
        let count = message.events.len();
        match self
            .transport
            .send(Destination::Community(community_id), WireMessage::CommunityEvents(message))
            .await
        {
            Ok(()) => debug!(community_id = %community_id, count, "Published community events"),
            Err(e) => warn!(community_id = %community_id, error = %e, "Failed to publish community events"),
        }
    }

    // Publication

    async fn publish_best_effort(&self, community_id: CommunityId) {
        if let Err(e) = self.publish_community(community_id).await {
            warn!(community_id = %community_id, error = %e, "Publication failed, will retry");
        }
    }

    /// Sign and publish the description of a controlled community
    ///
    /// Skipped when a copy with the same or a higher clock was already
    /// published. Keys are distributed first, then removed members of an
    /// encrypted community are told, then the description and the shard
    /// announcement go out. Returns whether anything was published.
    pub async fn publish_community(&self, community_id: CommunityId) -> SyncResult<bool> {
        let handle = self.get(&community_id).await?;
        let prepared = handle
            .mutate(|c| -> CommunityResult<Option<Prepared>> {
                let Some(signer) = c.control_node_key().cloned() else {
                    return Ok(None);
                };
                let raw = c.signed_description()?;
                let shard_info = c.signed_shard_info()?;
                Ok(Some(Prepared {
                    signer,
                    control_node: c.control_node(),
                    description: c.description().clone(),
                    raw,
                    shard_info,
                }))
            })
            .await?;
        let Some(prepared) = prepared else {
            return Ok(false);
        };

        let now = self.now();
        let clock = prepared.description.clock;
        let previous = {
            let mut published = self.published.lock().await;
            if let Some(last) = published.get(&community_id) {
                if last.description.clock >= clock {
                    debug!(community_id = %community_id, clock, "Description already published");
                    return Ok(false);
                }
            }
            published.insert(
                community_id,
                Published {
                    description: prepared.description.clone(),
                    published_at: now,
                },
            )
        };

        let timer = Timer::new(PUBLISH_DURATION);
        let origin = previous
            .as_ref()
            .map(|p| p.description.clone())
            .unwrap_or_default();

        let actions = evaluate_encryption_key_actions(&origin, &prepared.description);
        let report = self
            .keys
            .distribute(community_id, &prepared.signer, &actions, now)
            .await;
        self.record_key_report(&report);

        if prepared.description.is_encrypted() {
            let removed = origin
                .members
                .keys()
                .filter(|k| !prepared.description.members.contains_key(*k));
            for member in removed {
                if let Err(e) = self
                    .transport
                    .send(Destination::Member(*member), WireMessage::UserKicked { community_id })
                    .await
                {
                    warn!(community_id = %community_id, member = %member, error = %e, "Failed to notify removed member");
                }
            }
        }

        let sent = self
            .transport
            .send(
                Destination::Community(community_id),
                WireMessage::CommunityDescription {
                    community_id,
                    signer: prepared.control_node,
                    data: prepared.raw,
                },
            )
            .await;
        if let Err(e) = sent {
            let mut published = self.published.lock().await;
            if published
                .get(&community_id)
                .is_some_and(|p| p.description.clock == clock)
            {
                match previous {
                    Some(previous) => published.insert(community_id, previous),
                    None => published.remove(&community_id),
                };
            }
            return Err(SyncError::transport(e));
        }

        if let Err(e) = self
            .transport
            .send(
                Destination::Shard(Shard::default_shard().pubsub_topic()),
                WireMessage::PublicShardInfo {
                    community_id,
                    data: prepared.shard_info,
                },
            )
            .await
        {
            warn!(community_id = %community_id, error = %e, "Failed to publish shard info");
        }

        timer.stop();
        self.metrics.inc_published(1);
        self.save_clock(community_id, clock).await?;
        info!(community_id = %community_id, clock, "Published community description");
        self.notify(CommunityNotification::Published { community_id, clock });
        Ok(true)
    }

    /// Resend the last signed description without re-evaluating keys
    async fn readvertise(&self, handle: &CommunityHandle, now: u64) {
        let community_id = handle.id();
        let (control_node, raw) = handle
            .read(|c| (c.control_node(), c.raw_description().to_vec()))
            .await;
        let result = self
            .transport
            .send(
                Destination::Community(community_id),
                WireMessage::CommunityDescription {
                    community_id,
                    signer: control_node,
                    data: raw,
                },
            )
            .await;
        match result {
            Ok(()) => {
                if let Some(last) = self.published.lock().await.get_mut(&community_id) {
                    last.published_at = now;
                }
                debug!(community_id = %community_id, "Re-advertised community description");
            }
            Err(e) => warn!(community_id = %community_id, error = %e, "Failed to re-advertise description"),
        }
    }

    /// One round of the publication loop; returns how many descriptions were published
    ///
    /// Controlled communities with unpublished changes are published, the
    /// others re-advertised once `advertise_min_interval` has passed.
    /// Delegated members rebroadcast their pending events.
    pub async fn publish_pending(&self) -> usize {
        let now = self.now();
        let min_interval = self.scheduler.advertise_min_interval.as_millis() as u64;
        let mut published = 0;

        for handle in self.handles().await {
            let community_id = handle.id();
            let (is_control_node, clock, events) = handle
                .read(|c| (c.is_control_node(), c.clock(), c.events_message()))
                .await;

            if !is_control_node {
                if let Ok(Some(message)) = events {
                    self.send_events(message).await;
                }
                continue;
            }

            let last = self
                .published
                .lock()
                .await
                .get(&community_id)
                .map(|p| (p.description.clock, p.published_at));
            match last {
                Some((last_clock, published_at)) if last_clock >= clock => {
                    if now.saturating_sub(published_at) >= min_interval {
                        self.readvertise(&handle, now).await;
                    }
                }
                _ => match self.publish_community(community_id).await {
                    Ok(true) => published += 1,
                    Ok(false) => {}
                    Err(e) => warn!(community_id = %community_id, error = %e, "Publication failed, will retry"),
                },
            }
        }

        published
    }

    async fn save_clock(&self, community_id: CommunityId, clock: u64) -> SyncResult<()> {
        let mut settings = self
            .store
            .get_settings(&community_id)
            .await
            .map_err(SyncError::persistence)?
            .unwrap_or(CommunitySettings {
                community_id,
                history_archive_support_enabled: false,
                clock: 0,
            });
        settings.clock = clock;
        self.store
            .save_settings(settings)
            .await
            .map_err(SyncError::persistence)
    }

    pub async fn set_history_archive_support(&self, community_id: CommunityId, enabled: bool) -> SyncResult<()> {
        let clock = self.get(&community_id).await?.read(|c| c.clock()).await;
        let mut settings = self
            .store
            .get_settings(&community_id)
            .await
            .map_err(SyncError::persistence)?
            .unwrap_or(CommunitySettings {
                community_id,
                history_archive_support_enabled: enabled,
                clock,
            });
        settings.history_archive_support_enabled = enabled;
        self.store
            .save_settings(settings)
            .await
            .map_err(SyncError::persistence)
    }

    // Encryption keys

    fn record_key_report(&self, report: &DistributionReport) {
        if !report.generated.is_empty() {
            self.metrics.inc_rekeys(report.generated.len() as u64);
        }
        if report.failed > 0 {
            self.metrics.inc_key_delivery_failed(report.failed as u64);
        }
    }

    /// One round of the rekey loop; returns how many keys were rotated
    pub async fn rekey_overdue(&self) -> usize {
        let now = self.now();
        let interval = self.scheduler.rekey_interval;
        let mut rotated = 0;

        for handle in self.handles().await {
            let community_id = handle.id();
            let Some((signer, description)) = handle
                .read(|c| c.control_node_key().cloned().map(|k| (k, c.description().clone())))
                .await
            else {
                continue;
            };

            let mut scopes = BTreeMap::new();
            if description.is_encrypted() {
                scopes.insert(KeyScope::Community, description.members.clone());
            }
            for (chat_id, chat) in &description.chats {
                if channel_encrypted(&description.token_permissions, chat_id) {
                    scopes.insert(KeyScope::Channel(chat_id.clone()), chat.members.clone());
                }
            }
            if scopes.is_empty() {
                continue;
            }

            let overdue = self
                .keys
                .overdue_scopes(community_id, scopes.keys().cloned(), now, interval)
                .await;
            if overdue.is_empty() {
                continue;
            }

            let mut actions = EncryptionKeyActions::default();
            for scope in overdue {
                let Some(members) = scopes.remove(&scope) else {
                    continue;
                };
                let action = EncryptionKeyAction {
                    action_type: EncryptionKeyActionType::Rekey,
                    members,
                    removed_members: BTreeMap::new(),
                };
                match scope {
                    KeyScope::Community => actions.community_key_action = action,
                    KeyScope::Channel(chat_id) => {
                        actions.channel_keys_actions.insert(chat_id, action);
                    }
                }
            }

            info!(community_id = %community_id, "Rotating overdue encryption keys");
            let report = self.keys.distribute(community_id, &signer, &actions, now).await;
            rotated += report.generated.len();
            self.record_key_report(&report);
        }

        rotated
    }

    /// Retry failed key deliveries to recipients that still belong to the scope
    pub async fn retry_key_deliveries(&self) -> DistributionReport {
        let mut views = HashMap::new();
        for handle in self.handles().await {
            if let Some(view) = handle
                .read(|c| c.control_node_key().cloned().map(|k| (k, c.description().clone())))
                .await
            {
                views.insert(handle.id(), view);
            }
        }

        let report = self
            .keys
            .retry_pending(
                |id| views.get(id).map(|(signer, _)| signer.clone()),
                |id, scope, member| {
                    views.get(id).is_some_and(|(_, d)| match scope {
                        KeyScope::Community => d.members.contains_key(member),
                        KeyScope::Channel(chat_id) => d
                            .chats
                            .get(chat_id)
                            .is_some_and(|chat| chat.members.contains_key(member)),
                    })
                },
            )
            .await;
        self.record_key_report(&report);
        report
    }

    /// Encrypted scopes the local member belongs to but holds no key for
    pub async fn missing_encryption_scopes(&self, community_id: CommunityId) -> SyncResult<Vec<KeyScope>> {
        let handle = self.get(&community_id).await?;
        let (is_control_node, me, description) = handle
            .read(|c| (c.is_control_node(), c.member_identity(), c.description().clone()))
            .await;
        if is_control_node {
            return Ok(Vec::new());
        }

        let mut scopes = Vec::new();
        if description.is_encrypted() && description.has_member(&me) {
            scopes.push(KeyScope::Community);
        }
        for (chat_id, chat) in &description.chats {
            if chat.members.contains_key(&me) && channel_encrypted(&description.token_permissions, chat_id) {
                scopes.push(KeyScope::Channel(chat_id.clone()));
            }
        }

        let mut missing = Vec::new();
        for scope in scopes {
            let current = self
                .keys
                .encryptor()
                .current_key_id(&scope.group_id(&community_id))
                .await
                .map_err(SyncError::encryption)?;
            if current.is_none() {
                missing.push(scope);
            }
        }
        Ok(missing)
    }

    pub async fn has_missing_encryption_key(&self, community_id: CommunityId) -> SyncResult<bool> {
        Ok(!self.missing_encryption_scopes(community_id).await?.is_empty())
    }

    /// Ask the control node for every missing key; returns whether a request was sent
    pub async fn request_encryption_keys(&self, community_id: CommunityId) -> SyncResult<bool> {
        let missing = self.missing_encryption_scopes(community_id).await?;
        if missing.is_empty() {
            return Ok(false);
        }
        let control_node = self.get(&community_id).await?.read(|c| c.control_node()).await;

        let chat_ids: Vec<ChatId> = missing
            .iter()
            .filter_map(|s| match s {
                KeyScope::Channel(chat_id) => Some(chat_id.clone()),
                KeyScope::Community => None,
            })
            .collect();
        let mut requests = Vec::new();
        if missing.contains(&KeyScope::Community) {
            requests.push(Vec::new());
        }
        if !chat_ids.is_empty() {
            requests.push(chat_ids);
        }

        for chat_ids in requests {
            self.transport
                .send(
                    Destination::Member(control_node),
                    WireMessage::EncryptionKeysRequest {
                        community_id,
                        chat_ids,
                    },
                )
                .await
                .map_err(SyncError::transport)?;
        }
        debug!(community_id = %community_id, missing = missing.len(), "Requested encryption keys");
        Ok(true)
    }

    // Grants

    /// One round of the grant loop; returns how many grants were issued
    ///
    /// Covers every member of encrypted, controlled communities: one
    /// community-wide grant plus one per encrypted chat they belong to.
    pub async fn refresh_grants(&self) -> usize {
        let me = self.member_key();
        let mut issued = 0;

        for handle in self.handles().await {
            let community_id = handle.id();
            let grants = handle
                .read(|c| -> CommunityResult<Vec<(MemberKey, ChatId, Vec<u8>)>> {
                    if !c.is_control_node() || !c.is_encrypted() {
                        return Ok(Vec::new());
                    }
                    let mut grants = Vec::new();
                    for member in c.description().members.keys() {
                        grants.push((*member, String::new(), c.build_grant(member, "")?));
                        for (chat_id, chat) in &c.description().chats {
                            if chat.members.contains_key(member) && c.channel_encrypted(chat_id) {
                                grants.push((*member, chat_id.clone(), c.build_grant(member, chat_id)?));
                            }
                        }
                    }
                    Ok(grants)
                })
                .await;
            let grants = match grants {
                Ok(grants) => grants,
                Err(e) => {
                    error!(community_id = %community_id, error = %e, "Failed to build grants");
                    continue;
                }
            };

            for (member, chat_id, data) in grants {
                if member == me {
                    self.grants.lock().await.insert((community_id, chat_id), data);
                    issued += 1;
                    continue;
                }
                match self
                    .transport
                    .send(Destination::Member(member), WireMessage::Grant { community_id, data })
                    .await
                {
                    Ok(()) => issued += 1,
                    Err(e) => warn!(community_id = %community_id, member = %member, error = %e, "Failed to deliver grant"),
                }
            }
        }

        if issued > 0 {
            self.metrics.inc_grants_issued(issued as u64);
            debug!(issued, "Refreshed grants");
        }
        issued
    }

    /// Latest verified grant held for `chat_id` (empty for the community-wide grant)
    pub async fn grant(&self, community_id: &CommunityId, chat_id: &str) -> Option<Vec<u8>> {
        self.grants
            .lock()
            .await
            .get(&(*community_id, chat_id.to_string()))
            .cloned()
    }

    // Active members

    /// One round of the active-members loop
    ///
    /// Updates at most one controlled community, skipping those refreshed
    /// less than `active_members_min_interval` ago.
    pub async fn update_active_members(&self) -> SyncResult<Option<CommunityId>> {
        let Some(source) = self.active_members.clone() else {
            return Ok(None);
        };
        let now = self.now();
        let min_interval = self.scheduler.active_members_min_interval.as_millis() as u64;

        let mut controlled = Vec::new();
        for handle in self.handles().await {
            if handle.read(|c| c.is_control_node()).await {
                controlled.push(handle.id());
            }
        }
        let due = {
            let updated = self.active_members_updated.lock().await;
            controlled.into_iter().find(|id| {
                updated
                    .get(id)
                    .map_or(true, |at| now.saturating_sub(*at) >= min_interval)
            })
        };
        let Some(community_id) = due else {
            return Ok(None);
        };

        let count = source
            .active_members_count(&community_id, now.saturating_sub(min_interval))
            .await
            .map_err(SyncError::collaborator)?;
        self.active_members_updated.lock().await.insert(community_id, now);
        let changed = self
            .apply(community_id, |c| c.set_active_members_count(count))
            .await?;
        debug!(community_id = %community_id, count, changed, "Updated active members count");
        Ok(Some(community_id))
    }

    // Shards

    /// Set the shard of a controlled community
    ///
    /// With `private_key`, the topic key is sent privately to every member.
    pub async fn set_shard(
        &self,
        community_id: CommunityId,
        shard: Option<Shard>,
        private_key: Option<Vec<u8>>,
    ) -> SyncResult<()> {
        self.apply(community_id, |c| c.set_shard(shard)).await?;
        let (Some(shard), Some(private_key)) = (shard, private_key) else {
            return Ok(());
        };

        let handle = self.get(&community_id).await?;
        let (signer, clock, members) = handle
            .read(|c| -> CommunityResult<_> {
                let signer = c.control_node_key().cloned().ok_or(CommunityError::NotControlNode)?;
                Ok((signer, c.clock(), c.description().members.keys().copied().collect::<Vec<_>>()))
            })
            .await?;
        let key = ShardKey {
            community_id,
            shard,
            private_key,
            clock,
        };
        let data = signer.sign_payload(&serde_json::to_vec(&key).map_err(CommunityError::from)?);
        self.shard_keys.lock().await.insert(community_id, key);

        for member in members.into_iter().filter(|m| *m != self.member_key()) {
            if let Err(e) = self
                .transport
                .send(
                    Destination::Member(member),
                    WireMessage::ShardKey {
                        community_id,
                        data: data.clone(),
                    },
                )
                .await
            {
                warn!(community_id = %community_id, member = %member, error = %e, "Failed to deliver shard key");
            }
        }
        Ok(())
    }

    pub async fn public_shard_info(&self, community_id: &CommunityId) -> Option<PublicShardInfo> {
        self.shard_info.lock().await.get(community_id).cloned()
    }

    pub async fn shard_key(&self, community_id: &CommunityId) -> Option<ShardKey> {
        self.shard_keys.lock().await.get(community_id).cloned()
    }

    // Requests to join

    /// Ask the control node to let the local identity join
    pub async fn request_to_join(
        &self,
        community_id: CommunityId,
        revealed_addresses: Vec<String>,
    ) -> SyncResult<RequestToJoin> {
        let handle = self.get(&community_id).await?;
        let me = self.member_key();
        let now = self.now();
        let control_node = handle
            .mutate(|c| -> CommunityResult<MemberKey> {
                c.validate_request_to_join(&me)?;
                c.set_requested_to_join_at(now);
                Ok(c.control_node())
            })
            .await?;

        let mut request = RequestToJoin::new(community_id, me, now);
        request.revealed_addresses = revealed_addresses.clone();
        self.store
            .save_request_to_join(request.clone())
            .await
            .map_err(SyncError::persistence)?;
        self.transport
            .send(
                Destination::Member(control_node),
                WireMessage::RequestToJoin {
                    community_id,
                    revealed_addresses,
                },
            )
            .await
            .map_err(SyncError::transport)?;
        info!(community_id = %community_id, "Requested to join community");
        Ok(request)
    }

    /// Accept a pending request
    ///
    /// The control node adds the member, syncs the decision to privileged
    /// members and issues a grant when the community is encrypted. A
    /// delegated member publishes an accept event instead.
    pub async fn accept_request_to_join(
        &self,
        community_id: CommunityId,
        member: MemberKey,
    ) -> SyncResult<CommunityChanges> {
        let changes = self
            .apply(community_id, |c| c.accept_request_to_join(&member))
            .await?;
        let request = self
            .resolve_request(community_id, member, RequestToJoinState::Accepted)
            .await?;
        self.notify(CommunityNotification::RequestToJoinResolved {
            community_id,
            member,
            accepted: true,
        });

        let handle = self.get(&community_id).await?;
        let grant = handle
            .read(|c| {
                (c.is_control_node() && c.is_encrypted()).then(|| c.build_grant(&member, ""))
            })
            .await;
        if handle.read(|c| c.is_control_node()).await {
            self.send_privileged_sync(community_id, PrivilegedUserSync::AcceptRequestToJoin(request))
                .await;
        }
        match grant {
            Some(Ok(data)) => {
                match self
                    .transport
                    .send(Destination::Member(member), WireMessage::Grant { community_id, data })
                    .await
                {
                    Ok(()) => self.metrics.inc_grants_issued(1),
                    Err(e) => warn!(community_id = %community_id, member = %member, error = %e, "Failed to deliver grant"),
                }
            }
            Some(Err(e)) => error!(community_id = %community_id, member = %member, error = %e, "Failed to build grant"),
            None => {}
        }

        info!(community_id = %community_id, member = %member, "Accepted request to join");
        Ok(changes)
    }

    pub async fn decline_request_to_join(&self, community_id: CommunityId, member: MemberKey) -> SyncResult<()> {
        let delegated = self
            .apply(community_id, |c| c.decline_request_to_join(&member))
            .await?;
        let request = self
            .resolve_request(community_id, member, RequestToJoinState::Declined)
            .await?;
        self.notify(CommunityNotification::RequestToJoinResolved {
            community_id,
            member,
            accepted: false,
        });
        if !delegated {
            self.send_privileged_sync(community_id, PrivilegedUserSync::RejectRequestToJoin(request))
                .await;
        }
        info!(community_id = %community_id, member = %member, delegated, "Declined request to join");
        Ok(())
    }

    async fn resolve_request(
        &self,
        community_id: CommunityId,
        member: MemberKey,
        state: RequestToJoinState,
    ) -> SyncResult<RequestToJoin> {
        let existing = self
            .store
            .get_requests_to_join(&community_id)
            .await
            .map_err(SyncError::persistence)?
            .into_iter()
            .find(|r| r.public_key == member);
        let mut request = existing.unwrap_or_else(|| RequestToJoin::new(community_id, member, self.now()));
        request.state = state;
        self.store
            .save_request_to_join(request.clone())
            .await
            .map_err(SyncError::persistence)?;
        Ok(request)
    }

    /// Record new shared addresses of a member and sync them to privileged members
    pub async fn edit_shared_addresses(
        &self,
        community_id: CommunityId,
        member: MemberKey,
        addresses: Vec<String>,
    ) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        if !handle.read(|c| c.is_control_node()).await {
            return Err(CommunityError::NotControlNode.into());
        }
        self.store
            .save_revealed_addresses(&community_id, &member, addresses.clone())
            .await
            .map_err(SyncError::persistence)?;
        let request_id = self
            .store
            .get_requests_to_join(&community_id)
            .await
            .map_err(SyncError::persistence)?
            .into_iter()
            .find(|r| r.public_key == member)
            .map(|r| r.id)
            .unwrap_or_default();
        self.send_privileged_sync(
            community_id,
            PrivilegedUserSync::EditSharedAddresses {
                request_id,
                member,
                addresses,
            },
        )
        .await;
        Ok(())
    }

    /// Ask the control node for the addresses a member revealed
    pub async fn request_shared_addresses(&self, community_id: CommunityId, member: MemberKey) -> SyncResult<()> {
        let control_node = self.get(&community_id).await?.read(|c| c.control_node()).await;
        self.transport
            .send(
                Destination::Member(control_node),
                WireMessage::SharedAddressesRequest { community_id, member },
            )
            .await
            .map_err(SyncError::transport)
    }

    async fn sync_pending_requests(&self, community_id: CommunityId) {
        let pending = match self.store.get_requests_to_join(&community_id).await {
            Ok(requests) => requests.into_iter().filter(RequestToJoin::is_pending).collect(),
            Err(e) => {
                warn!(community_id = %community_id, error = %e, "Failed to load pending requests");
                return;
            }
        };
        self.send_privileged_sync(community_id, PrivilegedUserSync::AllPendingRequestsSync(pending))
            .await;
    }

    /// Sign `message` with the community key and send it to every privileged member
    async fn send_privileged_sync(&self, community_id: CommunityId, message: PrivilegedUserSync) {
        let Some(handle) = self.lookup(&community_id).await else {
            return;
        };
        let me = self.member_key();
        let prepared = handle
            .read(|c| {
                c.control_node_key().cloned().map(|signer| {
                    let recipients: Vec<MemberKey> = c
                        .description()
                        .members
                        .iter()
                        .filter(|(k, m)| **k != me && m.is_privileged())
                        .map(|(k, _)| *k)
                        .collect();
                    (signer, recipients)
                })
            })
            .await;
        let Some((signer, recipients)) = prepared else {
            return;
        };
        if recipients.is_empty() {
            return;
        }
        let data = match message.sign(&signer) {
            Ok(data) => data,
            Err(e) => {
                error!(community_id = %community_id, error = %e, "Failed to sign privileged user sync");
                return;
            }
        };
        for recipient in recipients {
            if let Err(e) = self
                .transport
                .send(
                    Destination::Member(recipient),
                    WireMessage::PrivilegedUserSync {
                        community_id,
                        data: data.clone(),
                    },
                )
                .await
            {
                warn!(community_id = %community_id, recipient = %recipient, kind = message.kind(), error = %e, "Failed to send privileged user sync");
            }
        }
    }

    // Inbound

    /// Handle a message delivered by the transport from an authenticated `sender`
    pub async fn handle_message(&self, sender: MemberKey, message: WireMessage) -> SyncResult<()> {
        let community_id = message.community_id();
        debug!(community_id = %community_id, sender = %sender, kind = message.kind(), "Handling inbound message");

        match message {
            WireMessage::CommunityDescription { signer, data, .. } => {
                self.handle_description(community_id, signer, data).await
            }
            WireMessage::CommunityEvents(message) => self.handle_events(message).await,
            WireMessage::RequestToJoin {
                revealed_addresses, ..
            } => {
                self.handle_request_to_join(community_id, sender, revealed_addresses)
                    .await
            }
            WireMessage::PrivilegedUserSync { data, .. } => {
                self.handle_privileged_sync(community_id, &data).await
            }
            WireMessage::EncryptionKeysRequest { chat_ids, .. } => {
                self.handle_keys_request(community_id, sender, chat_ids).await
            }
            WireMessage::EncryptionKeys { scope, key, .. } => {
                self.handle_keys(community_id, sender, scope, key).await
            }
            WireMessage::SharedAddressesRequest { member, .. } => {
                self.handle_shared_addresses_request(community_id, sender, member)
                    .await
            }
            WireMessage::SharedAddressesResponse {
                member, addresses, ..
            } => {
                self.require_control_node_sender(community_id, sender).await?;
                self.store
                    .save_revealed_addresses(&community_id, &member, addresses.clone())
                    .await
                    .map_err(SyncError::persistence)?;
                self.notify(CommunityNotification::SharedAddresses {
                    community_id,
                    member,
                    addresses,
                });
                Ok(())
            }
            WireMessage::PublicShardInfo { data, .. } => {
                self.handle_shard_info(community_id, &data).await
            }
            WireMessage::ShardKey { data, .. } => self.handle_shard_key(community_id, &data).await,
            WireMessage::Grant { data, .. } => self.handle_grant(community_id, &data).await,
            WireMessage::UserKicked { .. } => {
                self.require_control_node_sender(community_id, sender).await?;
                let handle = self.get(&community_id).await?;
                handle.mutate(|c| c.leave()).await;
                warn!(community_id = %community_id, "Removed from community");
                self.notify(CommunityNotification::MemberKicked { community_id });
                Ok(())
            }
        }
    }

    async fn require_control_node_sender(&self, community_id: CommunityId, sender: MemberKey) -> SyncResult<()> {
        let control_node = self.get(&community_id).await?.read(|c| c.control_node()).await;
        if sender != control_node {
            warn!(community_id = %community_id, sender = %sender, "Ignoring message not sent by control node");
            return Err(SyncError::UnexpectedSender(sender));
        }
        Ok(())
    }

    /// Accept a signer other than the current control node only if it owns the community token
    async fn verify_new_control_node(&self, community_id: &CommunityId, signer: &MemberKey) -> SyncResult<()> {
        let owner = match &self.ownership {
            Some(oracle) => oracle
                .token_owner(community_id)
                .await
                .map_err(SyncError::collaborator)?,
            None => None,
        };
        if owner.as_ref() == Some(signer) {
            Ok(())
        } else {
            warn!(community_id = %community_id, signer = %signer, "Description signed by unknown key");
            Err(SyncError::UnexpectedSender(*signer))
        }
    }

    async fn handle_description(
        &self,
        community_id: CommunityId,
        signer: MemberKey,
        data: Vec<u8>,
    ) -> SyncResult<()> {
        let Some(handle) = self.lookup(&community_id).await else {
            return self.discover_community(community_id, signer, data).await;
        };

        let (control_node, is_control_node) = handle
            .read(|c| (c.control_node(), c.is_control_node()))
            .await;
        let new_control_node = if signer == control_node {
            if is_control_node {
                // Our own publication echoed back
                return Ok(());
            }
            None
        } else {
            self.verify_new_control_node(&community_id, &signer).await?;
            Some(signer)
        };

        let result = handle
            .mutate(|c| {
                let changes = c.update_from_signed(&data, new_control_node)?;
                if changes.should_member_join {
                    c.join();
                } else if changes.member_kicked {
                    c.leave();
                }
                Ok::<_, CommunityError>((changes, c.clock()))
            })
            .await;
        match result {
            Ok((changes, clock)) => {
                self.save_clock(community_id, clock).await?;
                debug!(community_id = %community_id, clock, "Merged community description");
                self.notify(CommunityNotification::DescriptionUpdated {
                    community_id,
                    clock,
                    changes: Box::new(changes),
                });
                Ok(())
            }
            Err(e) if e.is_stale() => {
                self.metrics.inc_rejected_stale(1);
                debug!(community_id = %community_id, error = %e, "Rejected stale description");
                Err(e.into())
            }
            Err(e) => {
                warn!(community_id = %community_id, error = %e, "Rejected community description");
                Err(e.into())
            }
        }
    }

    /// First description of a community not tracked yet
    async fn discover_community(
        &self,
        community_id: CommunityId,
        signer: MemberKey,
        data: Vec<u8>,
    ) -> SyncResult<()> {
        if signer != community_id.public_key() {
            self.verify_new_control_node(&community_id, &signer).await?;
        }
        let description = open_description(self.options.codec.as_ref(), &data, &signer)?;
        validate_description(&description)?;
        let clock = description.clock;
        let joined = description.has_member(&self.member_key());

        let community = Community::new(
            CommunityConfig {
                id: community_id,
                member_identity: self.identity.clone(),
                control_node: Some(signer),
                control_node_key: None,
                description,
                raw_description: data,
                local: LocalState {
                    joined,
                    ..Default::default()
                },
            },
            self.options.clone(),
        );
        self.register(community).await;
        self.save_clock(community_id, clock).await?;
        self.notify(CommunityNotification::DescriptionUpdated {
            community_id,
            clock,
            changes: Box::new(CommunityChanges::empty(community_id, self.member_key())),
        });
        Ok(())
    }

    async fn handle_events(&self, message: CommunityEventsMessage) -> SyncResult<()> {
        let community_id = message.community_id;
        let handle = self.get(&community_id).await?;
        let outcome = handle
            .mutate(|c| c.process_events_message(&message).map(|o| (o, c.clock())))
            .await;
        let (outcome, clock) = outcome?;

        if outcome.accepted > 0 {
            self.metrics.inc_events_accepted(outcome.accepted as u64);
        }
        if outcome.rejected > 0 {
            self.metrics.inc_events_rejected(outcome.rejected as u64);
        }

        if let Some(changes) = outcome.changes {
            self.notify(CommunityNotification::DescriptionUpdated {
                community_id,
                clock,
                changes: Box::new(changes),
            });
            self.publish_best_effort(community_id).await;
        }
        Ok(())
    }

    async fn handle_request_to_join(
        &self,
        community_id: CommunityId,
        sender: MemberKey,
        revealed_addresses: Vec<String>,
    ) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        let (is_control_node, auto_accept, check) = handle
            .read(|c| (c.is_control_node(), c.auto_accept(), c.validate_request_to_join(&sender)))
            .await;
        if !is_control_node {
            debug!(community_id = %community_id, "Ignoring request to join, not the control node");
            return Ok(());
        }
        check?;

        let mut request = RequestToJoin::new(community_id, sender, self.now());
        request.revealed_addresses = revealed_addresses.clone();
        self.store
            .save_request_to_join(request.clone())
            .await
            .map_err(SyncError::persistence)?;
        self.store
            .save_revealed_addresses(&community_id, &sender, revealed_addresses)
            .await
            .map_err(SyncError::persistence)?;

        if auto_accept {
            self.accept_request_to_join(community_id, sender).await?;
            return Ok(());
        }

        info!(community_id = %community_id, member = %sender, "Received request to join");
        self.notify(CommunityNotification::RequestToJoinReceived { community_id, request });
        self.sync_pending_requests(community_id).await;
        Ok(())
    }

    async fn handle_privileged_sync(&self, community_id: CommunityId, data: &[u8]) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        let (control_node, privileged) = handle
            .read(|c| (c.control_node(), c.is_privileged_member(&c.member_identity())))
            .await;
        if !privileged {
            debug!(community_id = %community_id, "Ignoring privileged user sync, not privileged");
            return Ok(());
        }
        let message = PrivilegedUserSync::open(data, &control_node)?;
        debug!(community_id = %community_id, kind = message.kind(), "Applying privileged user sync");

        match message {
            PrivilegedUserSync::AcceptRequestToJoin(request) | PrivilegedUserSync::RejectRequestToJoin(request) => {
                let member = request.public_key;
                let accepted = request.state == RequestToJoinState::Accepted;
                self.store
                    .save_request_to_join(request)
                    .await
                    .map_err(SyncError::persistence)?;
                self.notify(CommunityNotification::RequestToJoinResolved {
                    community_id,
                    member,
                    accepted,
                });
            }
            PrivilegedUserSync::AllPendingRequestsSync(requests) => {
                for request in requests {
                    if request.community_id != community_id {
                        continue;
                    }
                    self.store
                        .save_request_to_join(request.clone())
                        .await
                        .map_err(SyncError::persistence)?;
                    self.notify(CommunityNotification::RequestToJoinReceived { community_id, request });
                }
            }
            PrivilegedUserSync::EditSharedAddresses { member, addresses, .. } => {
                self.store
                    .save_revealed_addresses(&community_id, &member, addresses.clone())
                    .await
                    .map_err(SyncError::persistence)?;
                self.notify(CommunityNotification::SharedAddresses {
                    community_id,
                    member,
                    addresses,
                });
            }
        }
        Ok(())
    }

    /// Answer a key request for scopes the sender currently belongs to
    async fn handle_keys_request(
        &self,
        community_id: CommunityId,
        sender: MemberKey,
        chat_ids: Vec<ChatId>,
    ) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        let view = handle
            .read(|c| {
                c.control_node_key().cloned().map(|signer| {
                    let allowed: Vec<KeyScope> = if chat_ids.is_empty() {
                        c.is_encrypted()
                            .then_some(KeyScope::Community)
                            .into_iter()
                            .collect()
                    } else {
                        chat_ids
                            .iter()
                            .filter(|chat| c.channel_encrypted(chat) && c.is_member_in_chat(&sender, chat))
                            .map(|chat| KeyScope::Channel(chat.clone()))
                            .collect()
                    };
                    (signer, c.has_member(&sender) && !c.is_banned(&sender), allowed)
                })
            })
            .await;
        let Some((signer, is_member, scopes)) = view else {
            debug!(community_id = %community_id, "Ignoring key request, not the control node");
            return Ok(());
        };
        if !is_member {
            warn!(community_id = %community_id, sender = %sender, "Key request from non-member");
            return Err(SyncError::UnexpectedSender(sender));
        }

        for scope in scopes {
            let sent = self
                .keys
                .send_current_key(community_id, &scope, &signer, sender)
                .await
                .map_err(SyncError::encryption)?;
            if !sent {
                debug!(community_id = %community_id, scope = ?scope, "No key to send yet");
            }
        }
        Ok(())
    }

    async fn handle_keys(
        &self,
        community_id: CommunityId,
        sender: MemberKey,
        scope: KeyScope,
        key: SealedKey,
    ) -> SyncResult<()> {
        self.require_control_node_sender(community_id, sender).await?;
        self.keys
            .encryptor()
            .import_key(&scope.group_id(&community_id), &self.identity, &sender, &key)
            .await
            .map_err(SyncError::encryption)?;
        debug!(community_id = %community_id, scope = ?scope, key_id = key.key_id, "Imported encryption key");
        self.notify(CommunityNotification::EncryptionKeyReceived { community_id, scope });
        Ok(())
    }

    async fn handle_shared_addresses_request(
        &self,
        community_id: CommunityId,
        sender: MemberKey,
        member: MemberKey,
    ) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        let (is_control_node, allowed) = handle
            .read(|c| (c.is_control_node(), c.can_manage_users(&sender)))
            .await;
        if !is_control_node {
            return Ok(());
        }
        if !allowed {
            warn!(community_id = %community_id, sender = %sender, "Shared addresses requested by unprivileged member");
            return Err(SyncError::UnexpectedSender(sender));
        }
        let addresses = self
            .store
            .get_revealed_addresses(&community_id, &member)
            .await
            .map_err(SyncError::persistence)?;
        self.transport
            .send(
                Destination::Member(sender),
                WireMessage::SharedAddressesResponse {
                    community_id,
                    member,
                    addresses,
                },
            )
            .await
            .map_err(SyncError::transport)
    }

    async fn handle_shard_info(&self, community_id: CommunityId, data: &[u8]) -> SyncResult<()> {
        let info = PublicShardInfo::open(data, &community_id)?;
        {
            let mut shard_info = self.shard_info.lock().await;
            if shard_info
                .get(&community_id)
                .is_some_and(|known| known.clock >= info.clock)
            {
                return Ok(());
            }
            shard_info.insert(community_id, info.clone());
        }
        debug!(community_id = %community_id, shard = ?info.shard, "Updated public shard info");
        self.notify(CommunityNotification::ShardUpdated {
            community_id,
            shard: info.shard,
        });
        Ok(())
    }

    async fn handle_shard_key(&self, community_id: CommunityId, data: &[u8]) -> SyncResult<()> {
        let control_node = self.get(&community_id).await?.read(|c| c.control_node()).await;
        let payload = open_signed_payload(data, &control_node)?;
        let key: ShardKey = serde_json::from_slice(payload).map_err(CommunityError::from)?;
        if key.community_id != community_id {
            return Err(CommunityError::InvalidDescription("shard key for another community".to_string()).into());
        }
        let mut shard_keys = self.shard_keys.lock().await;
        if shard_keys
            .get(&community_id)
            .is_some_and(|known| known.clock >= key.clock)
        {
            return Ok(());
        }
        debug!(community_id = %community_id, shard = %key.shard, "Stored shard key");
        shard_keys.insert(community_id, key);
        Ok(())
    }

    async fn handle_grant(&self, community_id: CommunityId, data: &[u8]) -> SyncResult<()> {
        let handle = self.get(&community_id).await?;
        let verified = handle.read(|c| c.verify_grant_signature(data)).await;
        let grant = match verified.and_then(|g| g.member_key().map(|key| (g, key))) {
            Ok((grant, key)) if key == self.member_key() => grant,
            Ok(_) => {
                self.metrics.inc_grants_rejected(1);
                warn!(community_id = %community_id, "Grant issued for another member");
                return Err(CommunityError::InvalidGrant("grant for another member".to_string()).into());
            }
            Err(e) => {
                self.metrics.inc_grants_rejected(1);
                warn!(community_id = %community_id, error = %e, "Rejected grant");
                return Err(e.into());
            }
        };

        debug!(community_id = %community_id, chat_id = %grant.chat_id, clock = grant.clock, "Stored grant");
        self.grants
            .lock()
            .await
            .insert((community_id, grant.chat_id.clone()), data.to_vec());
        self.notify(CommunityNotification::GrantReceived {
            community_id,
            chat_id: grant.chat_id,
            clock: grant.clock,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_community::{
        AccessMode, CommunityChat, FixedTimeSource, MemberRole, PermissionType, TokenCriteria,
        TokenPermission,
    };
    use crate::core_sync::{DefaultKeyEncryptor, MemoryCommunityStore};
    use crate::test_utils::{
        test_identity, test_metadata, FixedActiveMembers, RecordingTransport, StaticOwnershipOracle,
        FIXTURE_START_MILLIS,
    };

    struct Node {
        identity: Identity,
        /// Keys whose private deliveries reach this node
        addresses: Vec<MemberKey>,
        transport: Arc<RecordingTransport>,
        manager: SyncManager,
    }

    fn node(seed: u8, time: &Arc<FixedTimeSource>) -> Node {
        let identity = test_identity(seed);
        let transport = Arc::new(RecordingTransport::new());
        let manager = SyncManager::new(
            identity.clone(),
            &Config::default(),
            SyncCollaborators {
                transport: transport.clone(),
                store: Arc::new(MemoryCommunityStore::new()),
                encryptor: Arc::new(DefaultKeyEncryptor::new()),
            },
        )
        .with_time_source(time.clone());
        Node {
            addresses: vec![identity.public_key()],
            identity,
            transport,
            manager,
        }
    }

    /// Node that created the test community and holds its key
    async fn owner_node(time: &Arc<FixedTimeSource>) -> Node {
        let mut owner = node(2, time);
        owner
            .manager
            .create_community(community_key(), test_metadata("sync"))
            .await
            .unwrap();
        owner.addresses.push(community_key().public_key());
        owner
    }

    fn clock() -> Arc<FixedTimeSource> {
        Arc::new(FixedTimeSource::new(FIXTURE_START_MILLIS))
    }

    fn community_key() -> Identity {
        test_identity(1)
    }

    fn community_id() -> CommunityId {
        CommunityId::from(community_key().public_key())
    }

    fn encrypted_permission() -> TokenPermission {
        TokenPermission::new("holders", PermissionType::BecomeMember).with_criteria(TokenCriteria {
            symbol: "SNT".to_string(),
            amount: "10".to_string(),
            ..Default::default()
        })
    }

    /// Deliver everything `from` sent to public destinations, plus private
    /// deliveries addressed to `to`, as if sent by `sender`
    async fn relay(from: &Node, to: &Node, sender: MemberKey) -> Vec<SyncResult<()>> {
        let mut results = Vec::new();
        for (destination, message) in from.transport.sent().await {
            let addressed = match &destination {
                Destination::Member(key) => to.addresses.contains(key),
                _ => true,
            };
            if addressed {
                results.push(to.manager.handle_message(sender, message).await);
            }
        }
        from.transport.clear().await;
        results
    }

    async fn owner_with_member(time: &Arc<FixedTimeSource>, member_seed: u8, role: MemberRole) -> (Node, Node) {
        let owner = owner_node(time).await;
        owner.transport.clear().await;
        let member = node(member_seed, time);
        owner
            .manager
            .apply(community_id(), |c| c.add_member(member.identity.public_key(), role))
            .await
            .unwrap();
        relay(&owner, &member, community_key().public_key()).await;
        (owner, member)
    }

    #[tokio::test]
    async fn test_create_publishes_description_and_shard_info() {
        let time = clock();
        let owner = owner_node(&time).await;

        assert_eq!(owner.transport.sent_of_kind("community_description").await.len(), 1);
        assert_eq!(owner.transport.sent_of_kind("public_shard_info").await.len(), 1);
        assert_eq!(owner.manager.metrics().snapshot().descriptions_published, 1);

        // Nothing changed since the last publication
        assert!(!owner.manager.publish_community(community_id()).await.unwrap());

        let settings = owner.manager.store().get_settings(&community_id()).await.unwrap().unwrap();
        let clock = owner.manager.get(&community_id()).await.unwrap().read(|c| c.clock()).await;
        assert_eq!(settings.clock, clock);
    }

    #[tokio::test]
    async fn test_replica_follows_control_node() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        let handle = member.manager.get(&community_id()).await.unwrap();
        assert!(handle.read(|c| c.has_member(&member.identity.public_key())).await);

        let mut rx = member.manager.subscribe();
        owner
            .manager
            .apply(community_id(), |c| c.create_chat("general".to_string(), CommunityChat::new("general")))
            .await
            .unwrap();
        let results = relay(&owner, &member, community_key().public_key()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert!(handle.read(|c| c.description().chats.contains_key("general")).await);
        match rx.recv().await.unwrap() {
            CommunityNotification::DescriptionUpdated { changes, .. } => {
                assert!(changes.chats_added.contains_key("general"));
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_description_counted_and_rejected() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        let old = owner
            .manager
            .get(&community_id())
            .await
            .unwrap()
            .read(|c| c.raw_description().to_vec())
            .await;

        owner
            .manager
            .apply(community_id(), |c| c.create_chat("general".to_string(), CommunityChat::new("general")))
            .await
            .unwrap();
        relay(&owner, &member, community_key().public_key()).await;

        let err = member
            .manager
            .handle_message(
                community_key().public_key(),
                WireMessage::CommunityDescription {
                    community_id: community_id(),
                    signer: community_key().public_key(),
                    data: old,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(member.manager.metrics().snapshot().descriptions_rejected_stale, 1);
        let handle = member.manager.get(&community_id()).await.unwrap();
        assert!(handle.read(|c| c.description().chats.contains_key("general")).await);
    }

    #[tokio::test]
    async fn test_unknown_signer_needs_token_ownership() {
        let time = clock();
        let (_owner, member) = owner_with_member(&time, 5, MemberRole::None).await;

        let new_owner = test_identity(9);
        let snapshot = member.manager.get(&community_id()).await.unwrap().snapshot().await;
        let mut description = snapshot.description.clone();
        description.clock += 1;
        let data = crate::core_community::sign_description(
            &crate::core_community::JsonCodec,
            &new_owner,
            &description,
        )
        .unwrap();
        let message = WireMessage::CommunityDescription {
            community_id: community_id(),
            signer: new_owner.public_key(),
            data,
        };

        let err = member
            .manager
            .handle_message(new_owner.public_key(), message.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedSender(_)));

        let oracle = Arc::new(StaticOwnershipOracle::new());
        oracle.set_owner(community_id(), new_owner.public_key()).await;
        let member = Node {
            manager: member.manager.with_ownership_oracle(oracle),
            ..member
        };
        member
            .manager
            .handle_message(new_owner.public_key(), message)
            .await
            .unwrap();
        let control_node = member.manager.get(&community_id()).await.unwrap().read(|c| c.control_node()).await;
        assert_eq!(control_node, new_owner.public_key());
    }

    #[tokio::test]
    async fn test_delegated_ban_replayed_by_control_node() {
        let time = clock();
        let (owner, admin) = owner_with_member(&time, 5, MemberRole::Admin).await;
        let target = test_identity(6).public_key();
        owner
            .manager
            .apply(community_id(), |c| c.add_member(target, MemberRole::None))
            .await
            .unwrap();
        relay(&owner, &admin, community_key().public_key()).await;

        admin
            .manager
            .apply(community_id(), |c| c.ban_user_from_community(&target, false))
            .await
            .unwrap();
        assert_eq!(admin.transport.sent_of_kind("community_events").await.len(), 1);

        let results = relay(&admin, &owner, admin.identity.public_key()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let handle = owner.manager.get(&community_id()).await.unwrap();
        assert!(handle.read(|c| c.is_banned(&target) && !c.has_member(&target)).await);
        assert_eq!(owner.manager.metrics().snapshot().events_accepted, 1);
        // The control node republished the result
        assert_eq!(owner.transport.sent_of_kind("community_description").await.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_request_to_join_synced_to_admins() {
        let time = clock();
        let (owner, admin) = owner_with_member(&time, 5, MemberRole::Admin).await;
        let mut metadata = test_metadata("sync");
        metadata.permissions.access = AccessMode::ManualAccept;
        owner.manager.apply(community_id(), |c| c.edit(metadata)).await.unwrap();
        relay(&owner, &admin, community_key().public_key()).await;

        let applicant = node(7, &time);
        let raw = owner.manager.get(&community_id()).await.unwrap().read(|c| c.raw_description().to_vec()).await;
        applicant
            .manager
            .handle_message(
                community_key().public_key(),
                WireMessage::CommunityDescription {
                    community_id: community_id(),
                    signer: community_key().public_key(),
                    data: raw,
                },
            )
            .await
            .unwrap();
        applicant
            .manager
            .request_to_join(community_id(), vec!["0xabc".to_string()])
            .await
            .unwrap();
        let applicant_key = applicant.identity.public_key();
        for r in relay(&applicant, &owner, applicant_key).await {
            r.unwrap();
        }

        assert!(owner
            .manager
            .store()
            .has_pending_request(&community_id(), &applicant_key)
            .await
            .unwrap());
        assert_eq!(owner.transport.sent_of_kind("privileged_user_sync").await.len(), 1);

        for r in relay(&owner, &admin, community_key().public_key()).await {
            r.unwrap();
        }
        assert!(admin
            .manager
            .store()
            .has_pending_request(&community_id(), &applicant_key)
            .await
            .unwrap());

        owner
            .manager
            .accept_request_to_join(community_id(), applicant_key)
            .await
            .unwrap();
        let handle = owner.manager.get(&community_id()).await.unwrap();
        assert!(handle.read(|c| c.has_member(&applicant_key)).await);
        assert!(!owner
            .manager
            .store()
            .has_pending_request(&community_id(), &applicant_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auto_accept_adds_member() {
        let time = clock();
        let owner = owner_node(&time).await;
        let applicant = test_identity(7).public_key();

        owner
            .manager
            .handle_message(
                applicant,
                WireMessage::RequestToJoin {
                    community_id: community_id(),
                    revealed_addresses: Vec::new(),
                },
            )
            .await
            .unwrap();
        let handle = owner.manager.get(&community_id()).await.unwrap();
        assert!(handle.read(|c| c.has_member(&applicant)).await);

        // A second request from a member is refused
        let err = owner
            .manager
            .handle_message(
                applicant,
                WireMessage::RequestToJoin {
                    community_id: community_id(),
                    revealed_addresses: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Community(CommunityError::AlreadyMember)));
    }

    #[tokio::test]
    async fn test_encryption_keys_follow_membership() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        let leaver = test_identity(6).public_key();
        owner
            .manager
            .apply(community_id(), |c| c.add_member(leaver, MemberRole::None))
            .await
            .unwrap();
        owner.transport.clear().await;

        owner
            .manager
            .apply(community_id(), |c| c.upsert_token_permission(encrypted_permission()))
            .await
            .unwrap();
        let recipients = owner.transport.private_recipients().await;
        assert!(recipients.contains(&member.identity.public_key()));
        assert!(recipients.contains(&leaver));

        for r in relay(&owner, &member, community_key().public_key()).await {
            r.unwrap();
        }
        assert!(!member.manager.has_missing_encryption_key(community_id()).await.unwrap());

        owner
            .manager
            .apply(community_id(), |c| c.remove_user_from_org(&leaver))
            .await
            .unwrap();
        let keys_to: Vec<_> = owner
            .transport
            .sent_of_kind("encryption_keys")
            .await
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        assert!(keys_to.contains(&Destination::Member(member.identity.public_key())));
        assert!(!keys_to.contains(&Destination::Member(leaver)));
        let kicked = owner.transport.sent_of_kind("user_kicked").await;
        assert_eq!(kicked.len(), 1);
        assert_eq!(kicked[0].0, Destination::Member(leaver));
        assert!(owner.manager.metrics().snapshot().rekeys >= 2);
    }

    #[tokio::test]
    async fn test_key_request_only_for_members() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        owner
            .manager
            .apply(community_id(), |c| c.upsert_token_permission(encrypted_permission()))
            .await
            .unwrap();
        owner.transport.clear().await;

        owner
            .manager
            .handle_message(
                member.identity.public_key(),
                WireMessage::EncryptionKeysRequest {
                    community_id: community_id(),
                    chat_ids: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            owner.transport.private_recipients().await,
            vec![member.identity.public_key()]
        );

        let stranger = test_identity(8).public_key();
        let err = owner
            .manager
            .handle_message(
                stranger,
                WireMessage::EncryptionKeysRequest {
                    community_id: community_id(),
                    chat_ids: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedSender(_)));
    }

    #[tokio::test]
    async fn test_grants_refreshed_for_encrypted_communities() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        assert_eq!(owner.manager.refresh_grants().await, 0);

        owner
            .manager
            .apply(community_id(), |c| c.upsert_token_permission(encrypted_permission()))
            .await
            .unwrap();
        for r in relay(&owner, &member, community_key().public_key()).await {
            r.unwrap();
        }

        // Owner grant kept locally, member grant sent
        assert_eq!(owner.manager.refresh_grants().await, 2);
        assert!(owner.manager.grant(&community_id(), "").await.is_some());
        for r in relay(&owner, &member, community_key().public_key()).await {
            r.unwrap();
        }
        assert!(member.manager.grant(&community_id(), "").await.is_some());
    }

    #[tokio::test]
    async fn test_publication_failure_retried_next_round() {
        let time = clock();
        let owner = node(2, &time);
        owner.transport.fail_all(true).await;
        owner
            .manager
            .create_community(community_key(), test_metadata("sync"))
            .await
            .unwrap();
        assert!(owner.transport.sent().await.is_empty());

        owner.transport.clear_failures().await;
        assert_eq!(owner.manager.publish_pending().await, 1);
        assert_eq!(owner.transport.sent_of_kind("community_description").await.len(), 1);
    }

    #[tokio::test]
    async fn test_active_members_one_community_per_round() {
        let time = clock();
        let owner = node(2, &time);
        let manager = owner
            .manager
            .with_active_members_source(Arc::new(FixedActiveMembers(12)));
        manager
            .create_community(test_identity(1), test_metadata("first"))
            .await
            .unwrap();
        manager
            .create_community(test_identity(3), test_metadata("second"))
            .await
            .unwrap();

        let first = manager.update_active_members().await.unwrap();
        let second = manager.update_active_members().await.unwrap();
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
        assert_eq!(manager.update_active_members().await.unwrap(), None);

        let handle = manager.get(&first.unwrap()).await.unwrap();
        assert_eq!(handle.read(|c| c.description().active_members_count).await, 12);
    }

    #[tokio::test]
    async fn test_shard_key_delivered_to_members() {
        let time = clock();
        let (owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        owner
            .manager
            .set_shard(community_id(), Some(Shard::new(16, 128)), Some(vec![7u8; 32]))
            .await
            .unwrap();
        for r in relay(&owner, &member, community_key().public_key()).await {
            r.unwrap();
        }

        let key = member.manager.shard_key(&community_id()).await.unwrap();
        assert_eq!(key.shard, Shard::new(16, 128));
        let info = member.manager.public_shard_info(&community_id()).await.unwrap();
        assert_eq!(info.shard, Some(Shard::new(16, 128)));
    }

    #[tokio::test]
    async fn test_kick_notification_only_from_control_node() {
        let time = clock();
        let (_owner, member) = owner_with_member(&time, 5, MemberRole::None).await;
        let mut rx = member.manager.subscribe();
        let err = member
            .manager
            .handle_message(test_identity(9).public_key(), WireMessage::UserKicked { community_id: community_id() })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedSender(_)));

        member
            .manager
            .handle_message(community_key().public_key(), WireMessage::UserKicked { community_id: community_id() })
            .await
            .unwrap();
        let notification = rx.recv().await.unwrap();
        assert!(matches!(notification, CommunityNotification::MemberKicked { .. }));
        let handle = member.manager.get(&community_id()).await.unwrap();
        assert!(!handle.read(|c| c.local_state().joined).await);
    }
}
