//! Encryption key delivery
//!
//! Turns the key actions evaluated by `core_community::encryption_keys`
//! into per-recipient deliveries. Every recipient gets its own sealed copy
//! of the key; a failed delivery is queued and retried on a later tick
//! without holding up the other recipients. Removed members never receive
//! a key generated for a rekey.

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::core_community::crypto::shared_secret;
use crate::core_community::{
    rekey_due, CommunityId, EncryptionKeyActionType, EncryptionKeyActions, Identity, KeyScope,
    MemberKey,
};

use super::transport::{Destination, Transport, WireMessage};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const WRAP_INFO: &[u8] = b"communal key wrap";

/// A symmetric key sealed for one recipient
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub key_id: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedKey")
            .field("key_id", &self.key_id)
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Generates, seals and imports group keys
///
/// Group ids come from [`KeyScope::group_id`].
#[async_trait]
pub trait KeyEncryptor: Send + Sync {
    async fn current_key_id(&self, group_id: &[u8]) -> anyhow::Result<Option<u32>>;

    /// Generate a new key for the group and make it current
    async fn generate_key(&self, group_id: &[u8]) -> anyhow::Result<u32>;

    /// Seal the current key of the group from `sender` to `recipient`
    async fn encrypt_key_for(
        &self,
        group_id: &[u8],
        sender: &Identity,
        recipient: &MemberKey,
    ) -> anyhow::Result<SealedKey>;

    /// Open a key sealed by `sender` for `recipient` and store it
    async fn import_key(
        &self,
        group_id: &[u8],
        recipient: &Identity,
        sender: &MemberKey,
        sealed: &SealedKey,
    ) -> anyhow::Result<()>;
}

#[derive(Default)]
struct GroupKeys {
    current: Option<u32>,
    keys: HashMap<u32, Zeroizing<[u8; KEY_SIZE]>>,
}

/// In-process key store sealing keys with X25519 + HKDF-SHA256 + ChaCha20-Poly1305
///
/// The wrapping key is derived from the Diffie-Hellman secret of the two
/// identities, salted with the group id. The key id and group id are
/// bound as associated data.
#[derive(Default)]
pub struct DefaultKeyEncryptor {
    groups: Mutex<HashMap<Vec<u8>, GroupKeys>>,
}

impl DefaultKeyEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_key(&self, group_id: &[u8], key_id: u32) -> bool {
        self.groups
            .lock()
            .await
            .get(group_id)
            .is_some_and(|g| g.keys.contains_key(&key_id))
    }

    fn wrap_cipher(
        group_id: &[u8],
        local: &Identity,
        peer: &MemberKey,
    ) -> anyhow::Result<ChaCha20Poly1305> {
        let secret = Zeroizing::new(shared_secret(local, peer)?);
        let hk = Hkdf::<Sha256>::new(Some(group_id), &secret[..]);
        let mut wrap_key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(WRAP_INFO, &mut wrap_key[..])
            .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&wrap_key[..])))
    }

    fn aad(group_id: &[u8], key_id: u32) -> Vec<u8> {
        let mut aad = key_id.to_be_bytes().to_vec();
        aad.extend_from_slice(group_id);
        aad
    }
}

#[async_trait]
impl KeyEncryptor for DefaultKeyEncryptor {
    async fn current_key_id(&self, group_id: &[u8]) -> anyhow::Result<Option<u32>> {
        Ok(self.groups.lock().await.get(group_id).and_then(|g| g.current))
    }

    async fn generate_key(&self, group_id: &[u8]) -> anyhow::Result<u32> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rng().fill_bytes(&mut key[..]);

        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_id.to_vec()).or_default();
        let key_id = group.keys.keys().max().map_or(1, |id| id + 1);
        group.keys.insert(key_id, key);
        group.current = Some(key_id);
        Ok(key_id)
    }

    async fn encrypt_key_for(
        &self,
        group_id: &[u8],
        sender: &Identity,
        recipient: &MemberKey,
    ) -> anyhow::Result<SealedKey> {
        let (key_id, key) = {
            let groups = self.groups.lock().await;
            let group = groups
                .get(group_id)
                .ok_or_else(|| anyhow::anyhow!("no key for group"))?;
            let key_id = group
                .current
                .ok_or_else(|| anyhow::anyhow!("no current key for group"))?;
            let key = group
                .keys
                .get(&key_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("current key {} missing", key_id))?;
            (key_id, key)
        };

        let cipher = Self::wrap_cipher(group_id, sender, recipient)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let aad = Self::aad(group_id, key_id);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &key[..],
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("sealing key failed: {}", e))?;

        Ok(SealedKey {
            key_id,
            nonce,
            ciphertext,
        })
    }

    async fn import_key(
        &self,
        group_id: &[u8],
        recipient: &Identity,
        sender: &MemberKey,
        sealed: &SealedKey,
    ) -> anyhow::Result<()> {
        let cipher = Self::wrap_cipher(group_id, recipient, sender)?;
        let aad = Self::aad(group_id, sealed.key_id);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&sealed.nonce),
                    Payload {
                        msg: &sealed.ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|e| anyhow::anyhow!("opening key failed: {}", e))?,
        );
        if plaintext.len() != KEY_SIZE {
            anyhow::bail!("unexpected key length {}", plaintext.len());
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&plaintext);

        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_id.to_vec()).or_default();
        group.keys.insert(sealed.key_id, key);
        if group.current.map_or(true, |current| sealed.key_id > current) {
            group.current = Some(sealed.key_id);
        }
        Ok(())
    }
}

/// Outcome of one distribution or retry round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Scopes that received a freshly generated key
    pub generated: Vec<KeyScope>,
    /// Scopes whose key was dropped
    pub removed: Vec<KeyScope>,
    pub delivered: usize,
    pub failed: usize,
    /// Failed deliveries that will not be retried
    pub abandoned: usize,
}

impl DistributionReport {
    fn merge(&mut self, other: DistributionReport) {
        self.generated.extend(other.generated);
        self.removed.extend(other.removed);
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
    }
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    community_id: CommunityId,
    scope: KeyScope,
    recipient: MemberKey,
    attempts: u32,
}

/// Recipient-scoped key delivery with bounded retries
pub struct CommunityKeyDistributor {
    encryptor: Arc<dyn KeyEncryptor>,
    transport: Arc<dyn Transport>,
    retry_attempts: u32,
    pending: Mutex<Vec<PendingDelivery>>,
    distributed_at: Mutex<HashMap<(CommunityId, KeyScope), u64>>,
}

impl CommunityKeyDistributor {
    pub fn new(encryptor: Arc<dyn KeyEncryptor>, transport: Arc<dyn Transport>, retry_attempts: u32) -> Self {
        Self {
            encryptor,
            transport,
            retry_attempts,
            pending: Mutex::new(Vec::new()),
            distributed_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn encryptor(&self) -> &Arc<dyn KeyEncryptor> {
        &self.encryptor
    }

    /// Carry out `actions` for `community_id`, sealing keys with `signer`
    pub async fn distribute(
        &self,
        community_id: CommunityId,
        signer: &Identity,
        actions: &EncryptionKeyActions,
        now: u64,
    ) -> DistributionReport {
        let mut report = DistributionReport::default();

        for (scope, action) in actions.scoped() {
            let group_id = scope.group_id(&community_id);
            let recipients: Vec<MemberKey> = match action.action_type {
                EncryptionKeyActionType::None => continue,
                EncryptionKeyActionType::Remove => {
                    self.distributed_at.lock().await.remove(&(community_id, scope.clone()));
                    self.forget_pending(&community_id, &scope).await;
                    info!(community_id = %community_id, scope = ?scope, "Encryption key removed");
                    report.removed.push(scope);
                    continue;
                }
                EncryptionKeyActionType::Add | EncryptionKeyActionType::Rekey => {
                    match self.encryptor.generate_key(&group_id).await {
                        Ok(key_id) => {
                            info!(
                                community_id = %community_id,
                                scope = ?scope,
                                key_id,
                                action = ?action.action_type,
                                "Generated encryption key"
                            );
                        }
                        Err(e) => {
                            error!(community_id = %community_id, scope = ?scope, error = %e, "Failed to generate encryption key");
                            continue;
                        }
                    }
                    self.distributed_at
                        .lock()
                        .await
                        .insert((community_id, scope.clone()), now);
                    // Queued deliveries of the previous key are superseded
                    self.forget_pending(&community_id, &scope).await;
                    report.generated.push(scope.clone());
                    action
                        .members
                        .keys()
                        .filter(|k| !action.removed_members.contains_key(*k))
                        .copied()
                        .collect()
                }
                EncryptionKeyActionType::SendToMembers => {
                    match self.encryptor.current_key_id(&group_id).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            // No key yet, e.g. after a restart
                            if let Err(e) = self.encryptor.generate_key(&group_id).await {
                                error!(community_id = %community_id, scope = ?scope, error = %e, "Failed to generate encryption key");
                                continue;
                            }
                            self.distributed_at
                                .lock()
                                .await
                                .insert((community_id, scope.clone()), now);
                            report.generated.push(scope.clone());
                        }
                        Err(e) => {
                            error!(community_id = %community_id, scope = ?scope, error = %e, "Failed to read current key");
                            continue;
                        }
                    }
                    action.members.keys().copied().collect()
                }
            };

            for recipient in recipients {
                report.merge(self.deliver(community_id, &scope, signer, recipient, 0).await);
            }
        }

        report
    }

    /// Send the current key of `scope` to a single recipient
    ///
    /// Returns false when the scope has no key yet.
    pub async fn send_current_key(
        &self,
        community_id: CommunityId,
        scope: &KeyScope,
        signer: &Identity,
        recipient: MemberKey,
    ) -> anyhow::Result<bool> {
        if self
            .encryptor
            .current_key_id(&scope.group_id(&community_id))
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let report = self.deliver(community_id, scope, signer, recipient, 0).await;
        Ok(report.delivered > 0 || report.failed > 0)
    }

    /// Retry queued deliveries
    ///
    /// `signer_for` returns the signing key of a community, `None` when the
    /// local node no longer controls it. `still_eligible` must confirm the
    /// recipient still belongs to the scope; ineligible deliveries are dropped.
    pub async fn retry_pending<S, E>(&self, signer_for: S, still_eligible: E) -> DistributionReport
    where
        S: Fn(&CommunityId) -> Option<Identity>,
        E: Fn(&CommunityId, &KeyScope, &MemberKey) -> bool,
    {
        let queued = std::mem::take(&mut *self.pending.lock().await);
        let mut report = DistributionReport::default();

        for delivery in queued {
            let Some(signer) = signer_for(&delivery.community_id) else {
                debug!(community_id = %delivery.community_id, "Dropping key delivery for community no longer controlled");
                continue;
            };
            if !still_eligible(&delivery.community_id, &delivery.scope, &delivery.recipient) {
                debug!(
                    community_id = %delivery.community_id,
                    recipient = %delivery.recipient,
                    "Dropping key delivery for former member"
                );
                continue;
            }
            report.merge(
                self.deliver(
                    delivery.community_id,
                    &delivery.scope,
                    &signer,
                    delivery.recipient,
                    delivery.attempts,
                )
                .await,
            );
        }

        report
    }

    pub async fn pending_deliveries(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Scopes of `community_id` whose key is older than `interval`
    pub async fn overdue_scopes(
        &self,
        community_id: CommunityId,
        scopes: impl IntoIterator<Item = KeyScope>,
        now: u64,
        interval: Duration,
    ) -> BTreeSet<KeyScope> {
        let distributed_at = self.distributed_at.lock().await;
        scopes
            .into_iter()
            .filter(|scope| {
                rekey_due(
                    distributed_at.get(&(community_id, scope.clone())).copied(),
                    now,
                    interval,
                )
            })
            .collect()
    }

    /// Forget everything known about `community_id`
    pub async fn forget_community(&self, community_id: &CommunityId) {
        self.distributed_at
            .lock()
            .await
            .retain(|(id, _), _| id != community_id);
        self.pending.lock().await.retain(|d| &d.community_id != community_id);
    }

    async fn forget_pending(&self, community_id: &CommunityId, scope: &KeyScope) {
        self.pending
            .lock()
            .await
            .retain(|d| !(&d.community_id == community_id && &d.scope == scope));
    }

    async fn deliver(
        &self,
        community_id: CommunityId,
        scope: &KeyScope,
        signer: &Identity,
        recipient: MemberKey,
        attempts: u32,
    ) -> DistributionReport {
        let mut report = DistributionReport::default();
        if recipient == signer.public_key() {
            return report;
        }

        let result: anyhow::Result<()> = async {
            let key = self
                .encryptor
                .encrypt_key_for(&scope.group_id(&community_id), signer, &recipient)
                .await?;
            self.transport
                .send(
                    Destination::Member(recipient),
                    WireMessage::EncryptionKeys {
                        community_id,
                        scope: scope.clone(),
                        key,
                    },
                )
                .await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(community_id = %community_id, scope = ?scope, recipient = %recipient, "Delivered encryption key");
                report.delivered += 1;
            }
            Err(e) => {
                report.failed += 1;
                let attempts = attempts + 1;
                if attempts < self.retry_attempts {
                    warn!(
                        community_id = %community_id,
                        recipient = %recipient,
                        attempts,
                        error = %e,
                        "Key delivery failed, will retry"
                    );
                    self.pending.lock().await.push(PendingDelivery {
                        community_id,
                        scope: scope.clone(),
                        recipient,
                        attempts,
                    });
                } else {
                    error!(
                        community_id = %community_id,
                        recipient = %recipient,
                        attempts,
                        error = %e,
                        "Giving up on key delivery"
                    );
                    report.abandoned += 1;
                }
            }
        }
        report
    }
}
