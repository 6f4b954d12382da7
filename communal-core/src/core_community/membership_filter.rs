//! Probabilistic channel membership
//!
//! The control node publishes, for every encrypted channel, a bloom filter
//! over values only a member and the control node can compute (derived
//! from their shared secret, the channel id and the description clock).
//! Members test their own value without learning the member list. The
//! filter is signed by the control node and bound to the clock, so a stale
//! or forged filter is rejected.

use serde::{Deserialize, Serialize};

use super::crypto::shared_secret;
use super::errors::{CommunityError, CommunityResult};
use super::types::{Clock, Identity, MemberKey};

const MIN_BITS: u64 = 64;
const SIGNING_CONTEXT: &[u8] = b"communal membership filter v1";

/// A signed bloom filter over a channel's members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipFilter {
    pub bits: Vec<u8>,
    pub num_bits: u64,
    pub hashes: u32,
    pub signature: Vec<u8>,
}

impl MembershipFilter {
    /// Build a filter over `members` for `chat_id` at `clock`, signed by `control_node`
    pub fn build<'a>(
        control_node: &Identity,
        members: impl ExactSizeIterator<Item = &'a MemberKey>,
        chat_id: &str,
        clock: Clock,
        false_positive_rate: f64,
    ) -> CommunityResult<Self> {
        let (num_bits, hashes) = optimal_parameters(members.len(), false_positive_rate)?;
        let mut filter = Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            hashes,
            signature: Vec::new(),
        };
        for member in members {
            let value = filter_value(&shared_secret(control_node, member)?, chat_id, clock);
            filter.insert(&value);
        }
        filter.signature = control_node
            .sign(&filter.signing_material(chat_id, clock))
            .to_vec();
        Ok(filter)
    }

    /// Test whether `identity` is likely a member
    ///
    /// Fails if the signature does not match the control node and clock.
    pub fn verify_membership(
        &self,
        identity: &Identity,
        control_node: &MemberKey,
        chat_id: &str,
        clock: Clock,
    ) -> CommunityResult<bool> {
        if self.num_bits == 0 || self.bits.len() as u64 * 8 < self.num_bits {
            return Err(CommunityError::MembershipFilter("malformed filter".to_string()));
        }
        control_node
            .verify(&self.signing_material(chat_id, clock), &self.signature)
            .map_err(|e| CommunityError::MembershipFilter(e.to_string()))?;

        let value = filter_value(&shared_secret(identity, control_node)?, chat_id, clock);
        Ok(self.contains(&value))
    }

    fn insert(&mut self, value: &[u8; 32]) {
        for index in self.indexes(value) {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn contains(&self, value: &[u8; 32]) -> bool {
        self.indexes(value)
            .all(|index| self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0)
    }

    // Kirsch-Mitzenmacher double hashing
    fn indexes(&self, value: &[u8; 32]) -> impl Iterator<Item = u64> {
        let digest = blake3::hash(value);
        let bytes = digest.as_bytes();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&bytes[..8]);
        h2.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2) | 1;
        let num_bits = self.num_bits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    fn signing_material(&self, chat_id: &str, clock: Clock) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SIGNING_CONTEXT);
        hasher.update(&(chat_id.len() as u64).to_le_bytes());
        hasher.update(chat_id.as_bytes());
        hasher.update(&clock.to_le_bytes());
        hasher.update(&self.num_bits.to_le_bytes());
        hasher.update(&self.hashes.to_le_bytes());
        hasher.update(&self.bits);
        hasher.finalize().as_bytes().to_vec()
    }
}

fn filter_value(secret: &[u8; 32], chat_id: &str, clock: Clock) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(secret);
    hasher.update(chat_id.as_bytes());
    hasher.update(&clock.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn optimal_parameters(items: usize, false_positive_rate: f64) -> CommunityResult<(u64, u32)> {
    if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
        return Err(CommunityError::MembershipFilter(format!(
            "false positive rate out of range: {}",
            false_positive_rate
        )));
    }
    let n = items.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    let bits = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil() as u64;
    let bits = bits.max(MIN_BITS);
    let hashes = ((bits as f64 / n) * ln2).round().max(1.0) as u32;
    Ok((bits, hashes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_always_match() {
        let control = Identity::generate();
        let members: Vec<Identity> = (0..50).map(|_| Identity::generate()).collect();
        let keys: Vec<MemberKey> = members.iter().map(Identity::public_key).collect();

        let filter = MembershipFilter::build(&control, keys.iter(), "general", 7, 0.001).unwrap();
        for member in &members {
            assert!(filter
                .verify_membership(member, &control.public_key(), "general", 7)
                .unwrap());
        }
    }

    #[test]
    fn test_non_members_rarely_match() {
        let control = Identity::generate();
        let keys: Vec<MemberKey> = (0..20).map(|_| Identity::generate().public_key()).collect();
        let filter = MembershipFilter::build(&control, keys.iter(), "general", 7, 0.001).unwrap();

        let false_positives = (0..200)
            .filter(|_| {
                filter
                    .verify_membership(&Identity::generate(), &control.public_key(), "general", 7)
                    .unwrap()
            })
            .count();
        assert!(false_positives < 5, "too many false positives: {}", false_positives);
    }

    #[test]
    fn test_filter_is_bound_to_clock_and_signer() {
        let control = Identity::generate();
        let member = Identity::generate();
        let keys = vec![member.public_key()];
        let filter = MembershipFilter::build(&control, keys.iter(), "general", 7, 0.001).unwrap();

        assert!(filter
            .verify_membership(&member, &control.public_key(), "general", 8)
            .is_err());
        assert!(filter
            .verify_membership(&member, &Identity::generate().public_key(), "general", 7)
            .is_err());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let control = Identity::generate();
        let keys: Vec<MemberKey> = Vec::new();
        assert!(MembershipFilter::build(&control, keys.iter(), "x", 1, 0.0).is_err());
        assert!(MembershipFilter::build(&control, keys.iter(), "x", 1, 1.5).is_err());
    }
}
