//! Security filter primitives: message authentication, per-agent rate
//! limiting and liveness tracking.
//!
//! The MAC key is process-global from the channel's point of view:
//! [`MacKey`] is created once at init and handed to the channel, which is
//! the only component that signs or verifies.

use crate::message::V2xMessage;
use crossway_env::AgentId;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::collections::VecDeque;

type HmacSha256 = Hmac<Sha256>;

/// Shared HMAC-SHA256 key for V2X message authentication.
#[derive(Clone)]
pub struct MacKey {
    key: Vec<u8>,
}

impl MacKey {
    /// Creates a key from raw bytes.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Derives a deterministic key from a simulation seed.
    pub fn from_seed(seed: u64) -> Self {
        // Stretch the seed so the key is not a trivial 8-byte value
        let stretched = seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&seed.to_le_bytes());
        key.extend_from_slice(&stretched.to_le_bytes());
        Self { key }
    }

    /// Computes the hex MAC over a message's canonical payload.
    pub fn sign(&self, message: &V2xMessage) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(message.canonical_payload().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a message's MAC in constant time.
    pub fn verify(&self, message: &V2xMessage) -> bool {
        let Ok(expected) = hex::decode(&message.mac) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(message.canonical_payload().as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Signs a message in place and returns it.
    pub fn signed(&self, mut message: V2xMessage) -> V2xMessage {
        message.mac = self.sign(&message);
        message
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "MacKey({} bytes)", self.key.len())
    }
}

/// Sliding-window rate limiter, one bucket per agent.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window_secs: f64,
    buckets: HashMap<AgentId, VecDeque<f64>>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_sec` events per agent per second.
    pub fn new(max_per_sec: usize) -> Self {
        Self {
            max_per_window: max_per_sec,
            window_secs: 1.0,
            buckets: HashMap::new(),
        }
    }

    /// Returns true and consumes budget if the agent may send now.
    pub fn allow(&mut self, agent_id: &AgentId, now: f64) -> bool {
        let bucket = self.buckets.entry(agent_id.clone()).or_default();
        while let Some(&front) = bucket.front() {
            if now - front >= self.window_secs {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.max_per_window {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Drops an agent's bucket.
    pub fn remove(&mut self, agent_id: &AgentId) {
        self.buckets.remove(agent_id);
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// Tracks per-agent liveness stamps and finds silent agents.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout_secs: f64,
    last_seen: HashMap<AgentId, f64>,
}

impl LivenessTracker {
    pub fn new(timeout_secs: f64) -> Self {
        Self {
            timeout_secs,
            last_seen: HashMap::new(),
        }
    }

    /// Refreshes an agent's liveness stamp.
    pub fn touch(&mut self, agent_id: &AgentId, now: f64) {
        self.last_seen.insert(agent_id.clone(), now);
    }

    /// Agents with no update for longer than the timeout, sorted for
    /// deterministic iteration.
    pub fn stale_agents(&self, now: f64) -> Vec<AgentId> {
        let mut stale: Vec<AgentId> = self
            .last_seen
            .iter()
            .filter(|(_, &ts)| now - ts > self.timeout_secs)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn remove(&mut self, agent_id: &AgentId) {
        self.last_seen.remove(agent_id);
    }

    pub fn reset(&mut self) {
        self.last_seen.clear();
    }
}
