//! Time-bucketed tokens authenticating inbound trigger requests.
//!
//! A token is `sha256(secret : action : tick)` in hex, where `tick` counts
//! half-lifetimes since the epoch. A token is accepted during the tick it was
//! issued in and the one after, so it lives between one half and one full
//! lifetime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::QueueError;

const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct NonceGate {
    secret: String,
    lifetime: Duration,
}

impl NonceGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            lifetime: DEFAULT_LIFETIME,
        }
    }

    /// A gate whose secret only this process knows; tokens it issues can
    /// only be verified by the same process.
    pub fn ephemeral() -> Self {
        Self::new(Uuid::new_v4().simple().to_string())
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime.max(Duration::from_secs(2));
        self
    }

    fn tick(&self, now: DateTime<Utc>) -> i64 {
        let half = (self.lifetime.as_secs() / 2).max(1) as i64;
        now.timestamp().div_euclid(half) + 1
    }

    fn token_for_tick(&self, action: &str, tick: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(action.as_bytes());
        hasher.update(b":");
        hasher.update(tick.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn issue(&self, action: &str) -> String {
        self.issue_at(action, Utc::now())
    }

    pub fn issue_at(&self, action: &str, now: DateTime<Utc>) -> String {
        self.token_for_tick(action, self.tick(now))
    }

    pub fn verify(&self, token: &str, action: &str) -> Result<(), QueueError> {
        self.verify_at(token, action, Utc::now())
    }

    pub fn verify_at(&self, token: &str, action: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let tick = self.tick(now);
        let valid = [tick, tick - 1]
            .into_iter()
            .any(|t| constant_time_eq(token.as_bytes(), self.token_for_tick(action, t).as_bytes()));
        if valid {
            Ok(())
        } else {
            Err(QueueError::Auth(format!("invalid or expired token for '{action}'")))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_for_same_action() {
        let gate = NonceGate::new("s3cret");
        let token = gate.issue("jobs");
        assert_eq!(token.len(), 64);
        assert!(gate.verify(&token, "jobs").is_ok());
        assert!(gate.verify(&token, "other").is_err());
    }

    #[test]
    fn token_from_another_secret_is_rejected() {
        let token = NonceGate::new("a").issue("jobs");
        let err = NonceGate::new("b").verify(&token, "jobs").unwrap_err();
        assert!(matches!(err, QueueError::Auth(_)));
    }

    #[test]
    fn token_survives_one_tick_then_expires() {
        let gate = NonceGate::new("s").with_lifetime(Duration::from_secs(3600));
        let issued = DateTime::from_timestamp(1_800, 0).unwrap();
        let token = gate.issue_at("jobs", issued);

        let next_tick = issued + chrono::Duration::seconds(1_800);
        assert!(gate.verify_at(&token, "jobs", next_tick).is_ok());

        let two_ticks_later = issued + chrono::Duration::seconds(3_600);
        assert!(gate.verify_at(&token, "jobs", two_ticks_later).is_err());
    }

    #[test]
    fn ephemeral_gates_do_not_share_secrets() {
        let token = NonceGate::ephemeral().issue("jobs");
        assert!(NonceGate::ephemeral().verify(&token, "jobs").is_err());
    }
}
