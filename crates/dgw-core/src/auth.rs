//! HMAC mutual-authentication with replay protection.
//!
//! A device proves possession of its tenant key by signing
//! `appid|sn|ts|nonce` with HMAC-SHA256. The verifier enforces a clock
//! window on `ts` and single use of `nonce` within the window.

use crate::error::{GatewayError, GatewayResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Default verification clock window in seconds.
pub const DEFAULT_TIME_WINDOW_SECS: i64 = 300;

/// Short-lived set of recently seen nonces.
///
/// Implementations must eventually evict entries whose TTL has passed and
/// must be safe to share across concurrently authenticating connections.
pub trait NonceStore: Send + Sync {
    fn has(&self, nonce: &str) -> bool;
    fn add(&self, nonce: &str, ttl: Duration) -> GatewayResult<()>;
}

/// In-memory nonce store. Eviction happens on [`sweep_expired`] calls driven
/// by an external tick.
///
/// [`sweep_expired`]: MemoryNonceStore::sweep_expired
#[derive(Default)]
pub struct MemoryNonceStore {
    nonces: Mutex<HashMap<String, Instant>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove entries whose TTL has passed. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
        let before = nonces.len();
        nonces.retain(|_, expiry| *expiry > now);
        before - nonces.len()
    }
}

impl NonceStore for MemoryNonceStore {
    fn has(&self, nonce: &str) -> bool {
        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(nonce)
    }

    fn add(&self, nonce: &str, ttl: Duration) -> GatewayResult<()> {
        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nonce.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

/// Verifies and generates `appid|sn|ts|nonce` HMAC signatures.
pub struct Authenticator {
    /// appid → shared secret.
    keys: HashMap<String, String>,
    time_window_secs: i64,
    nonce_store: Arc<dyn NonceStore>,
}

impl Authenticator {
    pub fn new(
        keys: HashMap<String, String>,
        time_window_secs: i64,
        nonce_store: Arc<dyn NonceStore>,
    ) -> Self {
        Self {
            keys,
            time_window_secs,
            nonce_store,
        }
    }

    /// Verify a device signature against the shared secret for `appid`.
    ///
    /// The check order is load-bearing: the timestamp window is checked
    /// before the nonce so clock-skewed replays do not burn a nonce slot,
    /// and the nonce is inserted before the signature check so a valid
    /// signature presented twice is rejected as a replay.
    pub fn verify(
        &self,
        appid: &str,
        sn: &str,
        ts: i64,
        nonce: &str,
        sign: &str,
    ) -> GatewayResult<()> {
        self.verify_at(appid, sn, ts, nonce, sign, unix_now())
    }

    fn verify_at(
        &self,
        appid: &str,
        sn: &str,
        ts: i64,
        nonce: &str,
        sign: &str,
        now: i64,
    ) -> GatewayResult<()> {
        let key = self
            .keys
            .get(appid)
            .ok_or_else(|| GatewayError::AuthFailed("invalid appid".into()))?;

        if (now - ts).abs() > self.time_window_secs {
            return Err(GatewayError::AuthFailed("timestamp out of window".into()));
        }

        if self.nonce_store.has(nonce) {
            return Err(GatewayError::AuthFailed("nonce already used".into()));
        }
        let ttl = Duration::from_secs((self.time_window_secs as u64) * 2);
        self.nonce_store
            .add(nonce, ttl)
            .map_err(|_| GatewayError::AuthFailed("nonce store error".into()))?;

        let sign_bytes = hex::decode(sign)
            .map_err(|_| GatewayError::AuthFailed("invalid signature".into()))?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| GatewayError::AuthFailed("invalid signature".into()))?;
        mac.update(signature_input(appid, sn, ts, nonce).as_bytes());
        // verify_slice is a constant-time comparison.
        mac.verify_slice(&sign_bytes)
            .map_err(|_| GatewayError::AuthFailed("invalid signature".into()))
    }

    /// Compute the lower-case hex signature a device presents for these
    /// inputs. Used by device-side clients.
    pub fn sign(appid: &str, sn: &str, ts: i64, nonce: &str, key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(signature_input(appid, sn, ts, nonce).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// The UTF-8 string that gets signed: `appid|sn|ts|nonce` with decimal `ts`.
fn signature_input(appid: &str, sn: &str, ts: i64, nonce: &str) -> String {
    format!("{appid}|{sn}|{ts}|{nonce}")
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        let mut keys = HashMap::new();
        keys.insert("A1".to_string(), "K_SECRET_ABC".to_string());
        Authenticator::new(keys, 300, Arc::new(MemoryNonceStore::new()))
    }

    #[test]
    fn sign_is_deterministic() {
        let a = Authenticator::sign("A1", "SN123456", 1700000000, "abc123", "K_SECRET_ABC");
        let b = Authenticator::sign("A1", "SN123456", 1700000000, "abc123", "K_SECRET_ABC");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sign_is_sensitive_to_every_input() {
        let base = Authenticator::sign("A1", "SN1", 1700000000, "n1", "key");
        assert_ne!(base, Authenticator::sign("A2", "SN1", 1700000000, "n1", "key"));
        assert_ne!(base, Authenticator::sign("A1", "SN2", 1700000000, "n1", "key"));
        assert_ne!(base, Authenticator::sign("A1", "SN1", 1700000001, "n1", "key"));
        assert_ne!(base, Authenticator::sign("A1", "SN1", 1700000000, "n2", "key"));
        assert_ne!(base, Authenticator::sign("A1", "SN1", 1700000000, "n1", "kez"));
    }

    #[test]
    fn verify_accepts_valid_signature() {
        let auth = authenticator();
        let now = 1700000000;
        let sign = Authenticator::sign("A1", "SN123456", now, "nonce-1", "K_SECRET_ABC");
        assert!(auth
            .verify_at("A1", "SN123456", now, "nonce-1", &sign, now)
            .is_ok());
    }

    #[test]
    fn verify_rejects_unknown_appid() {
        let auth = authenticator();
        let err = auth
            .verify_at("NOPE", "SN1", 1700000000, "n", "00", 1700000000)
            .unwrap_err();
        assert!(err.to_string().contains("invalid appid"));
    }

    #[test]
    fn clock_window_boundary_is_inclusive() {
        let auth = authenticator();
        let now = 1700000000;

        let ts = now - 300;
        let sign = Authenticator::sign("A1", "SN1", ts, "n-past", "K_SECRET_ABC");
        assert!(auth.verify_at("A1", "SN1", ts, "n-past", &sign, now).is_ok());

        let ts = now + 300;
        let sign = Authenticator::sign("A1", "SN1", ts, "n-future", "K_SECRET_ABC");
        assert!(auth
            .verify_at("A1", "SN1", ts, "n-future", &sign, now)
            .is_ok());

        let ts = now - 301;
        let sign = Authenticator::sign("A1", "SN1", ts, "n-late", "K_SECRET_ABC");
        let err = auth
            .verify_at("A1", "SN1", ts, "n-late", &sign, now)
            .unwrap_err();
        assert!(err.to_string().contains("timestamp out of window"));
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let auth = authenticator();
        let now = 1700000000;
        let sign = Authenticator::sign("A1", "SN1", now, "replay-me", "K_SECRET_ABC");

        assert!(auth
            .verify_at("A1", "SN1", now, "replay-me", &sign, now)
            .is_ok());
        let err = auth
            .verify_at("A1", "SN1", now, "replay-me", &sign, now + 2)
            .unwrap_err();
        assert!(err.to_string().contains("nonce already used"));
    }

    #[test]
    fn out_of_window_replay_does_not_burn_the_nonce() {
        let auth = authenticator();
        let now = 1700000000;
        let sign = Authenticator::sign("A1", "SN1", now - 500, "fresh", "K_SECRET_ABC");

        // Rejected on the window check, before the nonce is recorded.
        assert!(auth
            .verify_at("A1", "SN1", now - 500, "fresh", &sign, now)
            .is_err());

        let sign = Authenticator::sign("A1", "SN1", now, "fresh", "K_SECRET_ABC");
        assert!(auth.verify_at("A1", "SN1", now, "fresh", &sign, now).is_ok());
    }

    #[test]
    fn bad_signature_still_burns_the_nonce() {
        // A valid signature presented after a garbage attempt with the same
        // nonce is rejected as a replay: insertion precedes verification.
        let auth = authenticator();
        let now = 1700000000;

        let err = auth
            .verify_at("A1", "SN1", now, "burned", "deadbeef", now)
            .unwrap_err();
        assert!(err.to_string().contains("invalid signature"));

        let sign = Authenticator::sign("A1", "SN1", now, "burned", "K_SECRET_ABC");
        let err = auth
            .verify_at("A1", "SN1", now, "burned", &sign, now)
            .unwrap_err();
        assert!(err.to_string().contains("nonce already used"));
    }

    #[test]
    fn non_hex_signature_is_invalid() {
        let auth = authenticator();
        let now = 1700000000;
        let err = auth
            .verify_at("A1", "SN1", now, "n-hex", "not hex at all", now)
            .unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[test]
    fn sweep_evicts_expired_nonces() {
        let store = MemoryNonceStore::new();
        store.add("old", Duration::ZERO).unwrap();
        store.add("live", Duration::from_secs(600)).unwrap();
        assert!(store.has("old"));

        let evicted = store.sweep_expired();
        assert_eq!(evicted, 1);
        assert!(!store.has("old"));
        assert!(store.has("live"));
    }
}
