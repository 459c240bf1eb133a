//! PIN-based access control for remote shell and signaling methods.
//!
//! The credential lives in the parameter store as salt, hash, iteration
//! count and an enabled flag. Failed attempts are counted in memory; every
//! `MAX_FAILS`-th consecutive failure locks verification for
//! `LOCKOUT_DURATION`. A successful verification issues a short-lived
//! opaque token that gated methods present on each call.
//!
//! The state mutex only covers in-memory counters and tokens; parameter I/O
//! and key derivation run outside it. Attempts and credential updates are
//! serialized by a busy flag that callers never wait on.

use crate::params::{Params, PIN_ENABLED, PIN_HASH, PIN_ITERATIONS, PIN_SALT};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uplink_core::{UplinkError, UplinkResult};

pub const TOKEN_TTL: Duration = Duration::from_secs(300);
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(30);
pub const MAX_FAILS: u32 = 5;
pub const PBKDF2_ITERATIONS: u32 = 150_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const TOKEN_LEN: usize = 24;
const MALFORMED_PIN: &str = "PIN must be 4-12 digits";
const BUSY: &str = "Another PIN operation is in progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinStatus {
    pub set: bool,
    pub locked: bool,
    pub lock_remaining_s: u64,
}

/// Result of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Granted { token: String, expires_in_s: u64 },
    Rejected { error: String },
    Locked { remaining_s: u64 },
}

impl VerifyOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Granted { token, expires_in_s } => {
                json!({"success": true, "token": token, "expiresInS": expires_in_s})
            }
            Self::Rejected { error } => json!({"success": false, "error": error}),
            Self::Locked { remaining_s } => {
                json!({"success": false, "error": "Locked", "lockRemainingS": remaining_s})
            }
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    consecutive_failures: u32,
    locked_until: Option<Instant>,
    tokens: HashMap<String, Instant>,
}

impl LockState {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Count a failure; returns `true` when it triggered a lockout.
    fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures % MAX_FAILS == 0 {
            self.locked_until = Some(now + LOCKOUT_DURATION);
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.locked_until = None;
    }

    fn purge_expired(&mut self, now: Instant) {
        self.tokens.retain(|_, exp| *exp > now);
    }

    fn issue_token(&mut self, now: Instant) -> UplinkResult<(String, u64)> {
        let token = URL_SAFE_NO_PAD.encode(random_bytes::<TOKEN_LEN>()?);
        self.tokens.insert(token.clone(), now + TOKEN_TTL);
        Ok((token, TOKEN_TTL.as_secs()))
    }
}

fn random_bytes<const N: usize>() -> UplinkResult<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| UplinkError::Other("system rng failure".into()))?;
    Ok(buf)
}

fn well_formed(pin: &str) -> bool {
    (4..=12).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Whole seconds left, rounded up so a live lockout never reports 0.
fn remaining_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Clears the busy flag when dropped.
struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// PIN credential store plus in-memory lockout and token state.
pub struct AccessControl {
    params: Params,
    iterations: u32,
    state: Mutex<LockState>,
    busy: AtomicBool,
}

impl AccessControl {
    pub fn new(params: Params) -> Self {
        Self::with_iterations(params, PBKDF2_ITERATIONS)
    }

    /// Use a custom PBKDF2 work factor for newly set PINs.
    pub fn with_iterations(params: Params, iterations: u32) -> Self {
        Self {
            params,
            iterations: iterations.max(1),
            state: Mutex::new(LockState::default()),
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the credential for one attempt or update, if nobody else has.
    fn begin(&self) -> Option<Busy<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Busy(&self.busy))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LockState> {
        // A poisoned lock only means another handler panicked mid-update;
        // the counters are still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A credential counts only when enabled and fully stored.
    pub fn is_set(&self) -> bool {
        self.stored_credential().is_some()
    }

    fn stored_credential(&self) -> Option<(Vec<u8>, Vec<u8>, NonZeroU32)> {
        if !self.params.get_bool(PIN_ENABLED) {
            return None;
        }
        let salt = self.params.get(PIN_SALT).filter(|s| !s.is_empty())?;
        let hash = self.params.get(PIN_HASH).filter(|h| !h.is_empty())?;
        let iterations = self
            .params
            .get_u64(PIN_ITERATIONS)
            .and_then(|n| u32::try_from(n).ok())
            .and_then(NonZeroU32::new)?;
        Some((salt, hash, iterations))
    }

    fn check_pin(&self, pin: &str) -> bool {
        let Some((salt, hash, iterations)) = self.stored_credential() else {
            return false;
        };
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &salt,
            pin.as_bytes(),
            &hash,
        )
        .is_ok()
    }

    fn store_pin(&self, pin: &str) -> UplinkResult<()> {
        if !well_formed(pin) {
            return Err(UplinkError::InvalidParams(MALFORMED_PIN.into()));
        }
        let salt = random_bytes::<SALT_LEN>()?;
        let iterations = NonZeroU32::new(self.iterations).unwrap_or(NonZeroU32::MIN);
        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &salt,
            pin.as_bytes(),
            &mut hash,
        );
        self.params.put(PIN_SALT, &salt)?;
        self.params.put(PIN_HASH, &hash)?;
        self.params
            .put_string(PIN_ITERATIONS, &iterations.get().to_string())?;
        self.params.put_bool(PIN_ENABLED, true)
    }

    fn erase(&self) -> UplinkResult<()> {
        self.params.put_bool(PIN_ENABLED, false)?;
        self.params.remove(PIN_SALT)?;
        self.params.remove(PIN_HASH)?;
        self.params
            .put_string(PIN_ITERATIONS, &PBKDF2_ITERATIONS.to_string())
    }

    pub fn status(&self) -> PinStatus {
        self.status_at(Instant::now())
    }

    fn status_at(&self, now: Instant) -> PinStatus {
        let remaining = self.lock().remaining(now);
        PinStatus {
            set: self.is_set(),
            locked: remaining.is_some(),
            lock_remaining_s: remaining.map(remaining_secs).unwrap_or(0),
        }
    }

    pub fn verify(&self, pin: &str) -> UplinkResult<VerifyOutcome> {
        self.verify_at(pin, Instant::now())
    }

    pub(crate) fn verify_at(&self, pin: &str, now: Instant) -> UplinkResult<VerifyOutcome> {
        if !self.is_set() {
            let (token, expires_in_s) = self.lock().issue_token(now)?;
            return Ok(VerifyOutcome::Granted {
                token,
                expires_in_s,
            });
        }
        if !well_formed(pin) {
            return Ok(VerifyOutcome::Rejected {
                error: MALFORMED_PIN.into(),
            });
        }

        let Some(_busy) = self.begin() else {
            return Ok(VerifyOutcome::Rejected { error: BUSY.into() });
        };
        let remaining = self.lock().remaining(now);
        if let Some(remaining) = remaining {
            return Ok(VerifyOutcome::Locked {
                remaining_s: remaining_secs(remaining),
            });
        }
        let matched = self.check_pin(pin);

        let mut state = self.lock();
        if !matched {
            if state.record_failure(now) {
                warn!(failures = state.consecutive_failures, "remote PIN locked");
                return Ok(VerifyOutcome::Locked {
                    remaining_s: LOCKOUT_DURATION.as_secs(),
                });
            }
            return Ok(VerifyOutcome::Rejected {
                error: "Incorrect PIN".into(),
            });
        }

        state.reset();
        let (token, expires_in_s) = state.issue_token(now)?;
        Ok(VerifyOutcome::Granted {
            token,
            expires_in_s,
        })
    }

    pub fn set(&self, pin: &str) -> UplinkResult<()> {
        let _busy = self.begin().ok_or_else(|| UplinkError::Other(BUSY.into()))?;
        if self.is_set() {
            return Err(UplinkError::Other("PIN already set".into()));
        }
        self.store_pin(pin)?;
        info!("remote PIN set");
        Ok(())
    }

    pub fn change(&self, old_pin: &str, new_pin: &str) -> UplinkResult<()> {
        self.change_at(old_pin, new_pin, Instant::now())
    }

    fn change_at(&self, old_pin: &str, new_pin: &str, now: Instant) -> UplinkResult<()> {
        if !self.is_set() {
            return Err(UplinkError::Other("PIN not set".into()));
        }
        let _busy = self.begin().ok_or_else(|| UplinkError::Other(BUSY.into()))?;
        self.authorize(Some(old_pin), now)?;
        self.store_pin(new_pin)?;
        self.lock().reset();
        info!("remote PIN changed");
        Ok(())
    }

    /// Erase the credential. Without `force`, the current PIN is required.
    pub fn clear(&self, force: bool, pin: Option<&str>) -> UplinkResult<()> {
        self.clear_at(force, pin, Instant::now())
    }

    fn clear_at(&self, force: bool, pin: Option<&str>, now: Instant) -> UplinkResult<()> {
        let _busy = self.begin().ok_or_else(|| UplinkError::Other(BUSY.into()))?;
        if !force && self.is_set() {
            self.authorize(pin, now)?;
        }
        self.erase()?;
        {
            let mut state = self.lock();
            state.reset();
            state.tokens.clear();
        }
        if force {
            warn!("remote PIN force-cleared");
        } else {
            info!("remote PIN cleared");
        }
        Ok(())
    }

    /// Lockout check plus PIN comparison for change/clear. The caller holds
    /// the busy flag.
    fn authorize(&self, pin: Option<&str>, now: Instant) -> UplinkResult<()> {
        let remaining = self.lock().remaining(now);
        if let Some(remaining) = remaining {
            return Err(UplinkError::Locked {
                remaining_secs: remaining_secs(remaining),
            });
        }
        let ok = pin.is_some_and(|p| self.check_pin(p));
        let mut state = self.lock();
        if !ok {
            if state.record_failure(now) {
                return Err(UplinkError::Other(format!(
                    "Too many attempts. Try again in {}s.",
                    LOCKOUT_DURATION.as_secs()
                )));
            }
            return Err(UplinkError::Other("Incorrect PIN".into()));
        }
        Ok(())
    }

    /// Gate for shell and signaling methods.
    pub fn require_auth(&self, token: Option<&str>) -> UplinkResult<()> {
        self.require_auth_at(token, Instant::now())
    }

    pub(crate) fn require_auth_at(&self, token: Option<&str>, now: Instant) -> UplinkResult<()> {
        if !self.is_set() {
            return Ok(());
        }
        let token = token.filter(|t| !t.is_empty()).ok_or(UplinkError::PinRequired)?;
        let mut state = self.lock();
        state.purge_expired(now);
        match state.tokens.get(token) {
            Some(exp) if *exp > now => Ok(()),
            _ => Err(UplinkError::PinRequired),
        }
    }
}
