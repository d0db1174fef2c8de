//! Credential pool with health-aware scheduling.
//!
//! One mutex guards all pool state; nothing async runs under it. Leases
//! release on drop so every acquire is balanced even on cancellation paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::credential::{Credential, CredentialId, CredentialStatus, ErrorKind};
use crate::policy::{SMART_TIE_BAND, SelectionPolicy};

const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
const IDLE_BONUS_AFTER: Duration = Duration::from_secs(30);
const FAST_LATENCY_MS: f64 = 5_000.0;
const COOLDOWN_CLEAR_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub error_threshold: u32,
    pub cooldown: Duration,
    pub policy: SelectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            cooldown: Duration::from_secs(60),
            policy: SelectionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquireRequest {
    pub requires_opus: bool,
    pub allowed_ids: Option<HashSet<CredentialId>>,
}

#[derive(Debug)]
struct Slot {
    cred: Credential,
    requests: u64,
    errors: u32,
    consecutive_errors: u32,
    health: i64,
    inflight: u32,
    cooldown_until: Option<Instant>,
    quota_exhausted: bool,
    needs_refresh: bool,
    last_used: Option<Instant>,
    recent: VecDeque<Instant>,
    latency_ewma_ms: f64,
    latency_samples: u64,
    total_tokens: u64,
}

impl Slot {
    fn new(cred: Credential) -> Self {
        Self {
            cred,
            requests: 0,
            errors: 0,
            consecutive_errors: 0,
            health: 100,
            inflight: 0,
            cooldown_until: None,
            quota_exhausted: false,
            needs_refresh: false,
            last_used: None,
            recent: VecDeque::new(),
            latency_ewma_ms: 0.0,
            latency_samples: 0,
            total_tokens: 0,
        }
    }

    fn prune_recent(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > RECENT_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooldown_active(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn eligible(&self, now: Instant, req: &AcquireRequest, threshold: u32) -> bool {
        if self.cred.disabled || self.quota_exhausted {
            return false;
        }
        if self.cooldown_active(now) {
            return false;
        }
        if self.consecutive_errors > threshold {
            return false;
        }
        if req.requires_opus && !self.cred.supports_opus() {
            return false;
        }
        if let Some(allowed) = &req.allowed_ids
            && !allowed.contains(&self.cred.id)
        {
            return false;
        }
        true
    }
}

struct Inner {
    slots: Vec<Slot>,
    index: HashMap<CredentialId, usize>,
    policy: SelectionPolicy,
}

pub struct CredentialPool {
    inner: Mutex<Inner>,
    config: PoolConfig,
}

/// Scoped acquisition: dropping the lease releases the credential.
pub struct CredentialLease {
    pool: Arc<CredentialPool>,
    pub credential: Credential,
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.pool.release(&self.credential.id);
    }
}

impl CredentialPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                index: HashMap::new(),
                policy: config.policy,
            }),
            config,
        }
    }

    pub fn add(&self, cred: Credential) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(&cred.id) {
            inner.slots[pos].cred = cred;
            return;
        }
        let id = cred.id.clone();
        inner.slots.push(Slot::new(cred));
        let pos = inner.slots.len() - 1;
        inner.index.insert(id, pos);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner.index.remove(id) else {
            return false;
        };
        inner.slots.remove(pos);
        let ids: Vec<CredentialId> = inner
            .slots
            .iter()
            .map(|slot| slot.cred.id.clone())
            .collect();
        inner.index = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        true
    }

    pub fn update(&self, id: &str, patch: impl FnOnce(&mut Credential)) -> bool {
        let mut inner = self.lock();
        let Some(&pos) = inner.index.get(id) else {
            return false;
        };
        patch(&mut inner.slots[pos].cred);
        true
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        let inner = self.lock();
        inner
            .index
            .get(id)
            .map(|&pos| inner.slots[pos].cred.clone())
    }

    pub fn set_policy(&self, policy: SelectionPolicy) {
        self.lock().policy = policy;
    }

    pub fn find_by_refresh_token(&self, refresh_token: &str) -> Option<CredentialId> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .find(|slot| slot.cred.refresh_token.as_deref() == Some(refresh_token))
            .map(|slot| slot.cred.id.clone())
    }

    /// Restore a persisted quota flag without touching health bookkeeping.
    pub fn set_quota_exhausted(&self, id: &str, value: bool) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(id) {
            inner.slots[pos].quota_exhausted = value;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn acquire(self: &Arc<Self>, req: &AcquireRequest) -> Option<CredentialLease> {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.slots.is_empty() {
            return None;
        }
        for slot in inner.slots.iter_mut() {
            slot.prune_recent(now);
            if slot.cooldown_until.is_some_and(|until| until <= now) {
                slot.cooldown_until = None;
            }
        }

        // Single-credential pools run in zero-downtime mode: the cooldown is
        // cleared on the spot rather than stalling the only account.
        if inner.slots.len() == 1 {
            let slot = &mut inner.slots[0];
            if slot.cred.disabled {
                return None;
            }
            slot.cooldown_until = None;
            return Some(self.lease_at(&mut inner, 0, now));
        }

        let threshold = self.config.error_threshold;
        let candidates: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.eligible(now, req, threshold))
            .map(|(pos, _)| pos)
            .collect();

        let chosen = if candidates.is_empty() {
            self.fallback_choice(&mut inner, req, now)?
        } else {
            match inner.policy {
                SelectionPolicy::Priority => candidates[0],
                SelectionPolicy::Balanced => balanced_choice(&inner.slots, &candidates),
                SelectionPolicy::Smart => smart_choice(&inner.slots, &candidates, now),
            }
        };

        Some(self.lease_at(&mut inner, chosen, now))
    }

    /// Every candidate failed availability; keep serving anyway. Prefers the
    /// credential whose cooldown ends soonest, then the one with the fewest
    /// errors, then anything not disabled.
    fn fallback_choice(
        &self,
        inner: &mut Inner,
        req: &AcquireRequest,
        now: Instant,
    ) -> Option<usize> {
        let usable = |slot: &Slot| {
            if slot.cred.disabled {
                return false;
            }
            if req.requires_opus && !slot.cred.supports_opus() {
                return false;
            }
            if let Some(allowed) = &req.allowed_ids
                && !allowed.contains(&slot.cred.id)
            {
                return false;
            }
            true
        };

        let soonest = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| usable(slot) && !slot.quota_exhausted)
            .filter_map(|(pos, slot)| slot.cooldown_until.map(|until| (pos, until)))
            .min_by_key(|(_, until)| *until);
        if let Some((pos, until)) = soonest {
            if until.saturating_duration_since(now) < COOLDOWN_CLEAR_SLACK {
                inner.slots[pos].cooldown_until = None;
            }
            warn!(
                event = "pool_fallback",
                credential_id = %inner.slots[pos].cred.id,
                reason = "soonest_cooldown"
            );
            return Some(pos);
        }

        let fewest_errors = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| usable(slot) && !slot.quota_exhausted)
            .min_by_key(|(_, slot)| slot.errors)
            .map(|(pos, _)| pos);
        if let Some(pos) = fewest_errors {
            let slot = &mut inner.slots[pos];
            slot.errors /= 2;
            slot.consecutive_errors /= 2;
            warn!(
                event = "pool_fallback",
                credential_id = %slot.cred.id,
                reason = "fewest_errors"
            );
            return Some(pos);
        }

        let forced = inner
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| usable(slot))
            .map(|(pos, _)| pos);
        if let Some(pos) = forced {
            warn!(
                event = "pool_fallback",
                credential_id = %inner.slots[pos].cred.id,
                reason = "forced"
            );
        }
        forced
    }

    fn lease_at(self: &Arc<Self>, inner: &mut Inner, pos: usize, now: Instant) -> CredentialLease {
        let slot = &mut inner.slots[pos];
        slot.inflight += 1;
        slot.requests += 1;
        slot.recent.push_back(now);
        slot.last_used = Some(now);
        CredentialLease {
            pool: Arc::clone(self),
            credential: slot.cred.clone(),
        }
    }

    fn release(&self, id: &str) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(id) {
            let slot = &mut inner.slots[pos];
            slot.inflight = slot.inflight.saturating_sub(1);
        }
    }

    pub fn record_success(&self, id: &str, tokens: u64, latency: Duration) {
        let mut inner = self.lock();
        let Some(&pos) = inner.index.get(id) else {
            return;
        };
        let slot = &mut inner.slots[pos];
        slot.consecutive_errors = 0;
        slot.health = (slot.health + 10).min(100);
        slot.total_tokens += tokens;
        let sample = latency.as_millis() as f64;
        slot.latency_ewma_ms = if slot.latency_samples == 0 {
            sample
        } else {
            slot.latency_ewma_ms * 0.8 + sample * 0.2
        };
        slot.latency_samples += 1;
    }

    pub fn record_error(&self, id: &str, kind: ErrorKind) {
        let mut inner = self.lock();
        let Some(&pos) = inner.index.get(id) else {
            return;
        };
        let threshold = self.config.error_threshold;
        let cooldown = self.config.cooldown;
        let slot = &mut inner.slots[pos];

        let decay = match kind {
            ErrorKind::Banned => 50,
            ErrorKind::Auth => 40,
            ErrorKind::Quota => 30,
            ErrorKind::Network | ErrorKind::Other => 20,
        };
        slot.health = (slot.health - decay).max(0);
        slot.consecutive_errors += 1;
        // Network blips are not held against the account long-term.
        if kind != ErrorKind::Network {
            slot.errors += 1;
        }

        match kind {
            ErrorKind::Banned => {
                slot.cred.disabled = true;
                warn!(event = "credential_banned", credential_id = %slot.cred.id);
            }
            ErrorKind::Quota => {
                slot.quota_exhausted = true;
                info!(event = "credential_quota_exhausted", credential_id = %slot.cred.id);
            }
            ErrorKind::Auth => {
                slot.needs_refresh = true;
            }
            _ => {}
        }

        if slot.consecutive_errors >= threshold {
            slot.cooldown_until = Some(Instant::now() + cooldown);
            info!(
                event = "credential_cooldown",
                credential_id = %slot.cred.id,
                consecutive_errors = slot.consecutive_errors,
                cooldown_ms = cooldown.as_millis() as u64
            );
        }
    }

    pub fn mark_needs_refresh(&self, id: &str) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(id) {
            inner.slots[pos].needs_refresh = true;
        }
    }

    pub fn needs_refresh(&self, id: &str) -> bool {
        let inner = self.lock();
        inner
            .index
            .get(id)
            .is_some_and(|&pos| inner.slots[pos].needs_refresh)
    }

    /// Install refreshed tokens. A reported remaining quota returns a
    /// quota-exhausted credential to the rotation.
    pub fn apply_refresh(
        &self,
        id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<OffsetDateTime>,
        subscription_tier: Option<String>,
        remaining_quota: Option<u64>,
    ) {
        let mut inner = self.lock();
        let Some(&pos) = inner.index.get(id) else {
            return;
        };
        let slot = &mut inner.slots[pos];
        slot.cred.access_token = access_token;
        if refresh_token.is_some() {
            slot.cred.refresh_token = refresh_token;
        }
        if expires_at.is_some() {
            slot.cred.expires_at = expires_at;
        }
        if subscription_tier.is_some() {
            slot.cred.subscription_tier = subscription_tier;
        }
        slot.needs_refresh = false;
        if remaining_quota.is_some_and(|q| q > 0) && slot.quota_exhausted {
            slot.quota_exhausted = false;
            info!(event = "credential_quota_recovered", credential_id = %slot.cred.id);
        }
    }

    /// Periodic self-heal: when the whole pool is unavailable, soften the
    /// error bookkeeping; when that is not enough, reset it outright.
    pub fn self_heal(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        let threshold = self.config.error_threshold;
        let all_unavailable = |slots: &[Slot]| {
            slots.iter().all(|slot| {
                slot.cred.disabled
                    || slot.quota_exhausted
                    || slot.cooldown_active(now)
                    || slot.consecutive_errors > threshold
            })
        };

        if inner.slots.is_empty() || !all_unavailable(&inner.slots) {
            return;
        }
        warn!(event = "pool_self_heal", stage = "soften");
        for slot in inner.slots.iter_mut() {
            if !slot.cred.disabled {
                slot.errors /= 2;
                slot.consecutive_errors /= 2;
                slot.health = slot.health.max(50);
            }
        }
        if all_unavailable(&inner.slots) {
            warn!(event = "pool_self_heal", stage = "full_reset");
            for slot in inner.slots.iter_mut() {
                slot.cooldown_until = None;
                slot.errors = 0;
                slot.consecutive_errors = 0;
            }
        }
    }

    pub fn diagnostics(&self) -> Vec<CredentialStatus> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .slots
            .iter()
            .map(|slot| CredentialStatus {
                id: slot.cred.id.clone(),
                disabled: slot.cred.disabled,
                quota_exhausted: slot.quota_exhausted,
                needs_refresh: slot.needs_refresh,
                health: slot.health,
                inflight: slot.inflight,
                requests: slot.requests,
                errors: slot.errors,
                consecutive_errors: slot.consecutive_errors,
                recent_requests_5m: slot.recent.len(),
                cooldown_remaining_ms: slot
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0),
                avg_latency_ms: slot.latency_ewma_ms,
                total_tokens: slot.total_tokens,
                subscription_tier: slot.cred.subscription_tier.clone(),
            })
            .collect()
    }

    pub fn total_inflight(&self) -> u64 {
        self.lock()
            .slots
            .iter()
            .map(|slot| slot.inflight as u64)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn balanced_choice(slots: &[Slot], candidates: &[usize]) -> usize {
    *candidates
        .iter()
        .min_by_key(|&&pos| {
            let slot = &slots[pos];
            slot.inflight as usize * 1000 + slot.recent.len()
        })
        .expect("candidates not empty")
}

fn smart_choice(slots: &[Slot], candidates: &[usize], now: Instant) -> usize {
    let avg_recent: f64 = candidates
        .iter()
        .map(|&pos| slots[pos].recent.len() as f64)
        .sum::<f64>()
        / candidates.len() as f64;

    let scored: Vec<(usize, f64)> = candidates
        .iter()
        .map(|&pos| (pos, smart_score(&slots[pos], avg_recent, now)))
        .collect();
    let top = scored
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::NEG_INFINITY, f64::max);
    let band = top - top.abs() * SMART_TIE_BAND;
    let tied: Vec<usize> = scored
        .iter()
        .filter(|(_, score)| *score >= band)
        .map(|(pos, _)| *pos)
        .collect();

    if tied.len() == 1 {
        tied[0]
    } else {
        tied[rand::rng().random_range(0..tied.len())]
    }
}

fn smart_score(slot: &Slot, avg_recent: f64, now: Instant) -> f64 {
    let mut score = slot.health as f64 - 30.0 * slot.inflight as f64;

    let recent = slot.recent.len() as f64;
    if recent > avg_recent {
        let over = (recent - avg_recent) / (avg_recent + 1.0);
        score -= (over * 40.0).min(40.0);
    } else if recent < avg_recent {
        let under = (avg_recent - recent) / (avg_recent + 1.0);
        score += (under * 30.0).min(30.0);
    }

    let idle = slot
        .last_used
        .is_none_or(|used| now.duration_since(used) >= IDLE_BONUS_AFTER);
    if idle {
        score += 20.0;
    }
    if slot.latency_samples > 0 && slot.latency_ewma_ms < FAST_LATENCY_MS {
        score += 10.0;
    }

    if let Some(expires_at) = slot.cred.expires_at {
        let remaining = expires_at - OffsetDateTime::now_utc();
        if remaining <= time::Duration::minutes(2) {
            score -= 15.0;
        } else if remaining <= time::Duration::minutes(5) {
            score -= 10.0;
        } else if remaining <= time::Duration::minutes(10) {
            score -= 5.0;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(id: &str) -> Credential {
        Credential {
            id: id.to_string(),
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            region: "us-east-1".to_string(),
            profile_arn: None,
            machine_id: None,
            subscription_tier: Some("pro".to_string()),
            expires_at: None,
            disabled: false,
        }
    }

    fn pool_with(config: PoolConfig, ids: &[&str]) -> Arc<CredentialPool> {
        let pool = Arc::new(CredentialPool::new(config));
        for id in ids {
            pool.add(cred(id));
        }
        pool
    }

    #[test]
    fn acquire_release_balances_inflight() {
        let pool = pool_with(PoolConfig::default(), &["a", "b"]);
        {
            let _l1 = pool.acquire(&AcquireRequest::default()).unwrap();
            let _l2 = pool.acquire(&AcquireRequest::default()).unwrap();
            assert_eq!(pool.total_inflight(), 2);
        }
        assert_eq!(pool.total_inflight(), 0);
    }

    #[test]
    fn banned_disables_permanently() {
        let pool = pool_with(PoolConfig::default(), &["a", "b"]);
        pool.record_error("a", ErrorKind::Banned);
        for _ in 0..10 {
            let lease = pool.acquire(&AcquireRequest::default()).unwrap();
            assert_eq!(lease.credential.id, "b");
        }
    }

    #[test]
    fn quota_exhaustion_and_recovery() {
        let pool = pool_with(PoolConfig::default(), &["a", "b"]);
        pool.record_error("a", ErrorKind::Quota);
        let lease = pool.acquire(&AcquireRequest::default()).unwrap();
        assert_eq!(lease.credential.id, "b");
        drop(lease);

        pool.apply_refresh(
            "a",
            "new-token".to_string(),
            None,
            None,
            None,
            Some(100),
        );
        let diag = pool.diagnostics();
        let a = diag.iter().find(|d| d.id == "a").unwrap();
        assert!(!a.quota_exhausted);
    }

    #[test]
    fn free_tier_cannot_serve_opus() {
        let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
        let mut free = cred("free");
        free.subscription_tier = Some("free".to_string());
        pool.add(free);
        pool.add(cred("pro"));
        let req = AcquireRequest {
            requires_opus: true,
            allowed_ids: None,
        };
        for _ in 0..10 {
            let lease = pool.acquire(&req).unwrap();
            assert_eq!(lease.credential.id, "pro");
        }
    }

    #[test]
    fn unknown_tier_is_treated_as_free() {
        let mut unknown = cred("u");
        unknown.subscription_tier = None;
        assert!(!unknown.supports_opus());
    }

    #[test]
    fn network_errors_do_not_count_persistently() {
        let pool = pool_with(PoolConfig::default(), &["a"]);
        pool.record_error("a", ErrorKind::Network);
        pool.record_error("a", ErrorKind::Other);
        let diag = pool.diagnostics();
        assert_eq!(diag[0].errors, 1);
        assert_eq!(diag[0].consecutive_errors, 2);
    }

    #[test]
    fn health_is_clamped() {
        let pool = pool_with(PoolConfig::default(), &["a"]);
        for _ in 0..10 {
            pool.record_error("a", ErrorKind::Other);
        }
        assert_eq!(pool.diagnostics()[0].health, 0);
        for _ in 0..20 {
            pool.record_success("a", 10, Duration::from_millis(100));
        }
        assert_eq!(pool.diagnostics()[0].health, 100);
    }

    #[test]
    fn single_credential_fast_path_clears_cooldown() {
        let config = PoolConfig {
            cooldown: Duration::from_secs(3600),
            ..Default::default()
        };
        let pool = pool_with(config, &["only"]);
        for _ in 0..5 {
            pool.record_error("only", ErrorKind::Other);
        }
        assert!(pool.diagnostics()[0].cooldown_remaining_ms > 0);
        let lease = pool.acquire(&AcquireRequest::default()).unwrap();
        assert_eq!(lease.credential.id, "only");
        drop(lease);
        assert_eq!(pool.diagnostics()[0].cooldown_remaining_ms, 0);
    }

    #[test]
    fn priority_policy_prefers_insertion_order() {
        let config = PoolConfig {
            policy: SelectionPolicy::Priority,
            ..Default::default()
        };
        let pool = pool_with(config, &["first", "second"]);
        let lease = pool.acquire(&AcquireRequest::default()).unwrap();
        assert_eq!(lease.credential.id, "first");
    }

    #[test]
    fn balanced_policy_avoids_loaded_credentials() {
        let config = PoolConfig {
            policy: SelectionPolicy::Balanced,
            ..Default::default()
        };
        let pool = pool_with(config, &["a", "b"]);
        let held = pool.acquire(&AcquireRequest::default()).unwrap();
        assert_eq!(held.credential.id, "a");
        let next = pool.acquire(&AcquireRequest::default()).unwrap();
        assert_eq!(next.credential.id, "b");
    }

    #[test]
    fn empty_pool_returns_none() {
        let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
        assert!(pool.acquire(&AcquireRequest::default()).is_none());
    }

    #[test]
    fn self_heal_revives_error_locked_pool() {
        let config = PoolConfig {
            cooldown: Duration::from_secs(3600),
            ..Default::default()
        };
        let pool = pool_with(config, &["a", "b"]);
        for id in ["a", "b"] {
            for _ in 0..6 {
                pool.record_error(id, ErrorKind::Other);
            }
        }
        pool.self_heal();
        let diag = pool.diagnostics();
        for status in &diag {
            assert!(status.consecutive_errors <= 5);
            assert!(status.health >= 50);
        }
    }
}
