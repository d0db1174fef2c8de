use std::sync::Arc;
use std::time::Duration;

use kgate_pool::{
    AcquireRequest, Credential, CredentialPool, ErrorKind, PoolConfig, SelectionPolicy,
};

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

#[tokio::test]
async fn cooldown_expires_and_rearms() {
    let pool = Arc::new(CredentialPool::new(PoolConfig {
        error_threshold: 5,
        cooldown: Duration::from_millis(100),
        policy: SelectionPolicy::Priority,
    }));
    pool.add(cred("a"));
    pool.add(cred("b"));

    for _ in 0..5 {
        pool.record_error("a", ErrorKind::Other);
    }

    // While cooling down, scheduling steers around the credential.
    let lease = pool.acquire(&AcquireRequest::default()).unwrap();
    assert_eq!(lease.credential.id, "b");
    drop(lease);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Back in rotation with its error count untouched.
    let lease = pool.acquire(&AcquireRequest::default()).unwrap();
    assert_eq!(lease.credential.id, "a");
    drop(lease);
    let diag = pool.diagnostics();
    let a = diag.iter().find(|d| d.id == "a").unwrap();
    assert_eq!(a.errors, 5);

    // One more error re-arms the cooldown.
    pool.record_error("a", ErrorKind::Other);
    let lease = pool.acquire(&AcquireRequest::default()).unwrap();
    assert_eq!(lease.credential.id, "b");
}

#[tokio::test]
async fn concurrent_acquires_stay_balanced() {
    let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
    pool.add(cred("a"));
    pool.add(cred("b"));
    pool.add(cred("c"));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                let lease = pool.acquire(&AcquireRequest::default()).unwrap();
                tokio::task::yield_now().await;
                pool.record_success(&lease.credential.id, 1, Duration::from_millis(5));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(pool.total_inflight(), 0);
}

#[tokio::test]
async fn fallback_never_starves_with_all_cooling() {
    let pool = Arc::new(CredentialPool::new(PoolConfig {
        error_threshold: 2,
        cooldown: Duration::from_secs(60),
        policy: SelectionPolicy::Smart,
    }));
    pool.add(cred("a"));
    pool.add(cred("b"));
    for id in ["a", "b"] {
        for _ in 0..2 {
            pool.record_error(id, ErrorKind::Other);
        }
    }

    // Both credentials are cooling down; zero-downtime fallback still serves.
    let lease = pool.acquire(&AcquireRequest::default());
    assert!(lease.is_some());
}
