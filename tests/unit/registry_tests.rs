//! Unit tests for the run registry and keepalive expiry.

use std::time::{Duration, Instant};

use acp_proxy::runs::registry::{
    clamp_keepalive_ttl, RunPhase, RunRegistry, MAX_KEEPALIVE_TTL_SECONDS,
    MIN_KEEPALIVE_TTL_SECONDS,
};
use acp_proxy::AppError;

const TTL: Duration = Duration::from_secs(120);

// ── TTL clamp ────────────────────────────────────────────────────────────────

#[test]
fn ttl_uses_default_and_clamps() {
    assert_eq!(clamp_keepalive_ttl(None, 1800), Duration::from_secs(1800));
    assert_eq!(
        clamp_keepalive_ttl(Some(1), 1800),
        Duration::from_secs(MIN_KEEPALIVE_TTL_SECONDS)
    );
    assert_eq!(
        clamp_keepalive_ttl(Some(u64::MAX), 1800),
        Duration::from_secs(MAX_KEEPALIVE_TTL_SECONDS)
    );
}

// ── Registration ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_or_create_reuses_the_same_run() {
    let registry = RunRegistry::new();

    let first = registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");
    let second = registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("reused");

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len().await, 1);
    assert!(registry.owns_instance("acp-run-r1").await);
    assert!(!registry.owns_instance("acp-run-r2").await);
}

#[tokio::test]
async fn run_is_bound_to_its_instance() {
    let registry = RunRegistry::new();
    registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");

    let result = registry.get_or_create("r1", "other", TTL).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn remove_returns_the_run_once() {
    let registry = RunRegistry::new();
    registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");

    assert!(registry.remove("r1").await.is_some());
    assert!(registry.remove("r1").await.is_none());
    assert!(registry.is_empty().await);
}

// ── Expiry ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_runs_are_taken_once() {
    let registry = RunRegistry::new();
    let run = registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");
    run.state().phase = RunPhase::Ready;
    let later = Instant::now() + TTL + Duration::from_secs(1);

    assert!(!run.is_expired(Instant::now()));
    assert!(run.is_expired(later));

    let taken = registry.take_expired(later).await;
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].run_id(), "r1");
    assert!(registry.take_expired(later).await.is_empty());
    assert!(registry.get("r1").await.is_none());
}

#[tokio::test]
async fn opening_and_prompting_runs_never_expire() {
    let registry = RunRegistry::new();
    let run = registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");
    let later = Instant::now() + TTL * 10;

    assert_eq!(run.state().phase, RunPhase::Opening);
    assert!(registry.take_expired(later).await.is_empty());

    run.state().phase = RunPhase::Prompting;
    assert!(registry.take_expired(later).await.is_empty());

    run.state().phase = RunPhase::Ready;
    assert_eq!(registry.take_expired(later).await.len(), 1);
}

#[tokio::test]
async fn touch_pushes_expiry_forward() {
    let registry = RunRegistry::new();
    let run = registry
        .get_or_create("r1", "acp-run-r1", TTL)
        .await
        .expect("created");
    let before = run.state().expires_at.expect("armed on create");

    tokio::time::sleep(Duration::from_millis(20)).await;
    run.touch();

    let after = run.state().expires_at.expect("armed on touch");
    assert!(after > before);
}
