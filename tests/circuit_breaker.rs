#![allow(missing_docs)]

mod common;

use std::time::{Duration, Instant};

use authwire::model::Information;
use authwire::resilience::CircuitState;
use authwire::{AuthClient, CallerContext, Credential, ManualClock, Protocol};
use common::test_helpers::{self as helpers, Authority};

fn breaker_state(client: &AuthClient) -> CircuitState {
    client.resilience().breaker().expect("breaker enabled").state()
}

#[tokio::test]
async fn open_circuit_fails_closed_until_cooldown_then_recovers() {
    let mut config = helpers::config("http", helpers::dead_address().await);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown_ms = 1_000;
    config.circuit_breaker.fallback_message = "authority is resting".into();
    let clock = ManualClock::new();
    let client = AuthClient::builder(config).clock(clock.clone()).build().unwrap();

    for token in ["t1", "t2"] {
        let info = client.approve(&Credential::bearer(token), &CallerContext::new()).await;
        assert!(info.status().is_transport_failure(), "got {:?}", info.status());
    }
    assert_eq!(breaker_state(&client), CircuitState::Open);

    // A healthy authority is not consulted while the circuit is open.
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority.clone()).await;
    client.refresh_addresses(&addr.to_string()).unwrap();

    let ctx = CallerContext::new();
    let started = Instant::now();
    let info = client.approve(&Credential::bearer("t3"), &ctx).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(info.status(), Information::AuthenticationFailure);
    assert_eq!(info.message(), "authority is resting");
    assert!(ctx.principal().is_none());
    assert_eq!(authority.calls(), 0);

    clock.advance(1_001);
    let info = client.approve(&Credential::bearer("t4"), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::Ok);
    assert_eq!(authority.calls(), 1);
    assert_eq!(breaker_state(&client), CircuitState::Closed);
}

#[tokio::test]
async fn failed_trial_call_reopens_the_circuit() {
    let mut config = helpers::config("http", helpers::dead_address().await);
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.cooldown_ms = 500;
    let clock = ManualClock::new();
    let client = AuthClient::builder(config).clock(clock.clone()).build().unwrap();

    client.approve(&Credential::bearer("a"), &CallerContext::new()).await;
    assert_eq!(breaker_state(&client), CircuitState::Open);

    clock.advance(501);
    let info = client.approve(&Credential::bearer("b"), &CallerContext::new()).await;
    assert!(info.status().is_transport_failure());
    assert_eq!(breaker_state(&client), CircuitState::Open);

    let info = client.approve(&Credential::bearer("c"), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::AuthenticationFailure);
}

#[tokio::test]
async fn credential_rejections_do_not_trip_the_breaker() {
    let authority = Authority::rejecting();
    let addr = helpers::spawn_http(authority.clone()).await;
    let mut config = helpers::config("http", addr.to_string());
    config.circuit_breaker.failure_threshold = 1;
    let client = AuthClient::new(config).unwrap();

    for token in ["x", "y", "z"] {
        let info = client.approve(&Credential::bearer(token), &CallerContext::new()).await;
        assert_eq!(info.status(), Information::AuthenticationFailure);
    }
    assert_eq!(authority.calls(), 3);
    assert_eq!(breaker_state(&client), CircuitState::Closed);
}

#[tokio::test]
async fn every_retry_attempt_counts_toward_the_threshold() {
    let mut config = helpers::config("http", helpers::dead_address().await);
    config.retry.enabled = true;
    config.retry.max_attempts = 3;
    config.retry.delay_ms = 10;
    config.circuit_breaker.failure_threshold = 3;
    let client = AuthClient::new(config).unwrap();

    let info = client.approve(&Credential::bearer("once"), &CallerContext::new()).await;
    assert!(info.status().is_transport_failure(), "got {:?}", info.status());
    assert_eq!(breaker_state(&client), CircuitState::Open);
}

#[tokio::test]
async fn oversized_datagram_leaves_the_failure_streak_alone() {
    let dead = helpers::dead_address().await;
    let mut config = helpers::config("udp", dead);
    config.timeouts.read_ms = 300;
    config.circuit_breaker.failure_threshold = 2;
    let client = AuthClient::new(config).unwrap();
    let breaker = || client.resilience().breaker().expect("breaker enabled");

    let info = client.approve(&Credential::bearer("small-1"), &CallerContext::new()).await;
    assert!(info.status().is_transport_failure(), "got {:?}", info.status());
    assert_eq!(breaker().failure_count(), 1);

    let oversized = "x".repeat(4_000);
    let info = client.approve(&Credential::bearer(oversized), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::ServerError);
    assert_eq!(breaker().state(), CircuitState::Closed);
    assert_eq!(breaker().failure_count(), 1);

    client.approve(&Credential::bearer("small-2"), &CallerContext::new()).await;
    assert_eq!(breaker().state(), CircuitState::Open);
}
