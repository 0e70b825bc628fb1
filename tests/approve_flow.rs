#![allow(missing_docs)]

mod common;

use authwire::codec::fields;
use authwire::model::{codes, Information, Reply};
use authwire::telemetry::{CacheEvent, ClientEvent, EventEmitter, MemorySink, RequestOutcome};
use authwire::{AuthClient, CallerContext, Cookie, Credential, Protocol};
use common::test_helpers::{self as helpers, Authority};
use serde_json::json;

#[tokio::test]
async fn valid_token_is_verified_once_then_served_from_cache() {
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();

    let ctx = CallerContext::new().with_remote_address("203.0.113.7");
    let first = client.approve(&Credential::bearer("abc"), &ctx).await;
    assert_eq!(first.status(), Information::Ok);
    assert_eq!(first.principal().map(|p| p.username.as_str()), Some("alice"));
    assert_eq!(ctx.user_id().as_deref(), Some("u-1"));
    assert!(client.cache().peek("abc").is_some());

    let second = client.approve(&Credential::bearer("abc"), &CallerContext::new()).await;
    assert_eq!(second, first);
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn rejected_credential_clears_the_session() {
    let authority = Authority::rejecting();
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();

    let ctx = CallerContext::new();
    let credential = Credential::cookies([
        Cookie::new("theme", "dark"),
        Cookie::new("x-oauth-cookie", "expired"),
    ]);
    let info = client.approve(&credential, &ctx).await;

    assert_eq!(info.status(), Information::AuthenticationFailure);
    assert!(info.principal().is_none());
    assert!(ctx.principal().is_none());
    assert_eq!(ctx.removed_cookies(), vec!["x-oauth-cookie".to_string()]);
}

#[tokio::test]
async fn ok_reply_without_a_principal_unregisters_the_caller() {
    let authority = Authority::new(|_, map| {
        if map.get(fields::TOKEN) == Some(&json!("live")) {
            helpers::principal_reply("u-1", "alice")
        } else {
            Reply { code: codes::OK.into(), message: None, data: None }
        }
    });
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();

    let ctx = CallerContext::new();
    client.approve(&Credential::bearer("live"), &ctx).await;
    assert_eq!(ctx.username().as_deref(), Some("alice"));

    let session = Credential::cookies([Cookie::new("x-oauth-cookie", "c1")]);
    let info = client.approve(&session, &ctx).await;
    assert_eq!(info.status(), Information::AuthenticationServerException);
    assert_eq!(ctx.username(), None);
    assert_eq!(ctx.removed_cookies(), vec!["x-oauth-cookie".to_string()]);
    assert_eq!(authority.calls(), 2);
}

#[tokio::test]
async fn failed_results_are_not_served_from_cache() {
    let authority = Authority::rejecting();
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();

    let credential = Credential::bearer("expired");
    client.approve(&credential, &CallerContext::new()).await;
    assert!(client.cache().peek("expired").is_some());

    client.approve(&credential, &CallerContext::new()).await;
    assert_eq!(authority.calls(), 2);
}

#[tokio::test]
async fn missing_authority_fails_without_network() {
    let client = AuthClient::new(helpers::config("http", "")).unwrap();
    let info = client.approve(&Credential::bearer("abc"), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::ServerError);
}

#[tokio::test]
async fn blank_credentials_are_not_sent() {
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();

    let info = client.approve(&Credential::cookies(Vec::<Cookie>::new()), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::NoAuth);
    assert_eq!(authority.calls(), 0);
    assert!(client.cache().is_empty());
}

#[tokio::test]
async fn verification_reports_cache_and_request_events() {
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority).await;
    let sink = MemorySink::new();
    let client = AuthClient::builder(helpers::config("http", addr.to_string()))
        .events(EventEmitter::new(sink.clone()))
        .build()
        .unwrap();

    client.approve(&Credential::bearer("abc"), &CallerContext::new()).await;
    client.approve(&Credential::bearer("abc"), &CallerContext::new()).await;

    let events = sink.events();
    assert_eq!(events.first(), Some(&ClientEvent::Cache(CacheEvent::Miss)));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Request(RequestOutcome::Success { transport: "http", .. })
    )));
    assert_eq!(events.last(), Some(&ClientEvent::Cache(CacheEvent::Hit)));
}
