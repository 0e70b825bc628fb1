#![allow(missing_docs)]

mod common;

use authwire::codec::fields;
use authwire::model::{Information, LogoutType, UpgradeType, UserPrincipal};
use authwire::{AuthClient, CallerContext, ClientError, Credential, Protocol};
use common::test_helpers::{self as helpers, Authority};
use serde_json::json;

async fn approve(client: &AuthClient, token: &str) -> Information {
    client.approve(&Credential::bearer(token), &CallerContext::new()).await.status()
}

#[tokio::test]
async fn http_echoes_the_response_serial() {
    let authority = Authority::new(|operation, map| {
        assert_eq!(operation, "oauth");
        assert_eq!(map.get(fields::TOKEN), Some(&json!("abc")));
        helpers::principal_reply("u-1", "alice")
    });
    let addr = helpers::spawn_http(authority).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();
    assert_eq!(approve(&client, "abc").await, Information::Ok);
}

#[tokio::test]
async fn http_error_status_means_authority_not_found() {
    let addr = helpers::spawn_http_status(503).await;
    let client = AuthClient::new(helpers::config("http", addr.to_string())).unwrap();
    assert_eq!(approve(&client, "abc").await, Information::ServerNotFound);
}

#[tokio::test]
async fn http2_speaks_the_same_envelope() {
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority.clone()).await;
    let client = AuthClient::new(helpers::config("http2", addr.to_string())).unwrap();
    assert_eq!(approve(&client, "abc").await, Information::Ok);
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn lite_posts_plain_fields() {
    let authority = Authority::new(|operation, map| {
        assert_eq!(operation, "oauth");
        assert_eq!(map.get(fields::TOKEN), Some(&json!("plain")));
        helpers::principal_reply("u-2", "bob")
    });
    let addr = helpers::spawn_lite(authority).await;
    let client = AuthClient::new(helpers::config("lite", addr.to_string())).unwrap();
    assert_eq!(approve(&client, "plain").await, Information::Ok);
}

#[tokio::test]
async fn tcp_reuses_one_connection_with_short_names() {
    let authority = Authority::new(|operation, map| {
        assert!(map.contains_key("t"), "tcp names are abbreviated: {:?}", map);
        match operation {
            "approve" => helpers::principal_reply("u-1", "alice"),
            _ => authwire::model::Reply::ok(json!({})),
        }
    });
    let addr = helpers::spawn_tcp(authority.clone(), 1).await;
    let client = AuthClient::new(helpers::config("tcp", helpers::tcp_address(addr))).unwrap();

    assert_eq!(approve(&client, "one").await, Information::Ok);
    assert_eq!(approve(&client, "two").await, Information::Ok);
    assert_eq!(authority.calls(), 2);
}

#[tokio::test]
async fn tcp_reply_with_unknown_version_is_a_server_error() {
    let authority = Authority::approving();
    let addr = helpers::spawn_tcp(authority, 2).await;
    let client = AuthClient::new(helpers::config("tcp", helpers::tcp_address(addr))).unwrap();
    assert_eq!(approve(&client, "abc").await, Information::ServerError);
}

#[tokio::test]
async fn tcp_does_not_speak_online_operations() {
    let authority = Authority::approving();
    let addr = helpers::spawn_tcp(authority.clone(), 1).await;
    let client = AuthClient::new(helpers::config("tcp", helpers::tcp_address(addr))).unwrap();

    let status = client.get_online_status("u-1").await;
    assert!(status.is_multiple());
    let token = client.create_temporary_token("abc", &serde_json::Map::new()).await;
    assert_eq!(token.code, 501);
    assert_eq!(authority.calls(), 0);
}

#[tokio::test]
async fn udp_answers_in_one_datagram() {
    let authority = Authority::new(|_, map| {
        assert!(map.contains_key("k"), "udp names are one letter: {:?}", map);
        helpers::principal_reply("u-1", "alice")
    });
    let addr = helpers::spawn_udp(authority.clone()).await;
    let client = AuthClient::new(helpers::config("udp", helpers::udp_address(addr))).unwrap();
    assert_eq!(approve(&client, "abc").await, Information::Ok);
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn rsocket_routes_by_operation() {
    let authority = Authority::new(|route, _| match route {
        "oauth.approve" => helpers::principal_reply("u-1", "alice"),
        "oauth.logout" => authwire::model::Reply::ok(json!(null)),
        _ => helpers::rejected_reply(),
    });
    let addr = helpers::spawn_rsocket(authority.clone()).await;
    let client = AuthClient::new(helpers::config("rsocket", addr.to_string())).unwrap();

    assert_eq!(approve(&client, "abc").await, Information::Ok);
    client.logout("u-1", LogoutType::Logout, None).await.unwrap();
    let err = client
        .upgrade(&Credential::bearer("abc"), UpgradeType::Refresh, Some("r-1"), &CallerContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Credential { .. }), "got {:?}", err);
    assert_eq!(authority.calls(), 3);
    client.close().await;
}

#[cfg(feature = "websocket")]
#[tokio::test]
async fn websocket_correlates_replies_by_id() {
    let authority = Authority::new(|operation, _| match operation {
        "approve" => helpers::principal_reply("u-1", "alice"),
        _ => helpers::rejected_reply(),
    });
    let addr = helpers::spawn_websocket(authority.clone()).await;
    let client = AuthClient::new(helpers::config("websocket", addr.to_string())).unwrap();

    let (a, b) = tokio::join!(approve(&client, "one"), approve(&client, "two"));
    assert_eq!((a, b), (Information::Ok, Information::Ok));
    assert_eq!(authority.calls(), 2);
    client.close().await;
}

#[tokio::test]
async fn unreachable_socket_authority_is_reported_not_thrown() {
    let client = AuthClient::new(helpers::config("tcp", helpers::dead_address().await)).unwrap();
    let status = approve(&client, "abc").await;
    assert!(status.is_transport_failure(), "got {:?}", status);
}

#[tokio::test]
async fn oauth2_introspects_bearer_tokens() {
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use std::collections::HashMap;

    let app = Router::new().route(
        "/oauth2/introspect",
        post(|Form(form): Form<HashMap<String, String>>| async move {
            if form.get("token").map(String::as_str) == Some("live") {
                Json(json!({"active": true, "sub": "u-9", "username": "carol", "scope": "read write"}))
            } else {
                Json(json!({"active": false}))
            }
        }),
    );
    let addr = helpers::serve(app).await;
    let client = AuthClient::new(helpers::config("oauth2", addr.to_string())).unwrap();

    let ctx = CallerContext::new();
    let info = client.approve(&Credential::bearer("live"), &ctx).await;
    assert_eq!(info.status(), Information::Ok);
    assert_eq!(ctx.username().as_deref(), Some("carol"));
    assert!(info.principal().unwrap().roles.contains("read"));

    assert_eq!(approve(&client, "revoked").await, Information::AuthenticationFailure);
}

#[cfg(feature = "grpc")]
#[tokio::test]
async fn grpc_calls_the_auth_service() {
    let authority = Authority::new(|method, map| match method {
        "approve" => {
            assert_eq!(map.get(fields::TOKEN), Some(&json!("abc")));
            helpers::principal_reply("u-1", "alice")
        }
        "logout" => authwire::model::Reply::ok(json!(null)),
        _ => helpers::rejected_reply(),
    });
    let addr = helpers::spawn_grpc(authority.clone()).await;
    let client = AuthClient::new(helpers::config("grpc", addr.to_string())).unwrap();

    let ctx = CallerContext::new();
    let info = client.approve(&Credential::bearer("abc"), &ctx).await;
    assert_eq!(info.status(), Information::Ok);
    assert_eq!(ctx.username().as_deref(), Some("alice"));
    client.logout("u-1", LogoutType::Logout, None).await.unwrap();
    assert_eq!(approve(&client, "other").await, Information::AuthenticationFailure);
    assert_eq!(authority.calls(), 3);

    let status = client.get_online_status("u-1").await;
    assert!(status.is_multiple());
    assert_eq!(authority.calls(), 3);
    client.close().await;
}

#[tokio::test]
async fn udp_refuses_to_send_an_oversized_datagram() {
    let authority = Authority::approving();
    let addr = helpers::spawn_udp(authority.clone()).await;
    let client = AuthClient::new(helpers::config("udp", helpers::udp_address(addr))).unwrap();

    let info = client.approve(&Credential::bearer("x".repeat(4_000)), &CallerContext::new()).await;
    assert_eq!(info.status(), Information::ServerError);
    assert!(info.message().contains("1400"), "got {:?}", info.message());
    assert_eq!(authority.calls(), 0);
}

#[tokio::test]
async fn udp_accepts_a_reply_with_another_sequence_but_warns() {
    let logs = helpers::CapturedLogs::default();
    let _guard = logs.install();

    let authority = Authority::approving();
    let addr = helpers::spawn_udp_skewed(authority.clone(), 7).await;
    let client = AuthClient::new(helpers::config("udp", helpers::udp_address(addr))).unwrap();

    assert_eq!(approve(&client, "abc").await, Information::Ok);
    assert_eq!(authority.calls(), 1);
    let text = logs.text();
    assert!(text.contains("reply sequence mismatch"), "logs: {text}");
    assert!(text.contains("authwire::udp"));
}

#[tokio::test]
async fn oauth2_logout_revokes_the_session_token() {
    use axum::routing::post;
    use axum::{Form, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    let revoked = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&revoked);
    let app = Router::new().route(
        "/oauth2/revoke",
        post(move |Form(form): Form<HashMap<String, String>>| async move {
            seen.lock().unwrap().push(form.get("token").cloned().unwrap_or_default());
        }),
    );
    let addr = helpers::serve(app).await;
    let client = AuthClient::new(helpers::config("oauth2", addr.to_string())).unwrap();

    let user = UserPrincipal::new("u-1", "ada").with_token("tok-1");
    client.logout("u-1", LogoutType::Logout, Some(&user)).await.unwrap();
    client.logout("u-1", LogoutType::Logout, None).await.unwrap();
    assert_eq!(*revoked.lock().unwrap(), vec!["tok-1".to_string(), "u-1".to_string()]);
}
