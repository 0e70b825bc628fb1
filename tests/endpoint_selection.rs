#![allow(missing_docs)]

mod common;

use authwire::model::Information;
use authwire::{AuthClient, CallerContext, Credential, Protocol};
use common::test_helpers::{self as helpers, Authority};

#[tokio::test]
async fn round_robin_visits_every_authority_once_per_cycle() {
    let authorities = [Authority::approving(), Authority::approving(), Authority::approving()];
    let mut addresses = Vec::new();
    for authority in &authorities {
        addresses.push(helpers::spawn_http(authority.clone()).await.to_string());
    }
    let mut config = helpers::config("http", addresses.join(","));
    config.balance = "round-robin".into();
    let client = AuthClient::new(config).unwrap();

    for round in 0..3 {
        let token = format!("token-{}", round);
        let info = client.approve(&Credential::bearer(token), &CallerContext::new()).await;
        assert_eq!(info.status(), Information::Ok);
    }
    for authority in &authorities {
        assert_eq!(authority.calls(), 1);
    }
}

#[tokio::test]
async fn refreshed_addresses_take_effect_on_the_next_call() {
    let first = Authority::approving();
    let second = Authority::approving();
    let first_addr = helpers::spawn_http(first.clone()).await;
    let second_addr = helpers::spawn_http(second.clone()).await;
    let client = AuthClient::new(helpers::config("http", first_addr.to_string())).unwrap();

    client.approve(&Credential::bearer("one"), &CallerContext::new()).await;
    client.refresh_addresses(&second_addr.to_string()).unwrap();
    client.approve(&Credential::bearer("two"), &CallerContext::new()).await;

    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
}

#[tokio::test]
async fn weighted_selection_never_picks_outside_the_list() {
    let authority = Authority::approving();
    let addr = helpers::spawn_http(authority.clone()).await;
    let mut config = helpers::config("http", format!("{}#5", addr));
    config.balance = "weighted".into();
    let client = AuthClient::new(config).unwrap();

    for round in 0..5 {
        let token = format!("w-{}", round);
        client.approve(&Credential::bearer(token), &CallerContext::new()).await;
    }
    assert_eq!(authority.calls(), 5);
}
