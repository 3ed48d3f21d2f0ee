//! Remote Key Manager client and key cache against a mock HTTP service.

use std::sync::Arc;
use std::time::Duration;

use octoidp_auth::AuthError;
use octoidp_auth::keys::{HttpKeyManager, KeyCache, KeyManager};
use octoidp_auth::token::{Jwks, SigningAlgorithm, SigningKeyPair};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn key_pair() -> SigningKeyPair {
    SigningKeyPair::generate(SigningAlgorithm::ES384).unwrap()
}

fn jwks_of(keys: &[&SigningKeyPair]) -> Jwks {
    let mut jwks = Jwks::new();
    for key in keys {
        jwks.add_key(key.to_jwk());
    }
    jwks
}

fn manager(server: &MockServer) -> HttpKeyManager {
    HttpKeyManager::new(
        &server.uri(),
        Some("km-secret".to_string()),
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn active_key_is_fetched_with_bearer_secret() {
    let server = MockServer::start().await;
    let key = key_pair();

    Mock::given(method("GET"))
        .and(path("/keys/active"))
        .and(header("authorization", "Bearer km-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(key.to_material()))
        .expect(1)
        .mount(&server)
        .await;

    let material = manager(&server).active_signing_key().await.unwrap();
    assert_eq!(material.kid, key.kid);
}

#[tokio::test]
async fn rotate_posts_to_rotate_route() {
    let server = MockServer::start().await;
    let next = key_pair();

    Mock::given(method("POST"))
        .and(path("/keys/rotate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(next.to_material()))
        .expect(1)
        .mount(&server)
        .await;

    let material = manager(&server).rotate_key().await.unwrap();
    assert_eq!(material.kid, next.kid);
}

#[tokio::test]
async fn server_failure_is_key_manager_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/keys/jwks"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = manager(&server).jwks().await.err().unwrap();
    assert!(matches!(err, AuthError::KeyManager { .. }));
    assert!(err.is_server_error());
}

#[tokio::test]
async fn malformed_body_is_key_manager_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/keys/active"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let err = manager(&server).active_signing_key().await.err().unwrap();
    assert!(matches!(err, AuthError::KeyManager { .. }));
}

#[tokio::test]
async fn cache_serves_known_kid_and_refetches_unknown_once() {
    let server = MockServer::start().await;
    let key = key_pair();

    Mock::given(method("GET"))
        .and(path("/keys/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_of(&[&key])))
        .expect(2)
        .mount(&server)
        .await;

    let cache = KeyCache::new(
        Arc::new(manager(&server)),
        Duration::from_secs(600),
        Duration::from_secs(300),
    );

    // One fetch fills the cache; repeated lookups stay local.
    for _ in 0..5 {
        cache.verification_key(&key.kid).await.unwrap();
    }

    // Unknown kid: exactly one more fetch, then a revoked-key error.
    let err = cache.verification_key("retired-kid").await.err().unwrap();
    assert!(matches!(err, AuthError::KeyRevoked { .. }));

    let stats = cache.stats();
    assert_eq!(stats.refetches, 2);
    assert_eq!(stats.jwks_hits, 4);
}

#[tokio::test]
async fn malformed_key_set_is_not_cached() {
    let server = MockServer::start().await;
    let key = key_pair();
    let mut broken = jwks_of(&[&key]);
    broken.keys[0].x = None;

    Mock::given(method("GET"))
        .and(path("/keys/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(broken))
        .expect(2)
        .mount(&server)
        .await;

    let cache = KeyCache::new(
        Arc::new(manager(&server)),
        Duration::from_secs(600),
        Duration::from_secs(300),
    );

    assert!(matches!(
        cache.verification_key(&key.kid).await,
        Err(AuthError::Configuration { .. })
    ));
    assert!(cache.stats().jwks_kids.is_empty());

    // Nothing was cached, so the next lookup fetches again.
    assert!(cache.verification_key(&key.kid).await.is_err());
}
