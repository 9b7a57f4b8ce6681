use std::time::Duration;

use gameroom_api::{
    ApiClient, ApiConfig, ApiError, CredentialStore, FileStorage, RefreshConfig, ResponseBody,
};
use httpmock::prelude::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn mock_login(server: &MockServer, access: &str, refresh: &str) {
    let body = json!({
        "access_token": access,
        "token_type": "bearer",
        "refresh_token": refresh,
    });
    server.mock(|when, then| {
        when.method(POST).path("/auth/login");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(body);
    });
}

async fn logged_in_client(server: &MockServer) -> ApiClient {
    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();
    client.login("player1", "secret").await.unwrap();
    client
}

// ---------------------------------------------------------------------------
// Single-flight refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_401s_trigger_exactly_one_refresh() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    let stale = server.mock(|when, then| {
        when.method(GET)
            .path("/games/rooms")
            .header("authorization", "Bearer old");
        then.status(401)
            .header("content-type", "application/json")
            .json_body(json!({"detail": "token expired"}));
    });
    let fresh = server.mock(|when, then| {
        when.method(GET)
            .path("/games/rooms")
            .header("authorization", "Bearer new");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"rooms": []}));
    });
    let refresh = server.mock(|when, then| {
        when.method(POST)
            .path("/auth/refresh")
            .json_body(json!({"refresh_token": "r1"}));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"access_token": "new"}));
    });

    let client = logged_in_client(&server).await;
    let (a, b, c, d, e) = tokio::join!(
        client.get("/games/rooms"),
        client.get("/games/rooms"),
        client.get("/games/rooms"),
        client.get("/games/rooms"),
        client.get("/games/rooms"),
    );

    for result in [a, b, c, d, e] {
        let body = result.unwrap();
        assert_eq!(body.json().unwrap()["rooms"], json!([]));
    }

    // One network refresh total; every caller was replayed exactly once
    // with the renewed credential.
    assert_eq!(refresh.hits(), 1);
    assert_eq!(stale.hits(), 5);
    assert_eq!(fresh.hits(), 5);
    assert_eq!(client.credentials().access_token().as_deref(), Some("new"));
}

#[tokio::test]
async fn single_401_refreshes_and_retries_once() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    server.mock(|when, then| {
        when.method(GET)
            .path("/me")
            .header("authorization", "Bearer old");
        then.status(401)
            .json_body(json!({"detail": "token expired"}));
    });
    let fresh = server.mock(|when, then| {
        when.method(GET)
            .path("/me")
            .header("authorization", "Bearer new");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"username": "player1"}));
    });
    server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"access_token": "new"}));
    });

    let client = logged_in_client(&server).await;
    let body = client.get("/me").await.unwrap();
    assert_eq!(body.json().unwrap()["username"], "player1");
    assert_eq!(fresh.hits(), 1);
}

#[tokio::test]
async fn second_401_after_replay_surfaces_without_second_retry() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    server.mock(|when, then| {
        when.method(GET)
            .path("/me")
            .header("authorization", "Bearer old");
        then.status(401).json_body(json!({"detail": "expired"}));
    });
    let fresh = server.mock(|when, then| {
        when.method(GET)
            .path("/me")
            .header("authorization", "Bearer new");
        then.status(401).json_body(json!({"detail": "still rejected"}));
    });
    let refresh = server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"access_token": "new"}));
    });

    let client = logged_in_client(&server).await;
    match client.get("/me").await {
        Err(ApiError::Unauthorized(message)) => assert_eq!(message, "still rejected"),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(refresh.hits(), 1);
    assert_eq!(fresh.hits(), 1);
}

// ---------------------------------------------------------------------------
// Refresh throttling and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_inside_min_interval_is_refused_without_network_call() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    server.mock(|when, then| {
        when.method(GET).path("/me");
        then.status(401).json_body(json!({"detail": "expired"}));
    });
    let refresh = server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(500).json_body(json!({"message": "refresh backend down"}));
    });

    let client = logged_in_client(&server).await;

    // First 401 attempts the refresh and fails.
    assert!(matches!(
        client.get("/me").await,
        Err(ApiError::Unauthorized(_))
    ));
    assert_eq!(refresh.hits(), 1);

    // A second attempt within the minimum interval must not reach the
    // network at all.
    assert!(matches!(
        client.get("/me").await,
        Err(ApiError::Unauthorized(_))
    ));
    assert_eq!(refresh.hits(), 1);
}

#[tokio::test]
async fn refresh_refused_after_failure_cap() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    server.mock(|when, then| {
        when.method(GET).path("/me");
        then.status(401).json_body(json!({"detail": "expired"}));
    });
    let refresh = server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(500).json_body(json!({"message": "boom"}));
    });

    let mut config = ApiConfig::new(server.base_url());
    config.refresh = RefreshConfig {
        min_interval: Duration::ZERO,
        max_failures: 2,
    };
    let client = ApiClient::new(config, CredentialStore::in_memory()).unwrap();
    client.login("player1", "secret").await.unwrap();

    for _ in 0..2 {
        assert!(client.get("/me").await.is_err());
    }
    assert_eq!(refresh.hits(), 2);

    // Cap reached: further 401s are surfaced without touching the network.
    assert!(client.get("/me").await.is_err());
    assert_eq!(refresh.hits(), 2);
}

#[tokio::test]
async fn rejected_refresh_token_clears_the_session() {
    let server = MockServer::start();
    mock_login(&server, "old", "r1");
    server.mock(|when, then| {
        when.method(GET).path("/me");
        then.status(401).json_body(json!({"detail": "expired"}));
    });
    server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(401).json_body(json!({"detail": "refresh token revoked"}));
    });

    let client = logged_in_client(&server).await;
    assert!(client.credentials().is_authenticated());
    assert!(matches!(
        client.get("/me").await,
        Err(ApiError::Unauthorized(_))
    ));
    assert!(!client.credentials().is_authenticated());
}

// ---------------------------------------------------------------------------
// Response mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_2xx_surfaces_server_message() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/boom");
        then.status(500)
            .header("content-type", "application/json")
            .json_body(json!({"message": "kitchen on fire"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404)
            .header("content-type", "application/json")
            .json_body(json!({"detail": "no such room"}));
    });

    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();

    match client.get("/boom").await {
        Err(ApiError::Api { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "kitchen on fire");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
    match client.get("/missing").await {
        Err(ApiError::Api { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "no such room");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn non_json_body_passes_through_as_text() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200)
            .header("content-type", "text/plain")
            .body("pong");
    });

    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();
    let body = client.get("/health").await.unwrap();
    assert_eq!(body, ResponseBody::Text("pong".to_string()));
    assert!(body.json().is_none());
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_persists_session_and_logout_clears_it() {
    let server = MockServer::start();
    mock_login(&server, "tok-1", "ref-1");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let store = CredentialStore::new(Box::new(FileStorage::new(&path)));
    let client = ApiClient::new(ApiConfig::new(server.base_url()), store).unwrap();
    let login = client.login("player1", "secret").await.unwrap();
    assert_eq!(login.access_token, "tok-1");

    // A separate store over the same file sees the session.
    let revived = CredentialStore::new(Box::new(FileStorage::new(&path)));
    assert_eq!(revived.access_token().as_deref(), Some("tok-1"));
    assert_eq!(revived.refresh_token().as_deref(), Some("ref-1"));

    client.logout();
    assert!(!client.credentials().is_authenticated());
    let after = CredentialStore::new(Box::new(FileStorage::new(&path)));
    assert!(!after.is_authenticated());
}

#[tokio::test]
async fn failed_login_does_not_store_credentials() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/auth/login");
        then.status(401)
            .header("content-type", "application/json")
            .json_body(json!({"detail": "bad credentials"}));
    });

    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();
    match client.login("player1", "wrong").await {
        Err(ApiError::Unauthorized(message)) => assert_eq!(message, "bad credentials"),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert!(!client.credentials().is_authenticated());
}

#[tokio::test]
async fn register_posts_account_payload() {
    let server = MockServer::start();
    let register = server.mock(|when, then| {
        when.method(POST).path("/auth/register").json_body(json!({
            "username": "player1",
            "email": "p1@example.com",
            "password": "secret",
        }));
        then.status(201)
            .header("content-type", "application/json")
            .json_body(json!({"id": 7}));
    });

    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();
    let body = client
        .register("player1", "p1@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(body.json().unwrap()["id"], 7);
    assert_eq!(register.hits(), 1);
}

#[tokio::test]
async fn token_provider_reflects_session_state() {
    let server = MockServer::start();
    mock_login(&server, "tok-1", "ref-1");

    let client = ApiClient::new(
        ApiConfig::new(server.base_url()),
        CredentialStore::in_memory(),
    )
    .unwrap();
    let get_token = client.token_provider();

    assert!(get_token().await.is_err());

    client.login("player1", "secret").await.unwrap();
    assert_eq!(get_token().await.unwrap(), "tok-1");

    client.logout();
    assert!(get_token().await.is_err());
}
