//! Integration tests for the credential lifecycle.
//!
//! Login creates the credential, authenticated calls read it, logout and
//! file-backed persistence behave as a dashboard session expects.

use std::sync::Arc;

use hydrant_core::{
    ApiRequest, ClientConfig, Coordinator, FileStore, MemoryStore, ReqwestTransport,
    RequestError, SecretStore, Session, StoreBackend,
};
use tempfile::TempDir;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

fn coordinator_with_session(server: &MockServer, session: Session) -> Coordinator {
    let config = ClientConfig::for_base_url(Url::parse(&server.uri()).unwrap());
    Coordinator::new(session, Arc::new(ReqwestTransport::new()), &config)
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(serde_json::json!({
            "username": "operator",
            "password": "hunter2"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "accessToken": "login-access",
            "refreshToken": "login-refresh"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_login_stores_credential_and_authenticates_calls() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/zones"))
        .and(header("authorization", "Bearer login-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["north"])))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator =
        coordinator_with_session(&server, Session::with_store(Arc::new(MemoryStore::new())));

    let credential = coordinator.login("operator", "hunter2").await.unwrap();
    assert_eq!(credential.access_token.expose(), "login-access");
    assert_eq!(credential.username.as_deref(), Some("operator"));

    let zones: Vec<String> = coordinator.get_json("/api/zones").await.unwrap();
    assert_eq!(zones, vec!["north"]);
}

#[tokio::test]
async fn test_login_rejected_is_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(serde_json::json!({ "message": "invalid credentials" })),
        )
        .mount(&server)
        .await;

    let coordinator =
        coordinator_with_session(&server, Session::with_store(Arc::new(MemoryStore::new())));

    let result = coordinator.login("operator", "wrong").await;

    assert!(matches!(result, Err(RequestError::Server { .. })));
    assert!(coordinator.session().credential().await.unwrap().is_none());
    assert_eq!(coordinator.refresh_count(), 0);
}

#[tokio::test]
async fn test_logout_clears_credential() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator_with_session(&server, Session::with_store(store.clone()));

    coordinator.login("operator", "hunter2").await.unwrap();
    assert!(!store.is_empty());

    coordinator.logout().await.unwrap();

    assert!(store.is_empty());
    assert!(coordinator.session().credential().await.unwrap().is_none());
}

#[tokio::test]
async fn test_post_json_round_trip() {
    #[derive(serde::Serialize)]
    struct NewLeak<'a> {
        street: &'a str,
    }

    #[derive(serde::Deserialize)]
    struct Created {
        id: u64,
    }

    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/leaks"))
        .and(header("authorization", "Bearer login-access"))
        .and(body_json(serde_json::json!({ "street": "Weir Rd" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": 12 })))
        .mount(&server)
        .await;

    let coordinator =
        coordinator_with_session(&server, Session::with_store(Arc::new(MemoryStore::new())));
    coordinator.login("operator", "hunter2").await.unwrap();

    let created: Created = coordinator
        .post_json("/api/leaks", &NewLeak { street: "Weir Rd" })
        .await
        .unwrap();
    assert_eq!(created.id, 12);
}

#[tokio::test]
async fn test_unauthenticated_request_carries_no_token() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/public/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .mount(&server)
        .await;

    let coordinator =
        coordinator_with_session(&server, Session::with_store(Arc::new(MemoryStore::new())));
    coordinator.login("operator", "hunter2").await.unwrap();

    let response = coordinator
        .send_unauthenticated(ApiRequest::get("/public/status").skip_auth())
        .await
        .unwrap();
    assert_eq!(response.text(), "up");

    let requests = server.received_requests().await.unwrap();
    let status_call = requests
        .iter()
        .find(|r| r.url.path() == "/public/status")
        .unwrap();
    assert!(status_call.headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_file_backed_session_survives_new_coordinator() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/assets"))
        .and(header("authorization", "Bearer login-access"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let file = temp.path().join("credentials.json");

    {
        let store = FileStore::load_from_path(file.clone()).unwrap();
        let coordinator = coordinator_with_session(&server, Session::new(Arc::new(store), "gis"));
        coordinator.login("operator", "hunter2").await.unwrap();
    }

    let mut config = ClientConfig::for_base_url(Url::parse(&server.uri()).unwrap());
    config.namespace = "gis".to_string();
    config.store = StoreBackend::File {
        path: Some(file.clone()),
    };
    let restored = Coordinator::from_config(&config).unwrap();

    assert_eq!(
        restored.session().username().await.unwrap().as_deref(),
        Some("operator")
    );
    restored.send(ApiRequest::get("/api/assets")).await.unwrap();

    let reread = FileStore::load_from_path(file).unwrap();
    assert!(reread.exists("hydrant/gis/refresh_token").await.unwrap());
}
