use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use http::{Method, Response as HttpResponse, StatusCode};
use tokio::sync::Mutex;
use url::Url;

use weft_oauth::config::{AuthServerEndpoints, ClientConfig};
use weft_oauth::dpop::generate_key;
use weft_oauth::error::OAuthError;
use weft_oauth::http_client::HttpClient;
use weft_oauth::security::ssrf::{ResolveHost, UrlGate};
use weft_oauth::session::{OAuthSession, SessionState};
use weft_oauth::store::{MemoryTokenStore, TokenRecord, TokenStore};

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, resp: http::Response<Vec<u8>>) {
        self.queue.lock().await.push_back(resp);
    }
}

impl HttpClient for MockClient {
    type Error = std::convert::Infallible;
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl core::future::Future<
        Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
    > + Send {
        let log = self.log.clone();
        let queue = self.queue.clone();
        async move {
            log.lock().await.push(request);
            Ok(queue.lock().await.pop_front().expect("no queued response"))
        }
    }
}

struct PublicResolver;

impl ResolveHost for PublicResolver {
    fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        client_id: Url::parse("https://app.example.com/oauth/client-metadata.json").unwrap(),
        redirect_uri: Url::parse("https://app.example.com/oauth/callback").unwrap(),
        scopes: vec!["openid".into()],
        endpoints: AuthServerEndpoints {
            par_endpoint: Url::parse("https://auth.example.com/par").unwrap(),
            authorization_endpoint: Url::parse("https://auth.example.com/authorize").unwrap(),
            token_endpoint: Url::parse("https://auth.example.com/token").unwrap(),
        },
        allowed_hosts: vec!["auth.example.com".into(), "api.example.com".into()],
    }
}

fn session(
    client: Arc<MockClient>,
    store: MemoryTokenStore,
) -> OAuthSession<MockClient, MemoryTokenStore> {
    let cfg = config();
    let gate = UrlGate::with_resolver(cfg.allowed_hosts.clone(), Arc::new(PublicResolver));
    OAuthSession::new(cfg, generate_key(), "user1", store, client)
        .unwrap()
        .with_url_gate(gate)
}

fn expired_record(refresh_token: Option<&str>) -> TokenRecord {
    TokenRecord {
        access_token: "AT-old".into(),
        refresh_token: refresh_token.map(Into::into),
        expires_at: Some(Utc::now() - TimeDelta::seconds(30)),
    }
}

fn refresh_ok() -> http::Response<Vec<u8>> {
    HttpResponse::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({
                "access_token": "AT-new",
                "refresh_token": "RT-new",
                "expires_in": 3600,
                "token_type": "DPoP"
            }))
            .unwrap(),
        )
        .unwrap()
}

fn resource_ok() -> http::Response<Vec<u8>> {
    HttpResponse::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&serde_json::json!({"ok": true})).unwrap())
        .unwrap()
}

#[tokio::test]
async fn expired_token_triggers_exactly_one_refresh_before_the_resource_call() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens("user1", &expired_record(Some("RT-old")))
        .await
        .unwrap();

    let mut session = session(client.clone(), store.clone());
    assert!(session.restore().await.unwrap());
    assert_eq!(session.state(), SessionState::Expired);

    client.push(refresh_ok()).await;
    client.push(resource_ok()).await;

    let response = session
        .call_protected_resource(Method::GET, "https://api.example.com/profile", None)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(session.state(), SessionState::Authenticated);

    let log = client.log.lock().await;
    assert_eq!(log.len(), 2, "exactly one refresh, then the resource call");

    let refresh_req = &log[0];
    assert_eq!(refresh_req.uri().to_string(), "https://auth.example.com/token");
    let refresh_body = String::from_utf8(refresh_req.body().clone()).unwrap();
    assert!(refresh_body.contains("grant_type=refresh_token"));
    assert!(refresh_body.contains("refresh_token=RT-old"));

    let resource_req = &log[1];
    assert_eq!(
        resource_req.uri().to_string(),
        "https://api.example.com/profile"
    );
    assert_eq!(
        resource_req
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap(),
        "DPoP AT-new"
    );
    assert!(resource_req.headers().contains_key("DPoP"));

    // the refresh overwrote the durable record wholesale
    let stored = store.load_tokens("user1").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "AT-new");
    assert_eq!(stored.refresh_token.as_deref(), Some("RT-new"));
}

#[tokio::test]
async fn expired_token_without_refresh_token_fails_without_io() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens("user1", &expired_record(None))
        .await
        .unwrap();

    let mut session = session(client.clone(), store);
    assert!(session.restore().await.unwrap());

    let err = session
        .call_protected_resource(Method::GET, "https://api.example.com/profile", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::TokenMissing("refresh")));
    assert!(client.log.lock().await.is_empty(), "no network call issued");
}

#[tokio::test]
async fn refresh_failure_leaves_the_old_record_in_place() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens("user1", &expired_record(Some("RT-old")))
        .await
        .unwrap();

    let mut session = session(client.clone(), store.clone());
    session.restore().await.unwrap();

    client
        .push(
            HttpResponse::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(serde_json::to_vec(&serde_json::json!({"error": "invalid_grant"})).unwrap())
                .unwrap(),
        )
        .await;

    let err = session
        .call_protected_resource(Method::GET, "https://api.example.com/profile", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::TokenRefresh(_)));

    // untouched in memory and in the store
    assert_eq!(session.token_record().unwrap().access_token, "AT-old");
    let stored = store.load_tokens("user1").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "AT-old");
    assert_eq!(stored.refresh_token.as_deref(), Some("RT-old"));
}

#[tokio::test]
async fn fresh_401_is_surfaced_not_retried() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens(
            "user1",
            &TokenRecord {
                access_token: "AT1".into(),
                refresh_token: Some("RT1".into()),
                expires_at: Some(Utc::now() + TimeDelta::seconds(3600)),
            },
        )
        .await
        .unwrap();

    let mut session = session(client.clone(), store);
    session.restore().await.unwrap();

    client
        .push(
            HttpResponse::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(
                    serde_json::to_vec(&serde_json::json!({"error": "invalid_token"})).unwrap(),
                )
                .unwrap(),
        )
        .await;

    let err = session
        .call_protected_resource(Method::GET, "https://api.example.com/profile", None)
        .await
        .unwrap_err();
    match err {
        OAuthError::Upstream(upstream) => {
            assert_eq!(upstream.status(), Some(StatusCode::UNAUTHORIZED));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
    assert_eq!(client.log.lock().await.len(), 1, "no retry, no refresh");
}

#[tokio::test]
async fn explicit_token_skips_the_session_record() {
    let client = Arc::new(MockClient::default());
    let mut session = session(client.clone(), MemoryTokenStore::default());

    client.push(resource_ok()).await;
    session
        .call_protected_resource(
            Method::GET,
            "https://api.example.com/profile",
            Some("AT-explicit"),
        )
        .await
        .unwrap();

    let log = client.log.lock().await;
    assert_eq!(
        log[0]
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap(),
        "DPoP AT-explicit"
    );
}

#[tokio::test]
async fn resource_url_off_the_allow_list_is_rejected_before_io() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens(
            "user1",
            &TokenRecord {
                access_token: "AT1".into(),
                refresh_token: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();

    let mut session = session(client.clone(), store);
    session.restore().await.unwrap();

    let err = session
        .call_protected_resource(Method::GET, "https://evil.example.com/exfil", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::Security(_)));
    assert!(client.log.lock().await.is_empty());
}

#[tokio::test]
async fn logout_clears_memory_and_store() {
    let client = Arc::new(MockClient::default());
    let store = MemoryTokenStore::default();
    store
        .save_tokens(
            "user1",
            &TokenRecord {
                access_token: "AT1".into(),
                refresh_token: Some("RT1".into()),
                expires_at: None,
            },
        )
        .await
        .unwrap();

    let mut session = session(client.clone(), store.clone());
    session.restore().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Unauthenticated);
    assert!(store.load_tokens("user1").await.unwrap().is_none());

    let err = session
        .call_protected_resource(Method::GET, "https://api.example.com/profile", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::TokenMissing("access")));
    assert!(client.log.lock().await.is_empty());
}
