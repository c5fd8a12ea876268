//! Authenticated request coordinator.
//!
//! [`Coordinator`] attaches the session's bearer token to outbound calls and
//! recovers from one failure class: the server's expired-credential signal.
//!
//! # Recovery
//!
//! A request issued while a refresh is in flight is not sent; it joins the
//! queue and goes out once the refresh settles.
//!
//! When a first-pass request comes back expired:
//!
//! 1. If a refresh succeeded after the request was sent, the request is
//!    replayed with the new token.
//! 2. Otherwise the request is admitted to the [`RefreshGate`]. The first
//!    caller leads the refresh; everyone after it is queued.
//! 3. On success the new token is persisted, queued requests are replayed in
//!    arrival order, and the leader replays its own request.
//! 4. On failure the session is cleared and the leader plus every queued
//!    request fail with [`RequestError::AuthExpired`].
//!
//! Replays run at [`Attempt::next`], so a replay that comes back expired
//! again fails immediately instead of refreshing a second time. If the
//! leading future is dropped mid-refresh, queued requests fail with
//! [`RequestError::Interrupted`] and the session is left untouched.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use hydrant_core::{ApiRequest, Coordinator};
//!
//! let config = hydrant_core::config::load_config()?;
//! let coordinator = Coordinator::from_config(&config)?;
//!
//! coordinator.login("operator", "hunter2").await?;
//! let assets = coordinator.send(ApiRequest::get("/api/assets")).await?;
//! println!("{}", assets.text());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ClientConfig, ExpiredSignal};
use crate::error::{HydrantError, RequestError};
use crate::model::{ApiRequest, ApiResponse};
use crate::refresh::{Admission, Attempt, RefreshGate};
use crate::session::{Credential, Session};
use crate::store::{Secret, StoreError, create_store};
use crate::transport::{PreparedRequest, ReqwestTransport, Transport, TransportError};

type SendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Reply = Result<ApiResponse, RequestError>;

/// A request parked behind an in-flight refresh.
#[derive(Debug)]
struct PendingRequest {
    request: ApiRequest,
    replay: Attempt,
    reply: oneshot::Sender<Reply>,
}

/// Whether a first-pass request may go out now.
enum CheckIn {
    /// No refresh in flight; send, remembering the gate generation.
    Clear { request: ApiRequest, generation: u64 },

    /// Parked behind the in-flight refresh.
    Held(oneshot::Receiver<Reply>),
}

/// Why a refresh did not produce a new access token.
#[derive(Debug, Error)]
enum RefreshFailure {
    #[error("no refresh token stored")]
    NoRefreshToken,

    #[error("refresh endpoint returned {0}")]
    Rejected(reqwest::StatusCode),

    #[error("refresh endpoint unreachable: {0}")]
    Transport(#[from] TransportError),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("credential storage failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct RefreshRequestBody<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponseBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct LoginRequestBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponseBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// HTTP client wrapper with transparent credential refresh.
///
/// Cheap to clone; clones share the session, transport and refresh gate.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    session: Session,
    transport: Arc<dyn Transport>,
    base_url: Url,
    login_path: String,
    refresh_path: String,
    expired_signal: ExpiredSignal,
    refresh_timeout: Option<Duration>,
    gate: Mutex<RefreshGate<PendingRequest>>,
    refresh_calls: AtomicU64,
}

impl Coordinator {
    /// Create a coordinator over an explicit session and transport.
    ///
    /// Only the endpoint, signal and timeout settings of `config` are used;
    /// the store and transport come from the arguments.
    pub fn new(session: Session, transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        let mut base_url = config.base_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            inner: Arc::new(Inner {
                session,
                transport,
                base_url,
                login_path: config.login_path.clone(),
                refresh_path: config.refresh_path.clone(),
                expired_signal: config.expired_signal.clone(),
                refresh_timeout: config.refresh_timeout(),
                gate: Mutex::new(RefreshGate::new()),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Build the configured store and a `reqwest` transport.
    pub fn from_config(config: &ClientConfig) -> Result<Self, HydrantError> {
        let store = create_store(&config.store)?;
        let session = Session::new(Arc::from(store), config.namespace.clone());
        let transport = match config.request_timeout() {
            Some(timeout) => ReqwestTransport::with_timeout(timeout),
            None => ReqwestTransport::new(),
        };
        Ok(Self::new(session, Arc::new(transport), config))
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Number of calls made to the refresh endpoint so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.gate.lock().is_refreshing()
    }

    /// Number of requests waiting on the in-flight refresh.
    pub fn queued(&self) -> usize {
        self.inner.gate.lock().queued()
    }

    /// Send an authenticated request.
    ///
    /// Fails with [`RequestError::Network`] when no response arrives,
    /// [`RequestError::AuthExpired`] when the credential could not be
    /// recovered, and [`RequestError::Server`] for any other non-2xx status.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        if request.skip_auth {
            return Err(RequestError::InvalidRequest {
                message: format!(
                    "{} {} bypasses authentication; use send_unauthenticated",
                    request.method, request.path
                ),
            });
        }
        self.inner.dispatch(request, Attempt::FIRST).await
    }

    /// Send a request with no credential and no refresh handling.
    pub async fn send_unauthenticated(
        &self,
        request: ApiRequest,
    ) -> Result<ApiResponse, RequestError> {
        let prepared = self.inner.prepare(&request, None)?;
        debug!(request_id = %request.id, method = %request.method, path = %request.path, "Sending unauthenticated request");

        let response = self.inner.transport.execute(prepared).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(server_error(response))
        }
    }

    /// `GET` a path and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    /// `POST` a JSON body and decode the JSON response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        self.send(ApiRequest::post(path).with_json(body)?)
            .await?
            .json()
    }

    /// Exchange a username and password for a credential and store it.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential, RequestError> {
        let request = ApiRequest::post(self.inner.login_path.clone())
            .with_json(&LoginRequestBody { username, password })?
            .skip_auth();

        let response = self.send_unauthenticated(request).await?;
        let body: LoginResponseBody = response.json()?;

        let mut credential = Credential::new(body.access_token).with_username(username);
        if let Some(refresh_token) = body.refresh_token {
            credential = credential.with_refresh_token(refresh_token);
        }
        self.inner.session.store_credential(&credential).await?;

        info!(namespace = %self.inner.session.namespace(), username, "Logged in");
        Ok(credential)
    }

    /// Forget the stored credential.
    pub async fn logout(&self) -> Result<(), RequestError> {
        self.inner.session.clear().await?;
        info!(namespace = %self.inner.session.namespace(), "Logged out");
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("session", &self.inner.session)
            .field("base_url", &self.inner.base_url.as_str())
            .field("refresh_calls", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn endpoint(&self, path: &str) -> Result<Url, RequestError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| RequestError::InvalidRequest {
                message: format!("invalid path {:?}: {}", path, e),
            })
    }

    fn prepare(
        &self,
        request: &ApiRequest,
        token: Option<&Secret>,
    ) -> Result<PreparedRequest, RequestError> {
        let mut headers = request.headers.clone();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|_| RequestError::InvalidRequest {
                    message: "stored access token is not a valid header value".to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(PreparedRequest {
            method: request.method.clone(),
            url: self.endpoint(&request.path)?,
            headers,
            body: request.body.clone(),
        })
    }

    /// Park a first-pass request if a refresh is in flight, otherwise record
    /// the generation it is about to be sent under. Replays skip the queue.
    fn check_in(&self, request: ApiRequest, attempt: Attempt) -> CheckIn {
        let mut gate = self.gate.lock();
        if attempt != Attempt::FIRST {
            return CheckIn::Clear {
                request,
                generation: gate.generation(),
            };
        }

        let (reply, receiver) = oneshot::channel();
        let pending = PendingRequest {
            request,
            replay: attempt.next(),
            reply,
        };
        match gate.enqueue(pending) {
            Ok(()) => CheckIn::Held(receiver),
            Err(pending) => CheckIn::Clear {
                request: pending.request,
                generation: gate.generation(),
            },
        }
    }

    fn is_expired_signal(&self, response: &ApiResponse) -> bool {
        response.status.as_u16() == self.expired_signal.status
            && response.json_field(&self.expired_signal.field).as_deref()
                == Some(self.expired_signal.marker.as_str())
    }

    /// One pass of a request. Boxed because recovery re-enters it.
    fn dispatch(self: &Arc<Self>, request: ApiRequest, attempt: Attempt) -> SendFuture<'_, Reply> {
        Box::pin(async move {
            let (request, generation) = match self.check_in(request, attempt) {
                CheckIn::Clear {
                    request,
                    generation,
                } => (request, generation),
                CheckIn::Held(receiver) => {
                    debug!(attempt = attempt.number(), "Refresh in flight, request held");
                    return settled(receiver).await;
                }
            };

            // Read at send time so a replay picks up the refreshed token.
            let token = self.session.access_token().await?;
            let prepared = self.prepare(&request, token.as_ref())?;

            debug!(
                request_id = %request.id,
                method = %request.method,
                path = %request.path,
                attempt = attempt.number(),
                "Sending request"
            );

            let response = match self.transport.execute(prepared).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "Request failed in transport");
                    return Err(e.into());
                }
            };

            if response.is_success() {
                return Ok(response);
            }
            if !self.is_expired_signal(&response) {
                return Err(server_error(response));
            }
            if !attempt.may_refresh() {
                warn!(request_id = %request.id, "Credential rejected again after refresh");
                if let Err(e) = self.session.clear().await {
                    warn!(error = %e, "Failed to clear rejected credential");
                }
                return Err(RequestError::AuthExpired {
                    message: "credential rejected after refresh".to_string(),
                });
            }

            debug!(request_id = %request.id, "Access token expired");
            self.recover(request, attempt.next(), generation).await
        })
    }

    async fn recover(self: &Arc<Self>, request: ApiRequest, replay: Attempt, seen: u64) -> Reply {
        let (reply, receiver) = oneshot::channel();
        let pending = PendingRequest {
            request,
            replay,
            reply,
        };

        let admission = self.gate.lock().admit(pending, seen);
        match admission {
            Admission::Superseded(pending) => {
                debug!(request_id = %pending.request.id, "Token already refreshed, replaying");
                self.dispatch(pending.request, replay).await
            }
            Admission::Queued => {
                debug!("Refresh in flight, request queued");
                settled(receiver).await
            }
            Admission::Leader(pending) => self.lead_refresh(pending.request, replay).await,
        }
    }

    async fn lead_refresh(self: &Arc<Self>, request: ApiRequest, replay: Attempt) -> Reply {
        let guard = RefreshGuard {
            inner: &**self,
            armed: true,
        };

        match self.refresh_credential().await {
            Ok(()) => {
                let queued = guard.succeed();
                info!(queued = queued.len(), "Access token refreshed");
                for pending in queued {
                    self.spawn_replay(pending);
                }
                self.dispatch(request, replay).await
            }
            Err(failure) => {
                warn!(error = %failure, "Token refresh failed, clearing session");
                if let Err(e) = self.session.clear().await {
                    warn!(error = %e, "Failed to clear session after refresh failure");
                }

                let error = RequestError::AuthExpired {
                    message: failure.to_string(),
                };
                for pending in guard.fail() {
                    let _ = pending.reply.send(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    fn spawn_replay(self: &Arc<Self>, pending: PendingRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let PendingRequest {
                request,
                replay,
                reply,
            } = pending;
            let result = inner.dispatch(request, replay).await;
            // The caller may have gone away; nothing to do then.
            let _ = reply.send(result);
        });
    }

    async fn refresh_credential(&self) -> Result<(), RefreshFailure> {
        let refresh_token = self
            .session
            .refresh_token()
            .await?
            .ok_or(RefreshFailure::NoRefreshToken)?;

        let url = self
            .endpoint(&self.refresh_path)
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
        let body = serde_json::to_value(RefreshRequestBody {
            token: refresh_token.expose(),
        })
        .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        debug!(url = %url, "Calling refresh endpoint");

        let call = self.transport.execute(PreparedRequest {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(body),
        });
        let response = match self.refresh_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RefreshFailure::TimedOut(limit))??,
            None => call.await?,
        };

        if !response.is_success() {
            return Err(RefreshFailure::Rejected(response.status));
        }

        let body: RefreshResponseBody = response
            .json()
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
        self.session
            .replace_access_token(&body.access_token, body.refresh_token.as_deref())
            .await?;

        Ok(())
    }
}

/// Keeps the gate from staying in `Refreshing` if the leading future is
/// dropped before the refresh settles.
struct RefreshGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn succeed(mut self) -> Vec<PendingRequest> {
        self.armed = false;
        self.inner.gate.lock().drain_success()
    }

    fn fail(mut self) -> Vec<PendingRequest> {
        self.armed = false;
        self.inner.gate.lock().drain_failure()
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let queued = self.inner.gate.lock().drain_failure();
        warn!(queued = queued.len(), "Refresh abandoned, rejecting queued requests");
        for pending in queued {
            let _ = pending.reply.send(Err(abandoned()));
        }
    }
}

async fn settled(receiver: oneshot::Receiver<Reply>) -> Reply {
    match receiver.await {
        Ok(reply) => reply,
        Err(_) => Err(abandoned()),
    }
}

fn abandoned() -> RequestError {
    RequestError::Interrupted {
        message: "refresh abandoned before completing".to_string(),
    }
}

fn server_error(response: ApiResponse) -> RequestError {
    RequestError::Server {
        status: response.status,
        body: response.text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SecretStore};
    use async_trait::async_trait;
    use reqwest::StatusCode;

    /// Transport that answers from a closure and records what it saw.
    struct ScriptedTransport<F> {
        respond: F,
        seen: Mutex<Vec<PreparedRequest>>,
    }

    #[async_trait]
    impl<F> Transport for ScriptedTransport<F>
    where
        F: Fn(&PreparedRequest) -> Result<ApiResponse, TransportError> + Send + Sync,
    {
        async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
            let result = (self.respond)(&request);
            self.seen.lock().push(request);
            result
        }
    }

    fn scripted<F>(respond: F) -> Arc<ScriptedTransport<F>>
    where
        F: Fn(&PreparedRequest) -> Result<ApiResponse, TransportError> + Send + Sync,
    {
        Arc::new(ScriptedTransport {
            respond,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn coordinator_with(transport: Arc<dyn Transport>) -> Coordinator {
        let session = Session::with_store(Arc::new(MemoryStore::new()));
        let config = ClientConfig::for_base_url(Url::parse("http://api.test/v1").unwrap());
        Coordinator::new(session, transport, &config)
    }

    fn bearer(request: &PreparedRequest) -> Option<&str> {
        request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_attaches_single_bearer_header() {
        let transport = scripted(|_| Ok(ApiResponse::new(StatusCode::OK, "[]")));
        let coordinator = coordinator_with(transport.clone());
        coordinator
            .session()
            .store_credential(&Credential::new("tok-1"))
            .await
            .unwrap();

        let request = ApiRequest::get("/assets").with_header(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer caller-supplied"),
        );
        coordinator.send(request).await.unwrap();

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].headers.get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(bearer(&seen[0]), Some("Bearer tok-1"));
        assert_eq!(seen[0].url.as_str(), "http://api.test/v1/assets");
    }

    #[tokio::test]
    async fn test_no_credential_sends_without_header() {
        let transport = scripted(|_| Ok(ApiResponse::new(StatusCode::OK, "")));
        let coordinator = coordinator_with(transport.clone());

        coordinator.send(ApiRequest::get("/public")).await.unwrap();

        assert_eq!(bearer(&transport.seen.lock()[0]), None);
    }

    #[tokio::test]
    async fn test_skip_auth_request_is_rejected_by_send() {
        let transport = scripted(|_| Ok(ApiResponse::new(StatusCode::OK, "")));
        let coordinator = coordinator_with(transport.clone());

        let result = coordinator.send(ApiRequest::get("/x").skip_auth()).await;

        assert!(matches!(result, Err(RequestError::InvalidRequest { .. })));
        assert!(transport.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_plain_401_is_server_error_without_refresh() {
        let transport = scripted(|_| {
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"message":"invalid signature"}"#,
            ))
        });
        let coordinator = coordinator_with(transport.clone());
        coordinator
            .session()
            .store_credential(&Credential::new("a").with_refresh_token("r"))
            .await
            .unwrap();

        let result = coordinator.send(ApiRequest::get("/assets")).await;

        match result {
            Err(RequestError::Server { status, body }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("invalid signature"));
            }
            other => panic!("expected Server error, got {:?}", other),
        }
        assert_eq!(coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error_without_refresh() {
        let transport = scripted(|_| {
            Err(TransportError::Connect {
                message: "refused".to_string(),
            })
        });
        let coordinator = coordinator_with(transport);
        coordinator
            .session()
            .store_credential(&Credential::new("a").with_refresh_token("r"))
            .await
            .unwrap();

        let result = coordinator.send(ApiRequest::get("/assets")).await;

        assert!(matches!(result, Err(RequestError::Network { .. })));
        assert_eq!(coordinator.refresh_count(), 0);
        assert!(coordinator.session().credential().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_clears_session() {
        let transport = scripted(|_| {
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"message":"jwt expired"}"#,
            ))
        });
        let coordinator = coordinator_with(transport.clone());
        coordinator
            .session()
            .store_credential(&Credential::new("stale"))
            .await
            .unwrap();

        let result = coordinator.send(ApiRequest::get("/assets")).await;

        assert!(matches!(result, Err(RequestError::AuthExpired { .. })));
        assert_eq!(coordinator.refresh_count(), 0);
        assert_eq!(transport.seen.lock().len(), 1);
        assert!(coordinator.session().credential().await.unwrap().is_none());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_and_replay_with_scripted_transport() {
        let transport = scripted(|request| {
            if request.url.path() == "/v1/auth/refresh" {
                assert_eq!(
                    request.body,
                    Some(serde_json::json!({"token": "refresh-1"}))
                );
                return Ok(ApiResponse::new(
                    StatusCode::OK,
                    r#"{"accessToken":"fresh"}"#,
                ));
            }
            match bearer(request) {
                Some("Bearer fresh") => Ok(ApiResponse::new(StatusCode::OK, r#"{"id":7}"#)),
                _ => Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"message":"jwt expired"}"#,
                )),
            }
        });
        let coordinator = coordinator_with(transport.clone());
        coordinator
            .session()
            .store_credential(&Credential::new("stale").with_refresh_token("refresh-1"))
            .await
            .unwrap();

        let response = coordinator.send(ApiRequest::get("/assets/7")).await.unwrap();

        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["id"], 7);
        assert_eq!(coordinator.refresh_count(), 1);

        let seen = transport.seen.lock();
        let paths: Vec<&str> = seen.iter().map(|r| r.url.path()).collect();
        assert_eq!(paths, vec!["/v1/assets/7", "/v1/auth/refresh", "/v1/assets/7"]);
        assert_eq!(bearer(&seen[1]), None);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_gate() {
        let coordinator = coordinator_with(scripted(|_| Ok(ApiResponse::new(StatusCode::OK, ""))));

        let (reply, receiver) = oneshot::channel();
        {
            let inner: &Inner = &coordinator.inner;
            assert!(inner.gate.lock().try_begin());
            inner
                .gate
                .lock()
                .enqueue(PendingRequest {
                    request: ApiRequest::get("/queued"),
                    replay: Attempt::FIRST.next(),
                    reply,
                })
                .unwrap();

            let guard = RefreshGuard { inner, armed: true };
            drop(guard);
        }

        assert!(!coordinator.is_refreshing());
        assert!(matches!(
            receiver.await.unwrap(),
            Err(RequestError::Interrupted { .. })
        ));
        assert!(coordinator.session().credential().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_issued_during_refresh_is_held() {
        let transport = scripted(|request| match bearer(request) {
            Some("Bearer fresh") => Ok(ApiResponse::new(StatusCode::OK, "ok")),
            _ => Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"message":"jwt expired"}"#,
            )),
        });
        let coordinator = coordinator_with(transport.clone());
        coordinator
            .session()
            .store_credential(&Credential::new("stale").with_refresh_token("r"))
            .await
            .unwrap();
        assert!(coordinator.inner.gate.lock().try_begin());

        let held = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.send(ApiRequest::get("/held")).await }
        });
        while coordinator.queued() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(transport.seen.lock().is_empty());

        coordinator
            .session()
            .replace_access_token("fresh", None)
            .await
            .unwrap();
        let queued = coordinator.inner.gate.lock().drain_success();
        for pending in queued {
            coordinator.inner.spawn_replay(pending);
        }

        assert_eq!(held.await.unwrap().unwrap().text(), "ok");
        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(bearer(&seen[0]), Some("Bearer fresh"));
    }

    /// Store whose reads yield after fetching, so other tasks can run
    /// between a read and whatever the reader does next.
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl SecretStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
            let value = self.0.get(key).await;
            tokio::task::yield_now().await;
            value
        }

        async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
            self.0.set(key, secret).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.0.list_keys(prefix).await
        }
    }

    /// Expires the stale token and delays responses for `/b` by `lag`
    /// scheduler turns.
    struct LaggingTransport {
        lag: usize,
    }

    #[async_trait]
    impl Transport for LaggingTransport {
        async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
            if request.url.path() == "/v1/b" {
                for _ in 0..self.lag {
                    tokio::task::yield_now().await;
                }
            }
            if request.url.path() == "/v1/auth/refresh" {
                return Ok(ApiResponse::new(
                    StatusCode::OK,
                    r#"{"accessToken":"fresh"}"#,
                ));
            }
            match bearer(&request) {
                Some("Bearer fresh") => Ok(ApiResponse::new(StatusCode::OK, "ok")),
                _ => Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"message":"jwt expired"}"#,
                )),
            }
        }
    }

    #[tokio::test]
    async fn test_late_expiry_never_starts_second_refresh() {
        for lag in 0..8 {
            let session = Session::with_store(Arc::new(YieldingStore(MemoryStore::new())));
            session
                .store_credential(&Credential::new("stale").with_refresh_token("r"))
                .await
                .unwrap();
            let config = ClientConfig::for_base_url(Url::parse("http://api.test/v1").unwrap());
            let coordinator = Coordinator::new(session, Arc::new(LaggingTransport { lag }), &config);

            let a = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.send(ApiRequest::get("/a")).await }
            });
            let b = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.send(ApiRequest::get("/b")).await }
            });

            assert!(a.await.unwrap().is_ok(), "lag {}", lag);
            assert!(b.await.unwrap().is_ok(), "lag {}", lag);
            assert_eq!(coordinator.refresh_count(), 1, "lag {}", lag);
            assert!(!coordinator.is_refreshing());
        }
    }

    #[test]
    fn test_base_url_gains_trailing_slash() {
        let coordinator = coordinator_with(scripted(|_| Ok(ApiResponse::new(StatusCode::OK, ""))));
        assert_eq!(coordinator.inner.base_url.as_str(), "http://api.test/v1/");
        assert_eq!(
            coordinator.inner.endpoint("/auth/refresh").unwrap().as_str(),
            "http://api.test/v1/auth/refresh"
        );
    }
}
