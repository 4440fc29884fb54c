use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::request::Request;
use crate::response::Response;
use crate::session::Session;
use crate::util::{lock_unpoisoned, read_unpoisoned, redact_uri_for_logs, write_unpoisoned};

/// Injects credentials into a request right before it is dispatched.
pub trait AuthorizationProvider: Send + Sync {
    fn attach_authorization(&self, request: &mut Request);
}

/// Sends `Authorization: Bearer <token>` while a token is set.
#[derive(Debug, Default)]
pub struct TokenAuthorizationProvider {
    token: RwLock<Option<String>>,
}

impl TokenAuthorizationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *write_unpoisoned(&self.token) = token;
    }

    pub fn token(&self) -> Option<String> {
        read_unpoisoned(&self.token).clone()
    }
}

impl AuthorizationProvider for TokenAuthorizationProvider {
    fn attach_authorization(&self, request: &mut Request) {
        let Some(token) = self.token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(error) => {
                warn!(error = %error, "bearer token is not a valid header value");
            }
        }
    }
}

/// Decides when credentials must be refreshed and how.
pub trait AuthorizationPolicy: Send + Sync {
    /// Checked before every request.
    fn is_renewal_needed(&self) -> bool {
        false
    }

    /// `Ok(true)` when credentials were refreshed, `Ok(false)` when nothing was attempted.
    fn renew(&self) -> BoxFuture<'static, Result<bool>> {
        ready(Ok(false)).boxed()
    }

    fn should_renew(&self, error: &Error) -> bool {
        error.code() == ErrorCode::AuthorizationNeeded
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRenewal;

impl AuthorizationPolicy for NoRenewal {}

#[derive(Default)]
struct RenewalState {
    cycle: Mutex<RenewalCycle>,
    renewals: AtomicU64,
}

#[derive(Default)]
struct RenewalCycle {
    renewing: bool,
    listeners: Vec<oneshot::Sender<Result<bool>>>,
}

/// Wraps a [`Session`] with authorization renewal.
///
/// Concurrent callers that need renewal share a single in-flight renewal. Every caller waiting on
/// it is resumed once, in the order it joined, and a request is retried at most once.
#[derive(Clone)]
pub struct RemoteApi {
    session: Session,
    policy: Arc<dyn AuthorizationPolicy>,
    renewal: Arc<RenewalState>,
}

impl RemoteApi {
    pub fn new(session: Session, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self {
            session,
            policy,
            renewal: Arc::new(RenewalState::default()),
        }
    }

    pub fn without_renewal(session: Session) -> Self {
        Self::new(session, Arc::new(NoRenewal))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn policy(&self) -> &Arc<dyn AuthorizationPolicy> {
        &self.policy
    }

    /// Number of renewal operations started so far.
    pub fn renewal_count(&self) -> u64 {
        self.renewal.renewals.load(Ordering::Relaxed)
    }

    pub fn is_renewing(&self) -> bool {
        lock_unpoisoned(&self.renewal.cycle).renewing
    }

    pub async fn execute_request(&self, request: Request) -> Response {
        let started_at = Instant::now();
        if self.policy.is_renewal_needed() {
            if let Err(error) = self.renew(&request).await {
                return Response::failed(request, error, started_at.elapsed());
            }
        }

        let response = self.session.send(request.clone()).await;
        let needs_renewal = response
            .error()
            .is_some_and(|error| self.policy.should_renew(error));
        if !needs_renewal {
            return response;
        }

        match self.renew(&request).await {
            Ok(true) => {
                debug!(
                    uri = %redact_uri_for_logs(request.url()),
                    "retrying request after authorization renewal"
                );
                self.session.send(request).await
            }
            Ok(false) => response,
            Err(error) => Response::failed(request, error, started_at.elapsed()),
        }
    }

    /// Dispatches without any authorization checks.
    pub async fn execute_one_request(&self, request: Request) -> Response {
        self.session.send(request).await
    }

    pub fn cancel_all(&self) {
        self.session.cancel_all();
    }

    async fn renew(&self, request: &Request) -> Result<bool> {
        let (sender, receiver) = oneshot::channel();
        let start = {
            let mut cycle = lock_unpoisoned(&self.renewal.cycle);
            cycle.listeners.push(sender);
            !std::mem::replace(&mut cycle.renewing, true)
        };

        if start {
            self.renewal.renewals.fetch_add(1, Ordering::Relaxed);
            debug!("starting authorization renewal");
            let renewing = self.policy.renew();
            let renewal = Arc::clone(&self.renewal);
            let session = self.session.clone();
            tokio::spawn(async move {
                let outcome = renewing.await;
                if let Err(error) = &outcome {
                    warn!(error = %error, code = error.code().as_str(), "authorization renewal failed");
                }
                session.record_renewal(&outcome);

                let listeners = {
                    let mut cycle = lock_unpoisoned(&renewal.cycle);
                    cycle.renewing = false;
                    std::mem::take(&mut cycle.listeners)
                };
                for listener in listeners {
                    let _ = listener.send(outcome.clone());
                }
            });
        } else {
            debug!("joined authorization renewal in progress");
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::unknown(
                request.method(),
                &request.full_url(),
                "authorization renewal ended without a result",
            )),
        }
    }
}

impl std::fmt::Debug for RemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteApi")
            .field("session", &self.session)
            .field("renewals", &self.renewal_count())
            .finish_non_exhaustive()
    }
}
