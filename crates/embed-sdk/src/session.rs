//! Process-wide session state shared by every frame of one SDK instance.

use std::sync::Arc;

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{sanitize_host_url, AcquireSource, AuthConfig, AuthMode, GenerateSource},
    error::EmbedError,
    tokens::{next_refresh_at, CookielessTokenBundle, RefreshOutcome, SessionTokens},
};

/// How an in-flight session creation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationOutcome {
    Created,
    Failed(EmbedError),
    /// The creating frame was cancelled before its handshake finished.
    Abandoned,
}

type SharedCreation = Shared<BoxFuture<'static, CreationOutcome>>;
pub(crate) type SharedRefresh = Shared<BoxFuture<'static, ()>>;

struct PendingCreation {
    epoch: u64,
    outcome: SharedCreation,
}

struct PendingRefresh {
    epoch: u64,
    done: SharedRefresh,
}

#[derive(Default)]
struct RegistryState {
    api_host: Option<String>,
    auth: AuthMode,
    session_created: bool,
    creation: Option<PendingCreation>,
    refresh: Option<PendingRefresh>,
    bundle: Option<CookielessTokenBundle>,
    epoch: u64,
}

/// Result of [`SessionRegistry::acquire_session_lock`].
pub enum SessionLock {
    /// A session already exists; reuse it.
    Established,
    /// Another frame is creating the session.
    Follower(SessionWait),
    /// This caller creates the session and must resolve the lease.
    Leader(SessionLease),
}

pub(crate) enum RefreshLock {
    NotDue,
    Unavailable,
    /// The cached bundle belongs to a terminated session.
    Terminated,
    Pending(SharedRefresh),
}

pub struct SessionRegistry {
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn init_signed(&self, api_host: &str, auth: Option<AuthConfig>) -> Result<(), EmbedError> {
        self.configure(api_host, auth.map(AuthMode::Signed).unwrap_or_default())
    }

    pub fn init_cookieless(
        &self,
        api_host: &str,
        acquire: impl Into<AcquireSource>,
        generate: impl Into<GenerateSource>,
    ) -> Result<(), EmbedError> {
        self.configure(
            api_host,
            AuthMode::Cookieless {
                acquire: acquire.into(),
                generate: generate.into(),
            },
        )
    }

    fn configure(&self, api_host: &str, auth: AuthMode) -> Result<(), EmbedError> {
        let host = sanitize_host_url(api_host)?;
        let mut state = self.state.lock();
        check_host(&state, &host)?;
        check_auth(&state, &auth)?;
        info!(
            target = "embed.session",
            api_host = %host,
            cookieless = auth.is_cookieless(),
            "session registry initialized"
        );
        state.api_host = Some(host);
        state.auth = auth;
        Ok(())
    }

    /// Sets the api host unless a different one is already configured.
    pub fn set_api_host(&self, api_host: &str) -> Result<String, EmbedError> {
        let host = sanitize_host_url(api_host)?;
        let mut state = self.state.lock();
        check_host(&state, &host)?;
        state.api_host = Some(host.clone());
        Ok(host)
    }

    /// Sets the auth mode unless a different one is already configured.
    pub fn set_auth(&self, auth: AuthMode) -> Result<(), EmbedError> {
        let mut state = self.state.lock();
        check_auth(&state, &auth)?;
        state.auth = auth;
        Ok(())
    }

    pub fn api_host(&self) -> Option<String> {
        self.state.lock().api_host.clone()
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.state.lock().auth.clone()
    }

    pub fn is_session_created(&self) -> bool {
        self.state.lock().session_created
    }

    pub fn token_bundle(&self) -> Option<CookielessTokenBundle> {
        self.state.lock().bundle.clone()
    }

    pub fn navigation_token(&self) -> Option<String> {
        self.state
            .lock()
            .bundle
            .as_ref()
            .and_then(|bundle| bundle.navigation_token.clone())
    }

    /// Joins the in-flight session creation, or starts one.
    ///
    /// Exactly one caller at a time receives [`SessionLock::Leader`]; everyone
    /// else waits on the leader's outcome instead of issuing their own
    /// acquisition (authentication tokens are single use).
    pub fn acquire_session_lock(self: &Arc<Self>) -> SessionLock {
        let mut state = self.state.lock();
        if state.session_created {
            return SessionLock::Established;
        }
        if let Some(pending) = &state.creation {
            return SessionLock::Follower(SessionWait {
                outcome: pending.outcome.clone(),
            });
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let (tx, rx) = oneshot::channel();
        let outcome = rx
            .map(|received: Result<CreationOutcome, _>| {
                received.unwrap_or(CreationOutcome::Abandoned)
            })
            .boxed()
            .shared();
        state.creation = Some(PendingCreation { epoch, outcome });
        debug!(target = "embed.session", epoch, "session creation started");
        SessionLock::Leader(SessionLease {
            registry: Arc::clone(self),
            epoch,
            sender: Some(tx),
        })
    }

    fn finish_creation(&self, epoch: u64, outcome: &CreationOutcome) {
        let mut state = self.state.lock();
        let current = state.creation.as_ref().map(|pending| pending.epoch);
        if current != Some(epoch) {
            debug!(
                target = "embed.session",
                epoch,
                created = matches!(outcome, CreationOutcome::Created),
                "session creation finished after the session was cleared, outcome discarded"
            );
            return;
        }
        state.creation = None;
        match outcome {
            CreationOutcome::Created => {
                state.session_created = true;
                info!(target = "embed.session", epoch, "session established");
            }
            CreationOutcome::Failed(err) => {
                warn!(target = "embed.session", epoch, error = %err, "session creation failed");
            }
            CreationOutcome::Abandoned => {
                warn!(
                    target = "embed.session",
                    epoch,
                    "session creation abandoned"
                );
            }
        }
    }

    pub(crate) fn store_acquired(&self, mut bundle: CookielessTokenBundle) {
        bundle.next_refresh_at_ms = next_refresh_at(self.clock.now_ms(), bundle.min_ttl());
        debug!(
            target = "embed.session",
            next_refresh_at_ms = bundle.next_refresh_at_ms,
            "cookieless tokens cached"
        );
        self.state.lock().bundle = Some(bundle);
    }

    /// Joins the in-flight token generation, or starts one when the cached
    /// bundle is due. The due check and the slot update happen under one
    /// lock, so concurrent frames share a single generate call.
    pub(crate) fn generate_tokens_lock<F>(self: &Arc<Self>, start: F) -> RefreshLock
    where
        F: FnOnce(GenerateSource, SessionTokens) -> BoxFuture<'static, RefreshOutcome>,
    {
        let mut state = self.state.lock();
        if let Some(pending) = &state.refresh {
            return RefreshLock::Pending(pending.done.clone());
        }
        let generate = match &state.auth {
            AuthMode::Cookieless { generate, .. } => generate.clone(),
            _ => return RefreshLock::Unavailable,
        };
        let current = match &state.bundle {
            Some(bundle) if bundle.session_reference_token_ttl == Some(0) => {
                return RefreshLock::Terminated;
            }
            Some(bundle) if self.clock.now_ms() >= bundle.next_refresh_at_ms => bundle.tokens(),
            Some(_) => return RefreshLock::NotDue,
            None => return RefreshLock::Unavailable,
        };

        state.epoch += 1;
        let epoch = state.epoch;
        let registry = Arc::clone(self);
        let done = start(generate, current)
            .map(move |outcome| registry.apply_refresh(epoch, outcome))
            .boxed()
            .shared();
        state.refresh = Some(PendingRefresh {
            epoch,
            done: done.clone(),
        });
        debug!(target = "embed.session", epoch, "token generation started");
        RefreshLock::Pending(done)
    }

    fn apply_refresh(&self, epoch: u64, outcome: RefreshOutcome) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.refresh.as_ref().map(|pending| pending.epoch) != Some(epoch) {
            debug!(
                target = "embed.session",
                epoch,
                "stale token generation ignored"
            );
            return;
        }
        state.refresh = None;
        let Some(bundle) = state.bundle.as_mut() else {
            return;
        };
        match outcome {
            RefreshOutcome::Renewed(data) => {
                bundle.apply(data);
                bundle.next_refresh_at_ms = next_refresh_at(now_ms, bundle.min_ttl());
                info!(
                    target = "embed.session",
                    next_refresh_at_ms = bundle.next_refresh_at_ms,
                    "cookieless tokens renewed"
                );
            }
            RefreshOutcome::Terminated => {
                bundle.session_reference_token_ttl = Some(0);
                warn!(target = "embed.session", "cookieless session terminated");
            }
            RefreshOutcome::Invalid => {
                bundle.session_reference_token_ttl = None;
                warn!(target = "embed.session", "cookieless tokens marked invalid");
            }
        }
    }

    /// Forgets the established session and any cached or in-flight state.
    pub fn clear_session(&self) {
        let mut state = self.state.lock();
        state.session_created = false;
        let creation = state.creation.take();
        let refresh = state.refresh.take();
        state.bundle = None;
        if let Some(pending) = &creation {
            debug!(
                target = "embed.session",
                epoch = pending.epoch,
                "in-flight session creation discarded"
            );
        }
        if let Some(pending) = &refresh {
            debug!(
                target = "embed.session",
                epoch = pending.epoch,
                "in-flight token generation discarded"
            );
        }
        info!(target = "embed.session", "session cleared");
    }
}

fn check_host(state: &RegistryState, host: &str) -> Result<(), EmbedError> {
    match &state.api_host {
        Some(existing) if existing != host => Err(EmbedError::Configuration(format!(
            "not allowed to change api host from {existing} to {host}"
        ))),
        _ => Ok(()),
    }
}

fn check_auth(state: &RegistryState, auth: &AuthMode) -> Result<(), EmbedError> {
    if state.auth != AuthMode::None && state.auth != *auth {
        return Err(EmbedError::Configuration(
            "not allowed to change authentication once set".to_string(),
        ));
    }
    Ok(())
}

/// Handle held by a frame waiting on someone else's session creation.
pub struct SessionWait {
    outcome: SharedCreation,
}

impl SessionWait {
    pub async fn wait(self) -> CreationOutcome {
        self.outcome.await
    }
}

/// Obligation of the frame creating the session. Dropping it without
/// resolving marks the creation abandoned, which lets waiters retry.
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    epoch: u64,
    sender: Option<oneshot::Sender<CreationOutcome>>,
}

impl SessionLease {
    pub fn complete(mut self) {
        self.resolve(CreationOutcome::Created);
    }

    pub fn fail(mut self, err: EmbedError) {
        self.resolve(CreationOutcome::Failed(err));
    }

    fn resolve(&mut self, outcome: CreationOutcome) {
        if let Some(sender) = self.sender.take() {
            self.registry.finish_creation(self.epoch, &outcome);
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.resolve(CreationOutcome::Abandoned);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{clock::ManualClock, tokens::CookielessSessionData};

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn reinit_with_same_values_is_a_no_op() {
        let registry = registry();
        let auth = AuthConfig::new("/auth").param("role", "viewer");
        registry
            .init_signed("myhost.com", Some(auth.clone()))
            .expect("first init");
        registry
            .init_signed("https://myhost.com:443", Some(auth))
            .expect("identical init");
        assert_eq!(registry.api_host().as_deref(), Some("myhost.com"));
    }

    #[test]
    fn reinit_with_different_values_fails() {
        let registry = registry();
        registry
            .init_signed("myhost.com", Some(AuthConfig::new("/auth")))
            .expect("first init");

        let err = registry
            .init_signed("otherhost.com", Some(AuthConfig::new("/auth")))
            .expect_err("host change");
        assert!(matches!(err, EmbedError::Configuration(_)));

        let err = registry
            .init_signed("myhost.com", Some(AuthConfig::new("/other-auth")))
            .expect_err("auth change");
        assert!(matches!(err, EmbedError::Configuration(_)));

        let err = registry
            .init_cookieless("myhost.com", "/acquire", "/generate")
            .expect_err("mode change");
        assert!(matches!(err, EmbedError::Configuration(_)));
    }

    #[test]
    fn auth_may_be_set_after_a_private_init() {
        let registry = registry();
        registry.init_signed("myhost.com", None).expect("init");
        registry
            .set_auth(AuthMode::Signed(AuthConfig::new("/auth")))
            .expect("auth was unset");
    }

    #[tokio::test]
    async fn followers_share_the_leader_outcome() {
        let registry = registry();
        let lease = match registry.acquire_session_lock() {
            SessionLock::Leader(lease) => lease,
            _ => panic!("first caller leads"),
        };
        let wait = match registry.acquire_session_lock() {
            SessionLock::Follower(wait) => wait,
            _ => panic!("second caller follows"),
        };
        let follower = tokio::spawn(wait.wait());

        lease.complete();
        let outcome = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follower resolves")
            .expect("follower task");
        assert_eq!(outcome, CreationOutcome::Created);
        assert!(registry.is_session_created());
        assert!(matches!(registry.acquire_session_lock(), SessionLock::Established));
    }

    #[tokio::test]
    async fn dropped_lease_lets_a_retry_lead() {
        let registry = registry();
        let lease = match registry.acquire_session_lock() {
            SessionLock::Leader(lease) => lease,
            _ => panic!("first caller leads"),
        };
        let wait = match registry.acquire_session_lock() {
            SessionLock::Follower(wait) => wait,
            _ => panic!("second caller follows"),
        };
        drop(lease);

        assert_eq!(wait.wait().await, CreationOutcome::Abandoned);
        assert!(!registry.is_session_created());
        assert!(matches!(registry.acquire_session_lock(), SessionLock::Leader(_)));
    }

    #[tokio::test]
    async fn failed_creation_is_shared_and_cleared() {
        let registry = registry();
        let lease = match registry.acquire_session_lock() {
            SessionLock::Leader(lease) => lease,
            _ => panic!("first caller leads"),
        };
        let wait = match registry.acquire_session_lock() {
            SessionLock::Follower(wait) => wait,
            _ => panic!("second caller follows"),
        };
        let err = EmbedError::transport("signing failed", "Forbidden");
        lease.fail(err.clone());

        assert_eq!(wait.wait().await, CreationOutcome::Failed(err));
        assert!(matches!(registry.acquire_session_lock(), SessionLock::Leader(_)));
    }

    #[tokio::test]
    async fn refresh_is_skipped_until_due() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = SessionRegistry::new(clock.clone());
        registry
            .init_cookieless("myhost.com", "/acquire", "/generate")
            .expect("init");
        registry.store_acquired(CookielessTokenBundle {
            api_token: Some("api".into()),
            api_token_ttl: Some(600),
            navigation_token: Some("nav".into()),
            navigation_token_ttl: Some(600),
            session_reference_token_ttl: Some(150),
            next_refresh_at_ms: 0,
        });

        let not_due =
            registry.generate_tokens_lock(|_, _| async { RefreshOutcome::Invalid }.boxed());
        assert!(matches!(not_due, RefreshLock::NotDue));

        clock.advance(Duration::from_secs(30));
        let renewed = renewed_data();
        let pending = registry.generate_tokens_lock(move |_, current| {
            assert_eq!(current.api_token.as_deref(), Some("api"));
            async move { RefreshOutcome::Renewed(renewed) }.boxed()
        });
        let RefreshLock::Pending(done) = pending else {
            panic!("due refresh starts");
        };
        done.await;

        let bundle = registry.token_bundle().expect("bundle");
        assert_eq!(bundle.api_token.as_deref(), Some("api-2"));
        assert_eq!(bundle.next_refresh_at_ms, 30_000 + 3_480_000);
    }

    fn renewed_data() -> CookielessSessionData {
        CookielessSessionData {
            api_token: Some("api-2".into()),
            api_token_ttl: Some(3_600),
            navigation_token: Some("nav-2".into()),
            navigation_token_ttl: Some(3_600),
            session_reference_token_ttl: Some(7_200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn terminated_bundle_is_never_refreshed() {
        let registry = registry();
        registry
            .init_cookieless("myhost.com", "/acquire", "/generate")
            .expect("init");
        registry.store_acquired(CookielessTokenBundle {
            api_token: Some("api".into()),
            api_token_ttl: Some(30),
            navigation_token: Some("nav".into()),
            navigation_token_ttl: Some(30),
            session_reference_token_ttl: Some(30),
            next_refresh_at_ms: 0,
        });
        let pending =
            registry.generate_tokens_lock(|_, _| async { RefreshOutcome::Terminated }.boxed());
        let RefreshLock::Pending(done) = pending else {
            panic!("due refresh starts");
        };
        done.await;

        let again = registry.generate_tokens_lock(|_, _| {
            panic!("terminated sessions do not generate");
        });
        assert!(matches!(again, RefreshLock::Terminated));
    }

    #[tokio::test]
    async fn clearing_discards_an_in_flight_creation() {
        let registry = registry();
        let lease = match registry.acquire_session_lock() {
            SessionLock::Leader(lease) => lease,
            _ => panic!("first caller leads"),
        };
        let wait = match registry.acquire_session_lock() {
            SessionLock::Follower(wait) => wait,
            _ => panic!("second caller follows"),
        };
        registry.clear_session();
        lease.complete();

        assert_eq!(wait.wait().await, CreationOutcome::Created);
        assert!(!registry.is_session_created());
        assert!(matches!(registry.acquire_session_lock(), SessionLock::Leader(_)));
    }

    #[test]
    fn clear_session_forgets_everything() {
        let registry = registry();
        match registry.acquire_session_lock() {
            SessionLock::Leader(lease) => lease.complete(),
            _ => panic!("first caller leads"),
        }
        registry.store_acquired(CookielessTokenBundle::default());
        registry.clear_session();
        assert!(!registry.is_session_created());
        assert!(registry.token_bundle().is_none());
    }
}
