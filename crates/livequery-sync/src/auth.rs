//! # Authentication Manager
//!
//! Fetches tokens, decides when the server has accepted them, refreshes
//! JWTs before they expire and recovers from `AuthError`.
//!
//! ## Auth States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Auth States                                    │
//! │                                                                         │
//! │  set_auth ──► FetchingToken ── Some(token) ──► AwaitingCached           │
//! │                     │                               │                   │
//! │                   None                    Transition advances identity  │
//! │                     ▼                               ▼                   │
//! │                  NoAuth ◄── None ──┐          Authenticated             │
//! │                                    │                │                   │
//! │                          refetch (force=true) ◄─────┤ AuthError or      │
//! │                                    │                │ refresh timer     │
//! │                               Some(token)           │                   │
//! │                                    ▼                │                   │
//! │                            AwaitingFresh ───────────┘                   │
//! │                              │  AuthError again                         │
//! │                              ▼                                          │
//! │                  NoAuth, on_change(false), reconnect                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager never touches the connection or the protocol state itself.
//! It returns an [`AuthAction`] and the worker carries it out.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use jsonwebtoken::{decode, DecodingKey, Validation};
use livequery_core::{AuthToken, TokenType};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Arguments handed to the token fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchTokenArgs {
    /// The cached token was rejected or is about to expire; get a new one.
    pub force_refresh_token: bool,
}

/// Produces a token, or `None` when the user is signed out.
pub type TokenFetcher =
    Arc<dyn Fn(FetchTokenArgs) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Told whether the server currently accepts the caller's credentials.
pub type AuthChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    NoAuth,
    FetchingToken,
    AwaitingCachedConfirmation,
    AwaitingFreshConfirmation,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    /// First fetch after `set_auth`.
    Initial,
    /// Scheduled refresh ahead of expiry.
    Refresh,
    /// Refetch after the server rejected the token.
    Recovery,
}

/// A fetch finished.
#[derive(Debug)]
pub struct AuthEvent {
    pub epoch: u64,
    pub purpose: FetchPurpose,
    pub token: Option<String>,
}

/// What the worker must do after an auth transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    None,
    /// Send the token on the live connection (or the next handshake).
    Install(AuthToken),
    /// Drop the connection and wait for the refetch.
    Disconnect,
    /// Reconnect and authenticate with this token.
    ReconnectWith(AuthToken),
    /// Forget credentials and reconnect unauthenticated.
    ClearAndReconnect,
    /// Forget credentials on the live connection.
    Clear,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

pub struct AuthenticationManager {
    state: AuthState,
    fetcher: Option<(TokenFetcher, TokenType)>,
    on_change: Option<AuthChangeCallback>,
    epoch: u64,
    reported_authenticated: bool,
    refresh_at: Option<Instant>,
    refresh_leeway: Duration,
    paused: bool,
    events_tx: mpsc::UnboundedSender<AuthEvent>,
}

impl AuthenticationManager {
    pub fn new(refresh_leeway: Duration, events_tx: mpsc::UnboundedSender<AuthEvent>) -> Self {
        Self {
            state: AuthState::NoAuth,
            fetcher: None,
            on_change: None,
            epoch: 0,
            reported_authenticated: false,
            refresh_at: None,
            refresh_leeway,
            paused: false,
            events_tx,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Outbound traffic is held while the first token is fetched.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// What the caller was last told through `on_change`.
    pub fn is_authenticated(&self) -> bool {
        self.reported_authenticated
    }

    /// When the scheduled refresh is due.
    pub fn refresh_at(&self) -> Option<Instant> {
        self.refresh_at
    }

    // =========================================================================
    // Caller Operations
    // =========================================================================

    /// Replaces the fetcher and starts the first fetch. The new `on_change`
    /// hears `true` once its own token is confirmed, even if the previous
    /// one was already authenticated.
    pub fn set_auth(
        &mut self,
        fetcher: TokenFetcher,
        token_type: TokenType,
        on_change: AuthChangeCallback,
    ) {
        self.epoch += 1;
        self.fetcher = Some((fetcher, token_type));
        self.reported_authenticated = false;
        self.on_change = Some(on_change);
        self.refresh_at = None;
        self.state = AuthState::FetchingToken;
        self.paused = true;
        self.fetch(FetchPurpose::Initial, false);
    }

    /// Drops the fetcher. `on_change` is kept so the server-confirmed
    /// logout can still be reported.
    pub fn clear_auth(&mut self) {
        self.epoch += 1;
        self.fetcher = None;
        self.refresh_at = None;
        self.paused = false;
        self.state = AuthState::NoAuth;
        debug!("Auth cleared");
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn on_token_fetched(&mut self, event: AuthEvent) -> AuthAction {
        if event.epoch != self.epoch {
            debug!(epoch = event.epoch, current = self.epoch, "Discarding stale token");
            return AuthAction::None;
        }
        let Some(token_type) = self.fetcher.as_ref().map(|(_, token_type)| *token_type) else {
            return AuthAction::None;
        };

        match (event.purpose, event.token) {
            (FetchPurpose::Initial, Some(token)) => {
                self.paused = false;
                self.state = AuthState::AwaitingCachedConfirmation;
                self.schedule_refresh(token_type, &token);
                AuthAction::Install(AuthToken::new(token_type, token))
            }
            (FetchPurpose::Refresh, Some(token)) => {
                self.state = AuthState::AwaitingFreshConfirmation;
                self.schedule_refresh(token_type, &token);
                AuthAction::Install(AuthToken::new(token_type, token))
            }
            (FetchPurpose::Recovery, Some(token)) => {
                self.paused = false;
                self.state = AuthState::AwaitingFreshConfirmation;
                self.schedule_refresh(token_type, &token);
                AuthAction::ReconnectWith(AuthToken::new(token_type, token))
            }
            (FetchPurpose::Recovery, None) => {
                info!("No token after auth failure, continuing unauthenticated");
                self.epoch += 1;
                self.fetcher = None;
                self.sign_out();
                AuthAction::ClearAndReconnect
            }
            (purpose, None) => {
                info!(?purpose, "Token fetcher returned no token");
                self.sign_out();
                AuthAction::Clear
            }
        }
    }

    /// A Transition was applied.
    pub fn on_transition(&mut self, identity_advanced: bool) {
        if !identity_advanced {
            return;
        }
        match self.state {
            AuthState::AwaitingCachedConfirmation | AuthState::AwaitingFreshConfirmation => {
                self.state = AuthState::Authenticated;
                if !self.reported_authenticated {
                    self.notify(true);
                }
            }
            AuthState::NoAuth if self.reported_authenticated => {
                self.notify(false);
            }
            _ => {}
        }
    }

    /// The server rejected credentials.
    pub fn on_auth_error(
        &mut self,
        error: &str,
        base_version: Option<u32>,
        auth_update_attempted: bool,
        current_identity: u32,
    ) -> AuthAction {
        if let Some(base_version) = base_version {
            if base_version.saturating_add(1) < current_identity {
                debug!(base_version, current_identity, "Ignoring auth error for an older identity");
                return AuthAction::None;
            }
        }

        if !auth_update_attempted
            && matches!(
                self.state,
                AuthState::AwaitingCachedConfirmation | AuthState::AwaitingFreshConfirmation
            )
        {
            debug!(error, "Ignoring expiry error while a new token is pending");
            return AuthAction::None;
        }

        if self.state == AuthState::AwaitingFreshConfirmation || self.fetcher.is_none() {
            warn!(error, "Fresh token rejected, signing out");
            self.epoch += 1;
            self.fetcher = None;
            self.sign_out();
            return AuthAction::ClearAndReconnect;
        }

        warn!(error, "Token rejected, fetching a fresh one");
        self.state = AuthState::FetchingToken;
        self.refresh_at = None;
        self.paused = true;
        self.fetch(FetchPurpose::Recovery, true);
        AuthAction::Disconnect
    }

    /// The refresh timer fired.
    pub fn on_refresh_timer(&mut self) {
        self.refresh_at = None;
        let refreshable = matches!(
            self.state,
            AuthState::Authenticated
                | AuthState::AwaitingCachedConfirmation
                | AuthState::AwaitingFreshConfirmation
        );
        if refreshable && self.fetcher.is_some() {
            debug!("Refreshing token ahead of expiry");
            self.fetch(FetchPurpose::Refresh, true);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fetch(&self, purpose: FetchPurpose, force_refresh_token: bool) {
        let Some((fetcher, _)) = &self.fetcher else {
            return;
        };
        let pending = fetcher(FetchTokenArgs {
            force_refresh_token,
        });
        let epoch = self.epoch;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let token = pending.await;
            let _ = events_tx.send(AuthEvent {
                epoch,
                purpose,
                token,
            });
        });
    }

    fn sign_out(&mut self) {
        self.state = AuthState::NoAuth;
        self.refresh_at = None;
        self.paused = false;
        self.notify(false);
    }

    fn notify(&mut self, authenticated: bool) {
        self.reported_authenticated = authenticated;
        if let Some(on_change) = &self.on_change {
            on_change(authenticated);
        }
    }

    fn schedule_refresh(&mut self, token_type: TokenType, token: &str) {
        self.refresh_at = None;
        if token_type != TokenType::User {
            return;
        }
        let Some(exp) = decode_expiry(token) else {
            debug!("Token is not a JWT with exp, no refresh scheduled");
            return;
        };

        let remaining = exp - chrono::Utc::now().timestamp();
        let leeway = self.refresh_leeway.as_secs() as i64;
        if remaining <= leeway {
            debug!(remaining, leeway, "Token expires within leeway, no refresh scheduled");
            return;
        }

        let delay = Duration::from_secs((remaining - leeway) as u64);
        debug!(?delay, "Token refresh scheduled");
        self.refresh_at = Some(Instant::now() + delay);
    }
}

/// Reads `exp` from a JWT without checking its signature.
fn decode_expiry(token: &str) -> Option<i64> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .map(|data| data.claims.exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::sync::Mutex;

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    fn jwt(expires_in: i64) -> String {
        let claims = Claims {
            sub: "user-1".into(),
            exp: chrono::Utc::now().timestamp() + expires_in,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
    }

    struct Harness {
        manager: AuthenticationManager,
        events: mpsc::UnboundedReceiver<AuthEvent>,
        fetches: Arc<Mutex<Vec<bool>>>,
        changes: Arc<Mutex<Vec<bool>>>,
    }

    fn harness(tokens: Vec<Option<String>>) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut manager = AuthenticationManager::new(Duration::from_secs(10), events_tx);

        let fetches = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(tokens));

        let fetch_log = fetches.clone();
        let fetcher: TokenFetcher = Arc::new(move |args: FetchTokenArgs| {
            fetch_log.lock().unwrap().push(args.force_refresh_token);
            let next = {
                let mut queue = queue.lock().unwrap();
                if queue.is_empty() {
                    None
                } else {
                    queue.remove(0)
                }
            };
            async move { next }.boxed()
        });
        let change_log = changes.clone();
        let on_change: AuthChangeCallback =
            Arc::new(move |value: bool| change_log.lock().unwrap().push(value));

        manager.set_auth(fetcher, TokenType::User, on_change);
        Harness {
            manager,
            events,
            fetches,
            changes,
        }
    }

    impl Harness {
        async fn next_action(&mut self) -> AuthAction {
            let event = self.events.recv().await.unwrap();
            self.manager.on_token_fetched(event)
        }
    }

    #[tokio::test]
    async fn test_initial_token_awaits_confirmation() {
        let mut h = harness(vec![Some("T1".into())]);
        assert!(h.manager.is_paused());

        let action = h.next_action().await;
        assert_eq!(action, AuthAction::Install(AuthToken::User("T1".into())));
        assert_eq!(h.manager.state(), AuthState::AwaitingCachedConfirmation);
        assert!(!h.manager.is_paused());
        assert!(h.changes.lock().unwrap().is_empty());

        h.manager.on_transition(false);
        assert!(h.changes.lock().unwrap().is_empty());

        h.manager.on_transition(true);
        h.manager.on_transition(true);
        assert_eq!(*h.changes.lock().unwrap(), vec![true]);
        assert_eq!(h.manager.state(), AuthState::Authenticated);
        assert_eq!(*h.fetches.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_no_token_reports_signed_out() {
        let mut h = harness(vec![None]);
        assert_eq!(h.next_action().await, AuthAction::Clear);
        assert_eq!(h.manager.state(), AuthState::NoAuth);
        assert_eq!(*h.changes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_auth_error_forces_refetch() {
        let mut h = harness(vec![Some("T1".into()), Some("T2".into())]);
        h.next_action().await;
        h.manager.on_transition(true);

        let action = h.manager.on_auth_error("expired", Some(0), false, 1);
        assert_eq!(action, AuthAction::Disconnect);
        assert!(h.manager.is_paused());

        let action = h.next_action().await;
        assert_eq!(action, AuthAction::ReconnectWith(AuthToken::User("T2".into())));
        assert_eq!(h.manager.state(), AuthState::AwaitingFreshConfirmation);
        assert_eq!(*h.fetches.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_auth_error_without_new_token_signs_out() {
        let mut h = harness(vec![Some("T1".into()), None]);
        h.next_action().await;
        h.manager.on_transition(true);

        assert_eq!(h.manager.on_auth_error("expired", Some(0), false, 1), AuthAction::Disconnect);
        assert_eq!(h.next_action().await, AuthAction::ClearAndReconnect);
        assert_eq!(*h.changes.lock().unwrap(), vec![true, false]);
        assert_eq!(h.manager.state(), AuthState::NoAuth);
        assert!(!h.manager.is_paused());

        // Signed out for good: a later error starts no new fetch.
        h.manager.on_auth_error("expired", None, true, 1);
        h.manager.on_refresh_timer();
        assert_eq!(*h.fetches.lock().unwrap(), vec![false, true]);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_set_auth_reports_to_new_callback() {
        let mut h = harness(vec![Some("T1".into())]);
        h.next_action().await;
        h.manager.on_transition(true);
        assert_eq!(*h.changes.lock().unwrap(), vec![true]);

        let second = Arc::new(Mutex::new(Vec::<bool>::new()));
        let log = second.clone();
        h.manager.set_auth(
            Arc::new(|_args: FetchTokenArgs| async { Some("U2".to_string()) }.boxed()),
            TokenType::User,
            Arc::new(move |value: bool| log.lock().unwrap().push(value)),
        );
        assert!(!h.manager.is_authenticated());

        let action = h.next_action().await;
        assert_eq!(action, AuthAction::Install(AuthToken::User("U2".into())));
        h.manager.on_transition(true);
        h.manager.on_transition(true);

        assert_eq!(*second.lock().unwrap(), vec![true]);
        assert_eq!(*h.changes.lock().unwrap(), vec![true]);
        assert_eq!(h.manager.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_rejected_fresh_token_signs_out() {
        let mut h = harness(vec![Some("T1".into()), Some("T2".into())]);
        h.next_action().await;
        h.manager.on_transition(true);
        h.manager.on_auth_error("expired", Some(0), false, 1);
        h.next_action().await;

        let action = h.manager.on_auth_error("still bad", Some(0), true, 1);
        assert_eq!(action, AuthAction::ClearAndReconnect);
        assert_eq!(*h.changes.lock().unwrap(), vec![true, false]);
        assert_eq!(h.manager.state(), AuthState::NoAuth);
    }

    #[tokio::test]
    async fn test_auth_error_filters() {
        let mut h = harness(vec![Some("T1".into())]);
        h.next_action().await;

        // Still waiting for the server to confirm T1.
        assert_eq!(h.manager.on_auth_error("expired", Some(0), false, 1), AuthAction::None);

        // About an identity two versions back.
        assert_eq!(h.manager.on_auth_error("old", Some(0), true, 3), AuthAction::None);

        // Out-of-range base version from the server.
        h.manager.on_transition(true);
        assert_eq!(
            h.manager.on_auth_error("expired", Some(u32::MAX), true, 1),
            AuthAction::Disconnect
        );
    }

    #[tokio::test]
    async fn test_stale_fetch_discarded() {
        let mut h = harness(vec![Some("T1".into())]);
        h.manager.clear_auth();
        assert_eq!(h.next_action().await, AuthAction::None);
        assert_eq!(h.manager.state(), AuthState::NoAuth);
    }

    #[tokio::test]
    async fn test_clear_auth_defers_signed_out() {
        let mut h = harness(vec![Some("T1".into())]);
        h.next_action().await;
        h.manager.on_transition(true);

        h.manager.clear_auth();
        assert_eq!(*h.changes.lock().unwrap(), vec![true]);

        h.manager.on_transition(true);
        assert_eq!(*h.changes.lock().unwrap(), vec![true, false]);
        assert!(!h.manager.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_scheduled_before_expiry() {
        let mut h = harness(vec![Some(jwt(3600)), Some(jwt(7200))]);
        let before = Instant::now();
        h.next_action().await;

        let refresh_at = h.manager.refresh_at().unwrap();
        let delay = refresh_at - before;
        assert!(delay > Duration::from_secs(3580) && delay <= Duration::from_secs(3590));

        h.manager.on_transition(true);
        h.manager.on_refresh_timer();
        let action = h.next_action().await;
        assert!(matches!(action, AuthAction::Install(AuthToken::User(_))));
        assert_eq!(*h.fetches.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_no_refresh_for_short_or_opaque_tokens() {
        let mut h = harness(vec![Some(jwt(5))]);
        h.next_action().await;
        assert!(h.manager.refresh_at().is_none());

        let mut h = harness(vec![Some("opaque".into())]);
        h.next_action().await;
        assert!(h.manager.refresh_at().is_none());
    }

    #[test]
    fn test_decode_expiry() {
        let token = jwt(60);
        let exp = decode_expiry(&token).unwrap();
        assert!(exp > chrono::Utc::now().timestamp());
        assert_eq!(decode_expiry("not-a-jwt"), None);
    }
}
