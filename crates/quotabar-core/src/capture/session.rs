//! Capture-and-score state machine for one login window.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use super::profile::CaptureProfile;
use crate::credential::EndpointCredential;
use crate::provider::Provider;

/// Identifier pairing a request with its response.
pub type RequestId = u64;

/// Something the traffic-observation facility saw in the login window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficEvent {
    /// An outgoing request, including top-level navigations.
    RequestWillBeSent {
        /// Request id.
        id: RequestId,
        /// Absolute request URL.
        url: String,
        /// Request headers.
        headers: BTreeMap<String, String>,
    },
    /// Response headers arrived.
    ResponseReceived {
        /// Request id.
        id: RequestId,
        /// Absolute request URL.
        url: String,
    },
    /// The response body was fully received. `None` if it could not be read.
    LoadingFinished {
        /// Request id.
        id: RequestId,
        /// Decoded body text.
        body: Option<String>,
    },
    /// The exchange failed before completion.
    LoadingFailed {
        /// Request id.
        id: RequestId,
    },
    /// The user closed the login window.
    WindowClosed,
}

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Created, observation not yet confirmed.
    Attached,
    /// Observing traffic and scoring candidates.
    Observing,
    /// A credential was produced.
    Completed,
    /// The window closed first.
    Aborted,
    /// Observation could not attach. The session never does anything.
    Failed,
}

impl CaptureState {
    /// Returns true for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureState::Completed | CaptureState::Aborted | CaptureState::Failed
        )
    }
}

/// A scored response retained as the running best.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCandidate {
    /// Response URL.
    pub url: String,
    /// Captured request headers.
    pub headers: BTreeMap<String, String>,
    /// Body text as received. Held in memory only.
    pub body: String,
    /// Rubric score.
    pub score: u32,
}

/// What a single event did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStep {
    /// Nothing changed.
    Ignored,
    /// A candidate was scored without changing the timer.
    Scored {
        /// The score it received.
        score: u32,
    },
    /// A below-threshold candidate armed the fallback timer.
    FallbackArmed {
        /// When the fallback fires.
        deadline: Instant,
    },
    /// The session produced a credential.
    Completed(EndpointCredential),
    /// The window closed before completion.
    Aborted,
}

/// Single-slot delayed completion.
#[derive(Debug, Clone, Copy)]
struct PendingCompletion {
    deadline: Instant,
}

/// Watches one login window's traffic and decides which response is the usage endpoint.
///
/// The session is synchronous: the caller feeds it [`TrafficEvent`]s in
/// arrival order and fires [`CaptureSession::fire_fallback`] when the
/// deadline from [`CaptureSession::pending_deadline`] passes. Accepting a
/// candidate clears the pending slot before returning, so a completion can
/// only happen once.
#[derive(Debug)]
pub struct CaptureSession {
    profile: CaptureProfile,
    state: CaptureState,
    request_headers: HashMap<RequestId, BTreeMap<String, String>>,
    awaiting_body: HashMap<RequestId, String>,
    reached_usage_page: bool,
    best: Option<CaptureCandidate>,
    pending: Option<PendingCompletion>,
}

impl CaptureSession {
    /// Creates a session in the `Attached` state.
    pub fn new(profile: CaptureProfile) -> Self {
        Self {
            profile,
            state: CaptureState::Attached,
            request_headers: HashMap::new(),
            awaiting_body: HashMap::new(),
            reached_usage_page: false,
            best: None,
            pending: None,
        }
    }

    /// Provider being captured.
    pub fn provider(&self) -> Provider {
        self.profile.provider
    }

    /// Heuristics in use.
    pub fn profile(&self) -> &CaptureProfile {
        &self.profile
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Running best candidate, if any.
    pub fn best_candidate(&self) -> Option<&CaptureCandidate> {
        self.best.as_ref()
    }

    /// Deadline of the pending fallback completion, if armed.
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// Returns true once responses are being scored.
    pub fn is_scoring(&self) -> bool {
        !self.profile.is_gated() || self.reached_usage_page
    }

    /// Marks traffic observation as attached.
    pub fn observe(&mut self) {
        if self.state == CaptureState::Attached {
            self.state = CaptureState::Observing;
            tracing::debug!("Capture for {} observing traffic", self.provider());
        }
    }

    /// Marks the session permanently failed because observation could not attach.
    pub fn attach_failed(&mut self, reason: &str) {
        if self.state == CaptureState::Attached {
            tracing::error!(
                "Capture for {} could not attach to traffic: {}",
                self.provider(),
                reason
            );
            self.state = CaptureState::Failed;
        }
    }

    /// Applies one traffic event.
    pub fn handle(&mut self, event: TrafficEvent, now: Instant) -> CaptureStep {
        if self.state != CaptureState::Observing {
            return CaptureStep::Ignored;
        }

        match event {
            TrafficEvent::RequestWillBeSent { id, url, headers } => {
                if !self.reached_usage_page && self.profile.is_usage_page(&url) {
                    tracing::info!("{} usage page reached, scoring enabled", self.provider());
                    self.reached_usage_page = true;
                }
                let headers = headers
                    .into_iter()
                    .map(|(name, value)| (name.to_lowercase(), value))
                    .collect();
                self.request_headers.insert(id, headers);
                CaptureStep::Ignored
            }
            TrafficEvent::ResponseReceived { id, url } => {
                if self.is_scoring() && self.profile.is_candidate(&url) {
                    tracing::debug!("{} candidate response: {}", self.provider(), url);
                    self.awaiting_body.insert(id, url);
                }
                CaptureStep::Ignored
            }
            TrafficEvent::LoadingFinished { id, body } => {
                let headers = self.request_headers.remove(&id);
                match (self.awaiting_body.remove(&id), headers) {
                    (Some(url), Some(headers)) => self.score(url, headers, body, now),
                    _ => CaptureStep::Ignored,
                }
            }
            TrafficEvent::LoadingFailed { id } => {
                self.request_headers.remove(&id);
                self.awaiting_body.remove(&id);
                CaptureStep::Ignored
            }
            TrafficEvent::WindowClosed => self.abort(),
        }
    }

    /// Fires the pending fallback if its deadline has passed.
    pub fn fire_fallback(&mut self, now: Instant) -> CaptureStep {
        if self.state != CaptureState::Observing {
            return CaptureStep::Ignored;
        }
        match self.pending {
            Some(pending) if now >= pending.deadline => {
                self.pending = None;
                match self.best.take() {
                    Some(best) => {
                        tracing::info!(
                            "{} fallback accepting best candidate (score {}): {}",
                            self.provider(),
                            best.score,
                            best.url
                        );
                        self.complete(best.url, best.headers)
                    }
                    None => CaptureStep::Ignored,
                }
            }
            _ => CaptureStep::Ignored,
        }
    }

    fn score(
        &mut self,
        url: String,
        headers: BTreeMap<String, String>,
        body: Option<String>,
        now: Instant,
    ) -> CaptureStep {
        let Some(body) = body.filter(|b| !b.trim().is_empty()) else {
            tracing::debug!("{} skipping empty body: {}", self.provider(), url);
            return CaptureStep::Ignored;
        };

        let score = self.profile.score(&url, &body);
        tracing::debug!("{} scored {} for {}", self.provider(), score, url);

        if score >= self.profile.accept_threshold {
            tracing::info!(
                "{} accepted endpoint immediately (score {}): {}",
                self.provider(),
                score,
                url
            );
            return self.complete(url, headers);
        }

        if score == 0 {
            return CaptureStep::Ignored;
        }

        if self.best.as_ref().map_or(true, |best| score > best.score) {
            self.best = Some(CaptureCandidate {
                url,
                headers,
                body,
                score,
            });
        }

        if self.pending.is_none() {
            let deadline = now + self.profile.fallback_delay;
            self.pending = Some(PendingCompletion { deadline });
            return CaptureStep::FallbackArmed { deadline };
        }

        CaptureStep::Scored { score }
    }

    fn complete(&mut self, url: String, headers: BTreeMap<String, String>) -> CaptureStep {
        self.pending = None;
        self.best = None;
        self.request_headers.clear();
        self.awaiting_body.clear();
        self.state = CaptureState::Completed;
        CaptureStep::Completed(EndpointCredential::new(url, headers))
    }

    fn abort(&mut self) -> CaptureStep {
        tracing::info!("{} login window closed before capture completed", self.provider());
        self.pending = None;
        self.best = None;
        self.request_headers.clear();
        self.awaiting_body.clear();
        self.state = CaptureState::Aborted;
        CaptureStep::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const USAGE_PAGE: &str = "https://claude.ai/settings/usage";
    const USAGE_API: &str = "https://claude.ai/api/organizations/org-1/usage";
    const STATS_API: &str = "https://claude.ai/api/organizations/org-1/stats";

    // 25 (path) + 10 + 10 + 5
    const BODY_50: &str = r#"{"percent_used":1,"resets_at":"x","utilization":2}"#;
    // 25 (path) + 10 + 5
    const BODY_40: &str = r#"{"resets_at":"x","utilization":2}"#;
    // percent_used only, on a path without the bonus
    const BODY_10: &str = r#"{"percent_used":1}"#;

    struct Harness {
        session: CaptureSession,
        next_id: RequestId,
        now: Instant,
    }

    impl Harness {
        fn new(profile: CaptureProfile) -> Self {
            let mut session = CaptureSession::new(profile);
            session.observe();
            Self {
                session,
                next_id: 1,
                now: Instant::now(),
            }
        }

        fn claude() -> Self {
            Self::new(CaptureProfile::for_provider(Provider::Claude).unwrap())
        }

        fn navigate(&mut self, url: &str) {
            let id = self.next_id;
            self.next_id += 1;
            self.session.handle(
                TrafficEvent::RequestWillBeSent {
                    id,
                    url: url.to_string(),
                    headers: BTreeMap::new(),
                },
                self.now,
            );
        }

        fn exchange(&mut self, url: &str, body: &str) -> CaptureStep {
            let id = self.next_id;
            self.next_id += 1;

            let mut headers = BTreeMap::new();
            headers.insert("Authorization".to_string(), format!("Bearer {}", id));
            headers.insert("Cookie".to_string(), "sessionKey=secret".to_string());

            self.session.handle(
                TrafficEvent::RequestWillBeSent {
                    id,
                    url: url.to_string(),
                    headers,
                },
                self.now,
            );
            self.session.handle(
                TrafficEvent::ResponseReceived {
                    id,
                    url: url.to_string(),
                },
                self.now,
            );
            self.session.handle(
                TrafficEvent::LoadingFinished {
                    id,
                    body: Some(body.to_string()),
                },
                self.now,
            )
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
        }
    }

    #[test]
    fn ignores_events_until_observing() {
        let mut session = CaptureSession::new(CaptureProfile::for_provider(Provider::Codex).unwrap());
        let step = session.handle(TrafficEvent::WindowClosed, Instant::now());
        assert_eq!(step, CaptureStep::Ignored);
        assert_eq!(session.state(), CaptureState::Attached);
    }

    #[test]
    fn attach_failure_is_permanent() {
        let mut session = CaptureSession::new(CaptureProfile::for_provider(Provider::Codex).unwrap());
        session.attach_failed("debugger detached");
        session.observe();
        assert_eq!(session.state(), CaptureState::Failed);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn high_score_completes_immediately_without_timer() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);

        let step = h.exchange(USAGE_API, BODY_50);
        let CaptureStep::Completed(credential) = step else {
            panic!("expected completion, got {:?}", step);
        };

        assert_eq!(credential.url, USAGE_API);
        assert!(credential.headers.contains_key("authorization"));
        assert!(!credential.headers.contains_key("cookie"));
        assert_eq!(h.session.pending_deadline(), None);
        assert_eq!(h.session.state(), CaptureState::Completed);
    }

    #[test]
    fn low_score_arms_five_second_fallback() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        let start = h.now;

        let step = h.exchange(STATS_API, BODY_10);
        assert_eq!(
            step,
            CaptureStep::FallbackArmed {
                deadline: start + Duration::from_secs(5)
            }
        );
        assert_eq!(h.session.best_candidate().unwrap().score, 10);
    }

    #[test]
    fn immediate_accept_cancels_pending_fallback() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);

        h.exchange(STATS_API, BODY_10);
        assert!(h.session.pending_deadline().is_some());

        h.advance(Duration::from_secs(2));
        let step = h.exchange(USAGE_API, BODY_40);
        let CaptureStep::Completed(credential) = step else {
            panic!("expected completion, got {:?}", step);
        };
        assert_eq!(credential.url, USAGE_API);
        assert_eq!(h.session.pending_deadline(), None);

        // The cancelled timer must not complete a second time.
        h.advance(Duration::from_secs(10));
        assert_eq!(h.session.fire_fallback(h.now), CaptureStep::Ignored);
    }

    #[test]
    fn fallback_completes_with_best_candidate() {
        let mut h = Harness::new(
            CaptureProfile::for_provider(Provider::Claude)
                .unwrap()
                .with_accept_threshold(100),
        );
        h.navigate(USAGE_PAGE);

        h.exchange(STATS_API, BODY_10);
        h.advance(Duration::from_secs(1));
        // Higher score replaces the best but does not re-arm the timer.
        assert_eq!(h.exchange(USAGE_API, BODY_40), CaptureStep::Scored { score: 40 });
        h.advance(Duration::from_secs(1));
        assert_eq!(h.exchange(STATS_API, BODY_10), CaptureStep::Scored { score: 10 });

        h.advance(Duration::from_secs(2));
        assert_eq!(h.session.fire_fallback(h.now), CaptureStep::Ignored);

        h.advance(Duration::from_secs(1));
        match h.session.fire_fallback(h.now) {
            CaptureStep::Completed(credential) => assert_eq!(credential.url, USAGE_API),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn equal_score_does_not_replace_best() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);

        h.exchange(STATS_API, BODY_10);
        h.exchange("https://claude.ai/api/organizations/org-2/stats", BODY_10);
        assert_eq!(h.session.best_candidate().unwrap().url, STATS_API);
    }

    #[test]
    fn scoring_is_gated_on_usage_page() {
        let mut h = Harness::claude();
        assert!(!h.session.is_scoring());

        assert_eq!(h.exchange(USAGE_API, BODY_50), CaptureStep::Ignored);

        h.navigate(USAGE_PAGE);
        assert!(h.session.is_scoring());
        assert!(matches!(h.exchange(USAGE_API, BODY_50), CaptureStep::Completed(_)));
    }

    #[test]
    fn ungated_provider_scores_from_start() {
        let mut h = Harness::new(CaptureProfile::for_provider(Provider::Codex).unwrap());
        let step = h.exchange("https://chatgpt.com/backend-api/wham/usage", "{\"rate_limit\":{}}");
        assert!(matches!(step, CaptureStep::Completed(_)));
    }

    #[test]
    fn empty_body_is_not_scored() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        assert_eq!(h.exchange(USAGE_API, "  "), CaptureStep::Ignored);
        assert!(h.session.best_candidate().is_none());
    }

    #[test]
    fn response_without_recorded_request_is_not_scored() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        let now = h.now;

        h.session.handle(
            TrafficEvent::ResponseReceived {
                id: 99,
                url: USAGE_API.to_string(),
            },
            now,
        );
        let step = h.session.handle(
            TrafficEvent::LoadingFinished {
                id: 99,
                body: Some(BODY_50.to_string()),
            },
            now,
        );
        assert_eq!(step, CaptureStep::Ignored);
    }

    #[test]
    fn loading_failed_drops_pairing() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        let now = h.now;

        h.session.handle(
            TrafficEvent::RequestWillBeSent {
                id: 50,
                url: USAGE_API.to_string(),
                headers: BTreeMap::new(),
            },
            now,
        );
        h.session.handle(
            TrafficEvent::ResponseReceived {
                id: 50,
                url: USAGE_API.to_string(),
            },
            now,
        );
        h.session.handle(TrafficEvent::LoadingFailed { id: 50 }, now);
        let step = h.session.handle(
            TrafficEvent::LoadingFinished {
                id: 50,
                body: Some(BODY_50.to_string()),
            },
            now,
        );
        assert_eq!(step, CaptureStep::Ignored);
    }

    #[test]
    fn window_close_aborts_and_cancels_timer() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        h.exchange(STATS_API, BODY_10);

        let now = h.now;
        assert_eq!(h.session.handle(TrafficEvent::WindowClosed, now), CaptureStep::Aborted);
        assert_eq!(h.session.state(), CaptureState::Aborted);
        assert_eq!(h.session.pending_deadline(), None);

        h.advance(Duration::from_secs(6));
        assert_eq!(h.session.fire_fallback(h.now), CaptureStep::Ignored);
    }

    #[test]
    fn completed_session_ignores_further_traffic() {
        let mut h = Harness::claude();
        h.navigate(USAGE_PAGE);
        h.exchange(USAGE_API, BODY_50);
        assert_eq!(h.exchange(USAGE_API, BODY_50), CaptureStep::Ignored);
        assert_eq!(h.session.state(), CaptureState::Completed);
    }
}
