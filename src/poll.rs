//! Client side of the refresh protocol.
//!
//! [`PollState`] is the pure state machine: it decides when the next check
//! is due and what to do with each answer. [`run_poller`] drives it against
//! a [`PollTransport`] until the session stops or the token is cancelled.
//!
//! A fragment that was live when the page loaded polls at a fixed interval
//! until the session ends. A fragment that was not live stays dormant until
//! it becomes visible again, then checks with a growing interval.

use crate::change::{RefreshRequest, RefreshResponse};
use crate::error::FetchError;
use crate::service::Service;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Largest exponent used for idle and retry growth.
const MAX_GROWTH_STEPS: u32 = 16;

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Fixed interval while something is playing
    pub live_interval: Duration,
    pub idle_initial: Duration,
    pub idle_max: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
    /// Polling stops for good after this long
    pub max_lifetime: Duration,
    /// Polling stops once the page has been hidden this long
    pub hidden_grace: Duration,
}

impl PollConfig {
    pub fn for_service(service: Service) -> Self {
        let live_interval = match service {
            Service::Lastfm => Duration::from_secs(20),
            Service::Trakt | Service::Generic => Duration::from_secs(60),
        };
        Self {
            live_interval,
            ..Self::default()
        }
    }

    fn grow(base: Duration, steps: u32, cap: Duration) -> Duration {
        base.saturating_mul(2u32.saturating_pow(steps.min(MAX_GROWTH_STEPS)))
            .min(cap)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            live_interval: Duration::from_secs(60),
            idle_initial: Duration::from_secs(60),
            idle_max: Duration::from_secs(15 * 60),
            retry_base: Duration::from_secs(5),
            max_retries: 3,
            max_lifetime: Duration::from_secs(60 * 60),
            hidden_grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The live session ended; polling does not resume by itself
    SessionEnded,
    LifetimeExceeded,
    HiddenTooLong,
    /// Retries exhausted
    Failed,
}

impl StopReason {
    /// Whether the UI should offer a manual retry.
    pub fn allows_retry(&self) -> bool {
        matches!(self, StopReason::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Live,
    /// Not live at load time; waits for visibility
    Dormant,
    /// Opportunistic checks with a growing interval
    Idle,
    Stopped(StopReason),
}

#[derive(Debug, Clone)]
pub struct PollState {
    content_id: String,
    config: PollConfig,
    mode: PollMode,
    content_hash: Option<String>,
    is_live: bool,
    idle_steps: u32,
    retry_attempts: u32,
    force_next: bool,
    started_at: Instant,
    last_activity_at: Instant,
    hidden_since: Option<Instant>,
}

impl PollState {
    /// State for a fragment rendered with `hash`, live or not.
    pub fn new(
        content_id: impl Into<String>,
        config: PollConfig,
        hash: Option<String>,
        live: bool,
        now: Instant,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            config,
            mode: if live {
                PollMode::Live
            } else {
                PollMode::Dormant
            },
            content_hash: hash,
            is_live: live,
            idle_steps: 0,
            retry_attempts: 0,
            force_next: false,
            started_at: now,
            last_activity_at: now,
            hidden_since: None,
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn idle_steps(&self) -> u32 {
        self.idle_steps
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.mode, PollMode::Stopped(_))
    }

    fn stop(&mut self, reason: StopReason) {
        info!("Polling for {} stopped: {:?}", self.content_id, reason);
        self.mode = PollMode::Stopped(reason);
    }

    /// Next request body; consumes a pending force flag.
    pub fn request(&mut self) -> RefreshRequest {
        RefreshRequest {
            content_id: self.content_id.clone(),
            previous_hash: self.content_hash.clone(),
            force_refresh: std::mem::take(&mut self.force_next),
        }
    }

    /// Delay until the next check, `None` when no timer should run.
    pub fn next_delay(&self) -> Option<Duration> {
        let base = match self.mode {
            PollMode::Live => self.config.live_interval,
            PollMode::Idle => PollConfig::grow(
                self.config.idle_initial,
                self.idle_steps,
                self.config.idle_max,
            ),
            PollMode::Dormant | PollMode::Stopped(_) => return None,
        };
        if self.retry_attempts > 0 {
            return Some(PollConfig::grow(
                self.config.retry_base,
                self.retry_attempts - 1,
                self.config.idle_max,
            ));
        }
        Some(base)
    }

    /// Apply a refresh answer. Returns the HTML to swap in, if any.
    pub fn on_response(&mut self, response: &RefreshResponse, now: Instant) -> Option<String> {
        if self.is_stopped() {
            return None;
        }
        self.retry_attempts = 0;
        self.last_activity_at = now;
        self.content_hash = Some(response.hash.clone());
        let was_live = self.mode == PollMode::Live;
        self.is_live = response.live;

        if was_live && !response.live {
            self.stop(StopReason::SessionEnded);
        } else if response.live {
            self.mode = PollMode::Live;
            self.idle_steps = 0;
        } else {
            self.mode = PollMode::Idle;
            if response.changed {
                self.idle_steps = 0;
            } else {
                self.idle_steps = (self.idle_steps + 1).min(MAX_GROWTH_STEPS);
            }
        }

        if !self.is_stopped() {
            self.check_stop(now);
        }
        response.html.clone()
    }

    pub fn on_error(&mut self, now: Instant) {
        if self.is_stopped() {
            return;
        }
        self.retry_attempts += 1;
        self.last_activity_at = now;
        if self.retry_attempts > self.config.max_retries {
            self.stop(StopReason::Failed);
        }
    }

    /// Track page visibility. Returns true when a check should run now.
    pub fn on_visibility(&mut self, visible: bool, now: Instant) -> bool {
        if !visible {
            self.hidden_since.get_or_insert(now);
            return false;
        }
        let hidden_since = self.hidden_since.take();
        if self.is_stopped() {
            return false;
        }
        if let Some(since) = hidden_since
            && now.duration_since(since) >= self.config.hidden_grace
        {
            self.stop(StopReason::HiddenTooLong);
            return false;
        }
        if self.mode == PollMode::Dormant {
            debug!("{} visible again, checking for changes", self.content_id);
            self.mode = PollMode::Idle;
            self.idle_steps = 0;
            return true;
        }
        false
    }

    /// Start a new session that forces the next request.
    pub fn manual_refresh(&mut self, now: Instant) {
        self.started_at = now;
        self.last_activity_at = now;
        self.hidden_since = None;
        self.retry_attempts = 0;
        self.idle_steps = 0;
        self.force_next = true;
        if !matches!(self.mode, PollMode::Live) {
            self.mode = PollMode::Idle;
        }
    }

    /// Apply the lifetime and hidden-time limits. Returns the reason if
    /// this call stopped polling.
    pub fn check_stop(&mut self, now: Instant) -> Option<StopReason> {
        if self.is_stopped() {
            return None;
        }
        let reason = if now.duration_since(self.started_at) >= self.config.max_lifetime {
            StopReason::LifetimeExceeded
        } else if let Some(since) = self.hidden_since
            && now.duration_since(since) >= self.config.hidden_grace
        {
            StopReason::HiddenTooLong
        } else {
            return None;
        };
        self.stop(reason);
        Some(reason)
    }
}

/// Sends refresh requests to the server.
#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshResponse, FetchError>;
}

/// Receives fragment updates.
pub trait FragmentSink: Send {
    fn apply(&mut self, html: &str);

    fn stopped(&mut self, reason: StopReason);
}

/// Signals from the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Visibility(bool),
    ManualRefresh,
}

/// `POST {base}/refresh` over reqwest.
#[derive(Clone)]
pub struct HttpPollTransport {
    client: Client,
    endpoint: Url,
}

impl HttpPollTransport {
    pub fn new(client: Client, base_url: &str) -> Result<Self, FetchError> {
        let endpoint = Url::parse(base_url)?.join("refresh")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PollTransport for HttpPollTransport {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshResponse, FetchError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Upstream {
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|_| FetchError::malformed(self.endpoint.as_str(), status.as_u16(), &body))
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Drive `state` until cancelled, or until polling has stopped and no
/// more page events can arrive. Returns the final state.
pub async fn run_poller<T, S>(
    transport: &T,
    sink: &mut S,
    mut state: PollState,
    mut events: mpsc::Receiver<PollEvent>,
    cancel: CancellationToken,
) -> PollState
where
    T: PollTransport + ?Sized,
    S: FragmentSink,
{
    let mut events_open = true;

    loop {
        let delay = state.next_delay();
        if delay.is_none() && !events_open {
            break;
        }

        let was_stopped = state.is_stopped();
        let check_now = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_for(delay) => true,
            event = events.recv(), if events_open => match event {
                Some(PollEvent::Visibility(visible)) => {
                    state.on_visibility(visible, Instant::now())
                }
                Some(PollEvent::ManualRefresh) => {
                    state.manual_refresh(Instant::now());
                    true
                }
                None => {
                    events_open = false;
                    false
                }
            },
        };

        if check_now && !state.is_stopped() && state.check_stop(Instant::now()).is_none() {
            let request = state.request();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = transport.refresh(&request) => result,
            };
            match result {
                Ok(response) => {
                    if let Some(html) = state.on_response(&response, Instant::now()) {
                        sink.apply(&html);
                    }
                }
                Err(e) => {
                    warn!("Refresh of {} failed: {}", request.content_id, e);
                    state.on_error(Instant::now());
                }
            }
        }

        if !was_stopped && let PollMode::Stopped(reason) = state.mode() {
            sink.stopped(reason);
        }
    }

    state
}
