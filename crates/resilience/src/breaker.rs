use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info};

/// State of a circuit breaker.
///
/// `Closed`, `Open` and `HalfOpen` follow the usual automatic cycle; the two
/// forced states are sticky and move only on an explicit transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Recovery probing, a bounded number of concurrent calls is allowed.
    HalfOpen,
    /// Manually pinned closed; counters never open it.
    ForcedClosed,
    /// Manually pinned open; time never half-opens it.
    ForcedOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::ForcedClosed => write!(f, "forced_closed"),
            Self::ForcedOpen => write!(f, "forced_open"),
        }
    }
}

/// Snapshot of the error that most recently counted against the circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Short type name of the error.
    pub error_type: String,
    /// Rendered error message.
    pub message: String,
    /// When the error was recorded.
    pub time: DateTime<Utc>,
}

type IgnorePredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Configuration for a [`CircuitBreaker`].
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors before the circuit opens.
    pub error_threshold: u32,
    /// Consecutive successes in half-open before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Concurrent probe calls allowed in half-open.
    pub half_open_capacity: u32,
    pub(crate) ignored: Vec<IgnorePredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_capacity: 1,
            ignored: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Treat errors of type `E` as successes.
    ///
    /// Matching errors still propagate to the caller unchanged; they just do
    /// not count against the circuit.
    pub fn ignore<E: std::error::Error + 'static>(mut self) -> Self {
        self.ignored
            .push(Arc::new(|error| error.downcast_ref::<E>().is_some()));
        self
    }

    /// Validate configuration values.
    ///
    /// `reset_timeout = 0` is allowed (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.error_threshold < 1 {
            return Err("error_threshold must be >= 1".into());
        }
        if self.success_threshold < 1 {
            return Err("success_threshold must be >= 1".into());
        }
        if self.half_open_capacity < 1 {
            return Err("half_open_capacity must be >= 1".into());
        }
        Ok(())
    }

    fn is_ignored(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        self.ignored.iter().any(|predicate| predicate(error))
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("error_threshold", &self.error_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("half_open_capacity", &self.half_open_capacity)
            .field("ignored", &self.ignored.len())
            .finish()
    }
}

/// Live metrics snapshot of one circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Name of the circuit breaker.
    pub name: String,
    /// State at snapshot time (after refreshing an elapsed open period).
    pub state: CircuitState,
    /// Calls currently inside the guarded region.
    pub active_calls: u32,
    /// Errors counted since the last restart.
    pub total_error_count: u64,
    /// Successes counted since the last restart.
    pub total_success_count: u64,
    /// Consecutive errors since the last success or transition.
    pub consecutive_error_count: u32,
    /// Consecutive successes since the last error or transition.
    pub consecutive_success_count: u32,
    /// The error that most recently counted against the circuit.
    pub last_error: Option<LastError>,
}

/// Denial signal: the circuit refused to admit the call.
///
/// This is the contract callers catch to fall back; the core never swallows
/// it.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' denied the call in state '{state}'")]
pub struct CircuitBreakerError {
    /// Name of the refusing circuit breaker.
    pub name: String,
    /// State that produced the refusal.
    pub state: CircuitState,
    /// Snapshot of the error that opened the circuit, if any.
    pub last_error: Option<LastError>,
}

/// Outcome of a guarded call: either the circuit refused it, or the inner
/// error passes through unchanged.
#[derive(Debug, Error)]
pub enum CallError<E>
where
    E: std::error::Error + 'static,
{
    /// The circuit denied the call; the guarded region never ran.
    #[error(transparent)]
    Rejected(#[from] CircuitBreakerError),
    /// The guarded region ran and failed with its own error.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct CoreState {
    state: CircuitState,
    consecutive_error_count: u32,
    consecutive_success_count: u32,
    total_error_count: u64,
    total_success_count: u64,
    active_calls: u32,
    last_error: Option<LastError>,
    open_until: Option<Instant>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_error_count: 0,
            consecutive_success_count: 0,
            total_error_count: 0,
            total_success_count: 0,
            active_calls: 0,
            last_error: None,
            open_until: None,
        }
    }
}

/// Per-name circuit breaker.
///
/// Counts consecutive failures of a guarded region, short-circuits callers
/// once a threshold is crossed, and probes recovery after a timed open
/// period. All state lives under one per-instance mutex which is never held
/// across a suspension; the guarded region itself is what awaits.
///
/// The asynchronous surface is [`call`](Self::call); OS threads that are not
/// running the event loop use [`from_thread`](Self::from_thread). Both share
/// the same state machine, as does the manual
/// [`try_acquire`](Self::try_acquire)/[`CallPermit`] layer underneath them.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<CoreState>,
}

impl CircuitBreaker {
    /// Create a standalone circuit breaker.
    ///
    /// Use [`registry::get_or_create`](crate::registry::get_or_create) for
    /// the process-wide named instances.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(CoreState::new()),
        }
    }

    /// The circuit breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this instance was created with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn core(&self) -> MutexGuard<'_, CoreState> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `core` to `to`, clearing both consecutive counters.
    ///
    /// Entering `Open` arms the reset deadline (`open_for` overrides the
    /// configured timeout).
    fn transition(
        &self,
        core: &mut CoreState,
        to: CircuitState,
        cause: &str,
        open_for: Option<Duration>,
    ) {
        let from = core.state;
        core.state = to;
        core.consecutive_error_count = 0;
        core.consecutive_success_count = 0;
        core.open_until = match to {
            CircuitState::Open => {
                Some(Instant::now() + open_for.unwrap_or(self.config.reset_timeout))
            }
            _ => None,
        };

        if to == CircuitState::Open {
            error!(
                circuit = %self.name,
                from_state = %from,
                to_state = %to,
                cause,
                "circuit breaker opened"
            );
        } else {
            info!(
                circuit = %self.name,
                from_state = %from,
                to_state = %to,
                cause,
                "circuit breaker state changed"
            );
        }
    }

    /// Promote an elapsed open period to half-open.
    fn refresh(&self, core: &mut CoreState) {
        if core.state == CircuitState::Open
            && core.open_until.is_some_and(|until| Instant::now() >= until)
        {
            self.transition(core, CircuitState::HalfOpen, "reset timeout elapsed", None);
        }
    }

    /// Ask for permission to enter the guarded region.
    ///
    /// Granting the permit and booking the active call is a single atomic
    /// step. The permit must be settled with [`CallPermit::success`] or
    /// [`CallPermit::error`]; dropping it unsettled (a cancelled call) only
    /// releases the booking.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError`] when the circuit refuses the call.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        let mut core = self.core();
        self.refresh(&mut core);

        let permitted = match core.state {
            CircuitState::Closed | CircuitState::ForcedClosed => true,
            CircuitState::HalfOpen => core.active_calls < self.config.half_open_capacity,
            CircuitState::Open | CircuitState::ForcedOpen => false,
        };

        if permitted {
            core.active_calls += 1;
            Ok(CallPermit {
                breaker: self,
                settled: false,
            })
        } else {
            Err(CircuitBreakerError {
                name: self.name.clone(),
                state: core.state,
                last_error: core.last_error.clone(),
            })
        }
    }

    fn on_success(&self) {
        let mut core = self.core();
        core.active_calls = core.active_calls.saturating_sub(1);
        core.total_success_count += 1;
        core.consecutive_success_count += 1;
        core.consecutive_error_count = 0;

        if core.state == CircuitState::HalfOpen
            && core.consecutive_success_count >= self.config.success_threshold
        {
            self.transition(
                &mut core,
                CircuitState::Closed,
                "success threshold reached",
                None,
            );
        }
    }

    fn on_error(&self, snapshot: LastError) {
        let mut core = self.core();
        core.active_calls = core.active_calls.saturating_sub(1);
        core.total_error_count += 1;
        core.consecutive_error_count += 1;
        core.consecutive_success_count = 0;
        core.last_error = Some(snapshot);

        if matches!(core.state, CircuitState::Closed | CircuitState::HalfOpen)
            && core.consecutive_error_count >= self.config.error_threshold
        {
            self.transition(&mut core, CircuitState::Open, "error threshold reached", None);
        }
    }

    fn on_abandon(&self) {
        let mut core = self.core();
        core.active_calls = core.active_calls.saturating_sub(1);
    }

    /// Guard a future that resolves to a `Result`.
    ///
    /// Asks for permission, awaits the future, classifies the outcome.
    /// Errors on the configured ignore list count as successes; every inner
    /// error propagates unchanged.
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the circuit refuses the call,
    /// [`CallError::Inner`] with the region's own error otherwise.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let permit = self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(inner) => {
                permit.error(&inner);
                Err(CallError::Inner(inner))
            }
        }
    }

    /// Guard a future with a per-call ignore predicate.
    ///
    /// Like [`call`](Self::call), but an error for which `is_ignored`
    /// returns `true` counts as a success in addition to anything on the
    /// configured ignore list.
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the circuit refuses the call,
    /// [`CallError::Inner`] with the region's own error otherwise.
    pub async fn call_with<T, E, Fut, F>(&self, fut: Fut, is_ignored: F) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        F: FnOnce(&E) -> bool,
    {
        let permit = self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(inner) => {
                if is_ignored(&inner) {
                    permit.success();
                } else {
                    permit.error(&inner);
                }
                Err(CallError::Inner(inner))
            }
        }
    }

    /// Companion surface for OS threads outside the event loop.
    ///
    /// The state machine never suspends, so this surface needs no runtime;
    /// it shares the per-instance mutex with the async surface.
    pub fn from_thread(&self) -> CircuitBreakerFromThread<'_> {
        CircuitBreakerFromThread { breaker: self }
    }

    /// Current state, refreshing an elapsed open period first.
    pub fn state(&self) -> CircuitState {
        let mut core = self.core();
        self.refresh(&mut core);
        core.state
    }

    /// The error that most recently counted against the circuit.
    pub fn last_error(&self) -> Option<LastError> {
        self.core().last_error.clone()
    }

    /// Live metrics snapshot, refreshing an elapsed open period first.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut core = self.core();
        self.refresh(&mut core);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: core.state,
            active_calls: core.active_calls,
            total_error_count: core.total_error_count,
            total_success_count: core.total_success_count,
            consecutive_error_count: core.consecutive_error_count,
            consecutive_success_count: core.consecutive_success_count,
            last_error: core.last_error.clone(),
        }
    }

    /// Zero all counters, clear the last error and force the circuit closed.
    pub fn restart(&self) {
        let mut core = self.core();
        core.total_error_count = 0;
        core.total_success_count = 0;
        core.last_error = None;
        self.transition(&mut core, CircuitState::Closed, "restart", None);
    }

    /// Explicitly close the circuit.
    pub fn transition_to_closed(&self) {
        let mut core = self.core();
        self.transition(&mut core, CircuitState::Closed, "explicit transition", None);
    }

    /// Explicitly open the circuit with the configured reset timeout.
    pub fn transition_to_open(&self) {
        let mut core = self.core();
        self.transition(&mut core, CircuitState::Open, "explicit transition", None);
    }

    /// Explicitly open the circuit for a custom duration.
    pub fn transition_to_open_for(&self, reset_timeout: Duration) {
        let mut core = self.core();
        self.transition(
            &mut core,
            CircuitState::Open,
            "explicit transition",
            Some(reset_timeout),
        );
    }

    /// Explicitly half-open the circuit.
    pub fn transition_to_half_open(&self) {
        let mut core = self.core();
        self.transition(&mut core, CircuitState::HalfOpen, "explicit transition", None);
    }

    /// Pin the circuit closed until the next explicit transition.
    pub fn transition_to_forced_closed(&self) {
        let mut core = self.core();
        self.transition(
            &mut core,
            CircuitState::ForcedClosed,
            "explicit transition",
            None,
        );
    }

    /// Pin the circuit open until the next explicit transition.
    pub fn transition_to_forced_open(&self) {
        let mut core = self.core();
        self.transition(
            &mut core,
            CircuitState::ForcedOpen,
            "explicit transition",
            None,
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Permission to run one guarded call.
///
/// Settle with [`success`](Self::success) or [`error`](Self::error); an
/// unsettled drop releases the active-call booking without classifying the
/// outcome.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallPermit<'_> {
    /// Classify the call as a success.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    /// Classify the call from its error.
    ///
    /// Errors on the breaker's ignore list count as successes.
    pub fn error<E: std::error::Error + 'static>(mut self, error: &E) {
        self.settled = true;
        if self.breaker.config.is_ignored(error) {
            self.breaker.on_success();
        } else {
            self.breaker.on_error(LastError {
                error_type: short_type_name::<E>(),
                message: error.to_string(),
                time: Utc::now(),
            });
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon();
        }
    }
}

/// Blocking-thread surface of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerFromThread<'a> {
    breaker: &'a CircuitBreaker,
}

impl CircuitBreakerFromThread<'_> {
    /// Guard a closure; the blocking twin of [`CircuitBreaker::call`].
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the circuit refuses the call,
    /// [`CallError::Inner`] with the closure's own error otherwise.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let permit = self.breaker.try_acquire()?;
        match f() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(inner) => {
                permit.error(&inner);
                Err(CallError::Inner(inner))
            }
        }
    }

    /// Guard a closure with a per-call ignore predicate; the blocking twin
    /// of [`CircuitBreaker::call_with`].
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the circuit refuses the call,
    /// [`CallError::Inner`] with the closure's own error otherwise.
    pub fn call_with<T, E, F, P>(&self, f: F, is_ignored: P) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + 'static,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.breaker.try_acquire()?;
        match f() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(inner) => {
                if is_ignored(&inner) {
                    permit.success();
                } else {
                    permit.error(&inner);
                }
                Err(CallError::Inner(inner))
            }
        }
    }
}

fn short_type_name<T>() -> String {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or_default()
        .to_owned()
}
