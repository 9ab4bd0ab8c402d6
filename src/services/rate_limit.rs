//! Fixed-window request counters keyed by caller and scope.
//!
//! Every attempt counts against its window, accepted or not. A window is
//! recreated once its period has elapsed; stale windows are pruned lazily.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{CallerIdentity, RateLimitConfig};
use crate::utils::clock::Clock;

/// Pruning runs once the table holds this many windows.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Anonymous,
    User,
    Chat,
    Upload,
    Burst,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Anonymous,
        Scope::User,
        Scope::Chat,
        Scope::Upload,
        Scope::Burst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Anonymous => "anonymous",
            Scope::User => "user",
            Scope::Chat => "chat",
            Scope::Upload => "upload",
            Scope::Burst => "burst",
        }
    }

    /// The per-caller scope: by address for anonymous callers, by id otherwise.
    pub fn for_caller(caller: &CallerIdentity) -> Scope {
        match caller {
            CallerIdentity::Anonymous { .. } => Scope::Anonymous,
            CallerIdentity::User { .. } => Scope::User,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = RateLimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| RateLimitParseError::new(s, "unknown scope"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Second,
    Minute,
    Hour,
    Day,
}

impl Period {
    pub fn seconds(&self) -> i64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 3600,
            Period::Day => 86_400,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Period::Second => "second",
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid rate limit {input:?}: {reason}")]
pub struct RateLimitParseError {
    input: String,
    reason: &'static str,
}

impl RateLimitParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// `requests` per `period`, written as `"N/period"` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimit {
    pub requests: u32,
    pub period: Period,
}

impl RateLimit {
    pub fn new(requests: u32, period: Period) -> Self {
        Self { requests, period }
    }

    pub fn per_second(requests: u32) -> Self {
        Self::new(requests, Period::Second)
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Period::Minute)
    }

    pub fn per_hour(requests: u32) -> Self {
        Self::new(requests, Period::Hour)
    }

    pub fn per_day(requests: u32) -> Self {
        Self::new(requests, Period::Day)
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.period.seconds())
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.requests, self.period.as_str())
    }
}

impl FromStr for RateLimit {
    type Err = RateLimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, period) = s
            .split_once('/')
            .ok_or_else(|| RateLimitParseError::new(s, "expected N/period"))?;

        let requests: u32 = count
            .trim()
            .parse()
            .map_err(|_| RateLimitParseError::new(s, "request count is not a number"))?;
        if requests == 0 {
            return Err(RateLimitParseError::new(s, "request count must be positive"));
        }

        let period = match period.trim().to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Period::Second,
            "m" | "min" | "minute" | "minutes" => Period::Minute,
            "h" | "hour" | "hours" => Period::Hour,
            "d" | "day" | "days" => Period::Day,
            _ => return Err(RateLimitParseError::new(s, "unknown period")),
        };

        Ok(Self { requests, period })
    }
}

impl TryFrom<String> for RateLimit {
    type Error = RateLimitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimit> for String {
    fn from(limit: RateLimit) -> Self {
        limit.to_string()
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the window resets. Always positive on rejection.
    pub reset_seconds: u64,
    pub limit: RateLimit,
    pub scope: Scope,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    count: u32,
}

type WindowKey = (String, Scope);

#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limits: HashMap<Scope, RateLimit>,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<WindowKey, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = HashMap::from([
            (Scope::Anonymous, config.anonymous),
            (Scope::User, config.user),
            (Scope::Chat, config.chat),
            (Scope::Upload, config.upload),
            (Scope::Burst, config.burst),
        ]);
        Self {
            enabled: config.enabled,
            limits,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self, scope: Scope) -> RateLimit {
        self.limits
            .get(&scope)
            .copied()
            .unwrap_or(RateLimit::per_minute(u32::MAX))
    }

    /// Count one attempt by `identity` against `scope`.
    pub fn allow(&self, identity: &str, scope: Scope) -> RateDecision {
        self.allow_all(identity, &[scope])
    }

    /// Count one attempt against every scope. The request passes only if all
    /// scopes allow it; a rejection reports the longest wait.
    pub fn allow_all(&self, identity: &str, scopes: &[Scope]) -> RateDecision {
        if !self.enabled || scopes.is_empty() {
            let scope = scopes.first().copied().unwrap_or(Scope::Burst);
            let limit = self.limit(scope);
            return RateDecision {
                allowed: true,
                remaining: limit.requests,
                reset_seconds: 0,
                limit,
                scope,
            };
        }

        let now = self.clock.now();
        let mut windows = self.lock();
        if windows.len() >= PRUNE_THRESHOLD {
            Self::prune(&mut windows, &self.limits, now);
        }

        let decisions: Vec<RateDecision> = scopes
            .iter()
            .map(|&scope| {
                let limit = self.limit(scope);
                let window = windows
                    .entry((identity.to_string(), scope))
                    .or_insert(Window {
                        start: now,
                        count: 0,
                    });
                if now >= window.start + limit.window() {
                    *window = Window {
                        start: now,
                        count: 0,
                    };
                }
                window.count = window.count.saturating_add(1);

                let reset_ms = (window.start + limit.window() - now).num_milliseconds();
                RateDecision {
                    allowed: window.count <= limit.requests,
                    remaining: limit.requests.saturating_sub(window.count),
                    reset_seconds: (reset_ms.max(1) as u64).div_ceil(1000),
                    limit,
                    scope,
                }
            })
            .collect();
        drop(windows);

        let rejected = decisions
            .iter()
            .filter(|d| !d.allowed)
            .max_by_key(|d| d.reset_seconds)
            .copied();

        match rejected {
            Some(decision) => {
                tracing::debug!(
                    identity,
                    scope = %decision.scope,
                    limit = %decision.limit,
                    reset_seconds = decision.reset_seconds,
                    "rate limit exceeded"
                );
                decision
            }
            None => decisions
                .into_iter()
                .min_by_key(|d| d.remaining)
                .unwrap_or(RateDecision {
                    allowed: true,
                    remaining: 0,
                    reset_seconds: 0,
                    limit: self.limit(Scope::Burst),
                    scope: Scope::Burst,
                }),
        }
    }

    /// Reset one counter. Returns whether it existed.
    pub fn clear(&self, identity: &str, scope: Scope) -> bool {
        self.lock().remove(&(identity.to_string(), scope)).is_some()
    }

    /// Reset every counter of `identity`.
    pub fn clear_identity(&self, identity: &str) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|(id, _), _| id != identity);
        before - windows.len()
    }

    pub fn clear_all(&self) -> usize {
        let mut windows = self.lock();
        let cleared = windows.len();
        windows.clear();
        cleared
    }

    /// Drop windows whose period has elapsed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.lock();
        Self::prune(&mut windows, &self.limits, now)
    }

    /// Number of live counters.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn prune(
        windows: &mut HashMap<WindowKey, Window>,
        limits: &HashMap<Scope, RateLimit>,
        now: DateTime<Utc>,
    ) -> usize {
        let before = windows.len();
        windows.retain(|(_, scope), window| {
            limits
                .get(scope)
                .is_none_or(|limit| now < window.start + limit.window())
        });
        before - windows.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WindowKey, Window>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
