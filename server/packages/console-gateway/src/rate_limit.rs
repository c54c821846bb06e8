use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use console_gateway_error::GatewayError;

use crate::config::{GatewayConfig, RateLimit};

/// Prune expired windows once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// The privileged operation classes gated by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    File,
    Chat,
    Terminal,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::File => "file",
            Capability::Chat => "chat",
            Capability::Terminal => "terminal",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-identity, per-capability fixed-window counters.
#[derive(Debug)]
pub struct RateLimiter {
    chat: RateLimit,
    terminal: RateLimit,
    windows: Mutex<HashMap<(String, Capability), Window>>,
}

impl RateLimiter {
    pub fn new(chat: RateLimit, terminal: RateLimit) -> Self {
        Self {
            chat,
            terminal,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.chat_rate_limit, config.terminal_rate_limit)
    }

    fn limit_for(&self, capability: Capability) -> Option<RateLimit> {
        match capability {
            Capability::File => None,
            Capability::Chat => Some(self.chat),
            Capability::Terminal => Some(self.terminal),
        }
    }

    pub fn check(&self, email: &str, capability: Capability) -> Result<(), GatewayError> {
        self.check_at(email, capability, Instant::now())
    }

    /// Counts one request against the window and fails once the window's
    /// budget is spent. A rejected request does not consume budget.
    pub fn check_at(
        &self,
        email: &str,
        capability: Capability,
        now: Instant,
    ) -> Result<(), GatewayError> {
        let Some(limit) = self.limit_for(capability) else {
            return Ok(());
        };

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|(_, capability), window| {
                let window_len = self
                    .limit_for(*capability)
                    .map(|limit| limit.window)
                    .unwrap_or_default();
                now.saturating_duration_since(window.started) < window_len
            });
        }

        let window = windows
            .entry((email.to_string(), capability))
            .or_insert(Window {
                started: now,
                count: 0,
            });
        if now.saturating_duration_since(window.started) >= limit.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= limit.max_requests {
            let elapsed = now.saturating_duration_since(window.started);
            let retry_after = limit.window.saturating_sub(elapsed);
            tracing::warn!(
                email = %email,
                capability = %capability,
                limit = limit.max_requests,
                "rate limit exceeded"
            );
            return Err(GatewayError::RateLimited {
                capability: capability.to_string(),
                retry_after_secs: ceil_secs(retry_after),
            });
        }
        window.count += 1;
        Ok(())
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
