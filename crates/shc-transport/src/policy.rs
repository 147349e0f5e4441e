//! What the session does when its connection drops

use shc_core::config::TransportConfig;
use shc_core::{ShcError, ShcResult};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry with exponential backoff; after `max_attempts` consecutive
    /// failures the pending queue is discarded and the session stops.
    RetryThenStop {
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
    /// Give up on the first drop and ask the host to rebuild the whole
    /// client session.
    ReloadClient,
}

/// Why a session stopped for good; passed to the termination callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Retries exhausted after this many consecutive failed attempts.
    Stopped { attempts: u32 },
    /// The connection dropped under [`ReconnectPolicy::ReloadClient`].
    Reload,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default()).unwrap_or(ReconnectPolicy::ReloadClient)
    }
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &TransportConfig) -> ShcResult<Self> {
        match cfg.reconnect.as_str() {
            "retry" => Ok(ReconnectPolicy::RetryThenStop {
                max_attempts: cfg.max_reconnect_attempts,
                initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
                max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            }),
            "reload" => Ok(ReconnectPolicy::ReloadClient),
            other => Err(ShcError::Config(format!(
                "transport.reconnect must be \"retry\" or \"reload\", got {other:?}"
            ))),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::ReloadClient => None,
            ReconnectPolicy::RetryThenStop {
                max_attempts,
                initial_backoff,
                max_backoff,
            } => {
                if attempt == 0 || attempt > *max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                Some(initial_backoff.saturating_mul(factor).min(*max_backoff))
            }
        }
    }
}
