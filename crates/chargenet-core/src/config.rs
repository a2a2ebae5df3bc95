//! Node configuration
//!
//! All tunables of a node in one serde-serializable structure, with presets for
//! common deployments and a `validate` pass run by the node builder.

use core::time::Duration;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::envelope::DEFAULT_REQUEST_TIMEOUT;
use crate::errors::ConfigError;
use crate::types::NodeId;

// ----------------------------------------------------------------------------
// Request Configuration
// ----------------------------------------------------------------------------

/// Outbound request behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Budget for calls that do not specify one
    pub default_timeout: Duration,
    /// Longest a sender waits for the per-connection send lock
    pub send_lock_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            send_lock_timeout: Duration::from_secs(5),
        }
    }
}

impl RequestConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            default_timeout: Duration::from_secs(2),
            send_lock_timeout: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// Forwarding Configuration
// ----------------------------------------------------------------------------

/// Decision applied when no filter produced one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultDecision {
    #[default]
    Forward,
    Reject,
}

/// How one authoritative decision is chosen among concurrently running filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSelection {
    /// First filter to finish wins; the rest are aborted
    #[default]
    FirstCompleted,
    /// All filters run; Reject beats Replace beats Forward
    MostRestrictive,
    /// All filters run; the earliest registered filter's decision wins
    RegistrationOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub default_decision: DefaultDecision,
    pub filter_selection: FilterSelection,
    /// Upper bound on one fan-out stage (observers or filters)
    pub stage_timeout: Duration,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            default_decision: DefaultDecision::Forward,
            filter_selection: FilterSelection::FirstCompleted,
            stage_timeout: Duration::from_secs(5),
        }
    }
}

impl ForwardingConfig {
    /// Reject everything no filter explicitly allowed
    pub fn strict() -> Self {
        Self {
            default_decision: DefaultDecision::Reject,
            filter_selection: FilterSelection::MostRestrictive,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Size of the inbound worker pool
    pub max_concurrent_handlers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Late Responses
// ----------------------------------------------------------------------------

/// Treatment of replies whose request is no longer pending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LateResponsePolicy {
    /// Drop with a warning
    #[default]
    Log,
    /// Drop silently
    Discard,
}

// ----------------------------------------------------------------------------
// Node Configuration
// ----------------------------------------------------------------------------

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub request: RequestConfig,
    pub forwarding: ForwardingConfig,
    pub dispatch: DispatchConfig,
    pub late_response: LateResponsePolicy,
    /// Inbound frames above this size are rejected as formation violations
    pub max_frame_size: usize,
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            request: RequestConfig::default(),
            forwarding: ForwardingConfig::default(),
            dispatch: DispatchConfig::default(),
            late_response: LateResponsePolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create configuration optimized for testing
    pub fn testing(node_id: NodeId) -> Self {
        Self {
            request: RequestConfig::testing(),
            dispatch: DispatchConfig {
                max_concurrent_handlers: 8,
            },
            ..Self::new(node_id)
        }
    }

    /// Networking node that refuses anything its filters did not clear
    pub fn relay(node_id: NodeId) -> Self {
        Self {
            forwarding: ForwardingConfig::strict(),
            dispatch: DispatchConfig {
                max_concurrent_handlers: 256,
            },
            ..Self::new(node_id)
        }
    }

    pub fn with_request(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.request.default_timeout = timeout;
        self
    }

    pub fn with_forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = forwarding;
        self
    }

    pub fn with_default_decision(mut self, decision: DefaultDecision) -> Self {
        self.forwarding.default_decision = decision;
        self
    }

    pub fn with_filter_selection(mut self, selection: FilterSelection) -> Self {
        self.forwarding.filter_selection = selection;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_late_response(mut self, policy: LateResponsePolicy) -> Self {
        self.late_response = policy;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };
        if self.request.default_timeout.is_zero() {
            return invalid("default request timeout cannot be zero");
        }
        if self.request.send_lock_timeout.is_zero() {
            return invalid("send lock timeout cannot be zero");
        }
        if self.forwarding.stage_timeout.is_zero() {
            return invalid("stage timeout cannot be zero");
        }
        if self.dispatch.max_concurrent_handlers == 0 {
            return invalid("max concurrent handlers cannot be zero");
        }
        if self.max_frame_size == 0 {
            return invalid("max frame size cannot be zero");
        }
        Ok(())
    }

    pub fn into_shared(self) -> SharedNodeConfig {
        Arc::new(self)
    }
}

/// Arc-wrapped NodeConfig for sharing across tasks
pub type SharedNodeConfig = Arc<NodeConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::new("LC01").unwrap()
    }

    #[test]
    fn test_presets_validate() {
        assert!(NodeConfig::new(node()).validate().is_ok());
        assert!(NodeConfig::testing(node()).validate().is_ok());
        let relay = NodeConfig::relay(node());
        assert!(relay.validate().is_ok());
        assert_eq!(relay.forwarding.default_decision, DefaultDecision::Reject);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let config = NodeConfig::new(node()).with_default_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = NodeConfig::new(node()).with_dispatch(DispatchConfig {
            max_concurrent_handlers: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = NodeConfig::relay(node())
            .with_filter_selection(FilterSelection::RegistrationOrder)
            .with_late_response(LateResponsePolicy::Discard);
        let text = serde_json::to_string(&config).unwrap();
        let parsed: NodeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
