//! Node Builder API
//!
//! Collects handlers, relay pipelines, keys and static routes, then validates the
//! configuration and produces a [`Node`] ready to accept connections.

use std::sync::Arc;

use chargenet_core::{
    Action, ChargenetResult, DispatchTable, ForwardingTable, Handler, NodeConfig, NodeId,
    RelayPipeline, RouteTable, Signer, SigningBoundary, TrustPolicy,
};
use tracing::info;

use crate::node::Node;

// ----------------------------------------------------------------------------
// Node Builder
// ----------------------------------------------------------------------------

/// Builder for a [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    dispatch: DispatchTable,
    pipelines: Vec<(Action, Arc<dyn RelayPipeline>)>,
    fallback: Option<Arc<dyn RelayPipeline>>,
    signers: Vec<Arc<dyn Signer>>,
    trust: TrustPolicy,
    routes: Vec<(NodeId, NodeId)>,
}

impl NodeBuilder {
    /// Create a builder with default configuration for `node_id`
    pub fn new(node_id: NodeId) -> Self {
        Self {
            config: NodeConfig::new(node_id),
            dispatch: DispatchTable::new(),
            pipelines: Vec::new(),
            fallback: None,
            signers: Vec::new(),
            trust: TrustPolicy::default(),
            routes: Vec::new(),
        }
    }

    /// Replace the configuration; the node id is taken from `config`
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Serve `action` locally
    pub fn handler<H: Handler + 'static>(mut self, action: Action, handler: H) -> Self {
        self.dispatch.register(action, handler);
        self
    }

    /// Relay pipeline for requests carrying `action`
    pub fn pipeline<P: RelayPipeline + 'static>(mut self, action: Action, pipeline: P) -> Self {
        self.pipelines.push((action, Arc::new(pipeline)));
        self
    }

    /// Pipeline for relayed actions without a dedicated one
    pub fn fallback_pipeline<P: RelayPipeline + 'static>(mut self, pipeline: P) -> Self {
        self.fallback = Some(Arc::new(pipeline));
        self
    }

    /// Key used to sign every outbound envelope
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.push(signer);
        self
    }

    /// Keys and mode used to verify inbound envelopes
    pub fn trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.trust = policy;
        self
    }

    /// Static route: reach `destination` through the neighbour `next_hop`
    pub fn route(mut self, destination: NodeId, next_hop: NodeId) -> Self {
        self.routes.push((destination, next_hop));
        self
    }

    /// Validate the configuration and assemble the node
    pub fn build(self) -> ChargenetResult<Node> {
        self.config.validate()?;

        let mut forwarding = ForwardingTable::new(&self.config.forwarding);
        for (action, pipeline) in self.pipelines {
            forwarding.register(action, pipeline);
        }
        if let Some(fallback) = self.fallback {
            forwarding.set_fallback(fallback);
        }

        let signing = self
            .signers
            .into_iter()
            .fold(SigningBoundary::new(self.trust), |boundary, signer| {
                boundary.with_signer(signer)
            });

        let routes = RouteTable::new();
        for (destination, next_hop) in self.routes {
            routes.add_route(destination, next_hop);
        }

        info!(
            node = %self.config.node_id,
            handlers = self.dispatch.len(),
            routes = routes.len(),
            signers = signing.signer_count(),
            "Node built"
        );

        Ok(Node::from_parts(
            self.config.into_shared(),
            routes,
            self.dispatch,
            forwarding,
            signing,
        ))
    }
}
