// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flow-steering rules and rss contexts, paired with their teardown.

use crate::ethtool::EthtoolClient;
use crate::ethtool::ReadError;
use crate::rollback::RollbackStack;

/// A flow-steering rule, identified by the tool-assigned id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SteeringRule {
    /// Rule id, used for deletion.
    pub id: u32,
}

/// A receive-side-scaling context spanning one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RssContext {
    /// Context id, used for deletion and for context-backed rules.
    pub id: u32,
}

/// Creates steering objects, registering each deletion for rollback at the
/// moment of creation.
///
/// Deletion order falls out of the rollback stack's LIFO discipline: a rule
/// created after a context is deleted before it, so a context is never torn
/// down while a rule still references it.
pub struct FlowSteering {
    ethtool: EthtoolClient,
}

impl FlowSteering {
    /// Creates a manager driving `ethtool`.
    pub fn new(ethtool: EthtoolClient) -> Self {
        Self { ethtool }
    }

    /// Routes tcp6 traffic for `port` straight to `channel`.
    pub fn direct_rule(
        &self,
        rollback: &mut RollbackStack,
        port: u16,
        channel: u32,
    ) -> Result<SteeringRule, ReadError> {
        let id = self.ethtool.create_flow_rule(port, channel)?;
        tracing::info!(id, port, channel, "installed flow rule");
        let ethtool = self.ethtool.clone();
        rollback.push(format!("delete flow rule {id}"), move || {
            ethtool.delete_flow_rule(id)?;
            Ok(())
        });
        Ok(SteeringRule { id })
    }

    /// Allocates a one-channel rss context anchored at `channel`.
    pub fn rss_context(
        &self,
        rollback: &mut RollbackStack,
        channel: u32,
    ) -> Result<RssContext, ReadError> {
        let id = self.ethtool.create_rss_context(channel)?;
        tracing::info!(id, channel, "created rss context");
        let ethtool = self.ethtool.clone();
        rollback.push(format!("delete rss context {id}"), move || {
            ethtool.delete_rss_context(id)?;
            Ok(())
        });
        Ok(RssContext { id })
    }

    /// Routes tcp6 traffic for `port` to an rss context.
    ///
    /// Call after [`FlowSteering::rss_context`]; the stack then deletes this
    /// rule before the context it references.
    pub fn context_rule(
        &self,
        rollback: &mut RollbackStack,
        port: u16,
        context: RssContext,
    ) -> Result<SteeringRule, ReadError> {
        let id = self.ethtool.create_context_flow_rule(port, context.id)?;
        tracing::info!(id, port, context = context.id, "installed context flow rule");
        let ethtool = self.ethtool.clone();
        rollback.push(format!("delete flow rule {id}"), move || {
            ethtool.delete_flow_rule(id)?;
            Ok(())
        });
        Ok(SteeringRule { id })
    }
}
