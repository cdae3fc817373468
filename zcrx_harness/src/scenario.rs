// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The zero-copy receive validation scenarios.

use crate::env::TestEnvironment;
use crate::env::ToolError;
use crate::ethtool::DataSplitMode;
use crate::ethtool::EthtoolClient;
use crate::ethtool::ParseError;
use crate::ethtool::ReadError;
use crate::resources::reserve_port;
use crate::resources::ChannelPlan;
use crate::resources::InsufficientChannels;
use crate::rollback::RollbackStack;
use crate::steering::FlowSteering;
use crate::workload;
use crate::workload::Receiver;
use crate::workload::Sender;
use crate::workload::WorkloadError;
use thiserror::Error;

/// Receive ring size while a scenario is in flight.
const RING_SIZE: u32 = 64;
/// Transfer length for the baseline and rss variants.
const TRANSFER_LEN: u32 = 12840;
/// Transfer length for the one-shot variant.
const ONESHOT_TRANSFER_LEN: u32 = 4096;
/// Sender block size for the one-shot variant.
const ONESHOT_BLOCK: u32 = 16384;
/// Completion batch count for the one-shot variant.
const ONESHOT_BATCH: u32 = 4;

/// Why a scenario cannot run in this environment.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// The environment has no IPv6 address for the target interface.
    #[error("target interface has no IPv6 address")]
    NoIpv6,
    /// The device has too few combined channels.
    #[error(transparent)]
    Channels(#[from] InsufficientChannels),
}

/// A scenario outcome other than success.
///
/// Every variant except [`ScenarioError::Skip`] is a test failure. None of
/// them suppress rollback: by the time a caller sees this error, every
/// setting the scenario changed has already been restored.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The environment cannot host the scenario; not a failure.
    #[error("scenario skipped: {0}")]
    Skip(#[from] SkipReason),
    /// The settings tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// The settings tool's output was missing an expected value.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The workload did not complete successfully.
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    /// Port reservation failed.
    #[error("failed to reserve a port")]
    Port(#[source] std::io::Error),
}

impl ScenarioError {
    /// True if the scenario was skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, ScenarioError::Skip(_))
    }
}

impl From<ReadError> for ScenarioError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Tool(err) => err.into(),
            ReadError::Parse(err) => err.into(),
        }
    }
}

impl From<InsufficientChannels> for ScenarioError {
    fn from(err: InsufficientChannels) -> Self {
        ScenarioError::Skip(err.into())
    }
}

/// Device settings captured before any mutation; the rollback targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceState {
    /// Receive ring size.
    pub ring_size: u32,
    /// Header/data split threshold.
    pub hds_thresh: u32,
    /// Header/data split mode.
    pub data_split: DataSplitMode,
    /// Combined channel count.
    pub combined_channels: u32,
}

/// A zero-copy receive validation scenario.
///
/// All three share one skeleton and differ only in steering mode and
/// workload parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Direct port-to-channel rule, standard transfer size.
    Baseline,
    /// Same rule structure, but the receiver batches completions and the
    /// sender uses larger blocks.
    OneShot,
    /// Context-backed rule over a one-channel rss context.
    Rss,
}

impl Scenario {
    /// All scenarios, in run order.
    pub const ALL: [Scenario; 3] = [Scenario::Baseline, Scenario::OneShot, Scenario::Rss];

    /// Short name, usable in logs and on a command line.
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Baseline => "baseline",
            Scenario::OneShot => "oneshot",
            Scenario::Rss => "rss",
        }
    }

    fn transfer_len(&self) -> u32 {
        match self {
            Scenario::Baseline | Scenario::Rss => TRANSFER_LEN,
            Scenario::OneShot => ONESHOT_TRANSFER_LEN,
        }
    }

    fn block(&self) -> Option<u32> {
        match self {
            Scenario::OneShot => Some(ONESHOT_BLOCK),
            _ => None,
        }
    }

    fn batch(&self) -> Option<u32> {
        match self {
            Scenario::OneShot => Some(ONESHOT_BATCH),
            _ => None,
        }
    }

    /// Runs this scenario end to end against `env`.
    ///
    /// Whatever the outcome, every device mutation that was applied is
    /// rolled back, in reverse order of application, before this returns.
    pub fn run(&self, env: &TestEnvironment) -> Result<(), ScenarioError> {
        let addr = env.remote_addr.ok_or(SkipReason::NoIpv6)?;
        tracing::info!(
            scenario = self.name(),
            ifname = env.ifname.as_str(),
            "starting scenario"
        );

        let ethtool = EthtoolClient::new(
            env.ethtool.clone(),
            env.ifname.clone(),
            env.target.clone(),
        );

        // No mutation may precede this check: a device below the minimum is
        // skipped with its configuration untouched.
        let combined = ethtool.combined_channels()?;
        let plan = ChannelPlan::new(combined)?;
        let ring = ethtool.ring_config()?;
        let state = DeviceState {
            ring_size: ring.rx,
            hds_thresh: ring.hds_thresh,
            data_split: ring.tcp_data_split,
            combined_channels: combined,
        };
        tracing::debug!(?state, ?plan, "captured device state");

        let port = reserve_port().map_err(ScenarioError::Port)?;
        let mut rollback = RollbackStack::new();

        ethtool.set_data_split(DataSplitMode::On)?;
        rollback.push("restore tcp-data-split", {
            let ethtool = ethtool.clone();
            let mode = state.data_split;
            move || {
                ethtool.set_data_split(mode)?;
                Ok(())
            }
        });

        ethtool.set_hds_thresh(0)?;
        rollback.push("restore hds-thresh", {
            let ethtool = ethtool.clone();
            let thresh = state.hds_thresh;
            move || {
                ethtool.set_hds_thresh(thresh)?;
                Ok(())
            }
        });

        ethtool.set_ring_size(RING_SIZE)?;
        rollback.push("restore rx ring size", {
            let ethtool = ethtool.clone();
            let rx = state.ring_size;
            move || {
                ethtool.set_ring_size(rx)?;
                Ok(())
            }
        });

        // Keep default steering off the dedicated channel.
        ethtool.set_rss_spread(plan.combined - 1)?;
        rollback.push("restore rss spread", {
            let ethtool = ethtool.clone();
            move || {
                ethtool.reset_rss_spread()?;
                Ok(())
            }
        });

        let steering = FlowSteering::new(ethtool.clone());
        match self {
            Scenario::Baseline | Scenario::OneShot => {
                steering.direct_rule(&mut rollback, port.port(), plan.dedicated)?;
            }
            Scenario::Rss => {
                let context = steering.rss_context(&mut rollback, plan.dedicated)?;
                steering.context_rule(&mut rollback, port.port(), context)?;
            }
        }

        let receiver = Receiver {
            bin: env.receiver_bin.clone(),
            port: port.port(),
            ifname: env.ifname.clone(),
            channel: plan.dedicated,
            batch: self.batch(),
        };
        let sender = Sender {
            bin: env.sender_bin.clone(),
            addr,
            port: port.port(),
            length: self.transfer_len(),
            block: self.block(),
        };
        workload::run(env, &receiver, &sender)?;

        rollback.unwind_all();
        tracing::info!(scenario = self.name(), "scenario complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Scenario;

    #[test]
    fn baseline_and_rss_use_the_standard_transfer() {
        assert_eq!(Scenario::Baseline.transfer_len(), 12840);
        assert_eq!(Scenario::Rss.transfer_len(), 12840);
        assert_eq!(Scenario::Baseline.block(), None);
        assert_eq!(Scenario::Baseline.batch(), None);
    }

    #[test]
    fn oneshot_batches_completions_with_larger_blocks() {
        assert_eq!(Scenario::OneShot.transfer_len(), 4096);
        assert_eq!(Scenario::OneShot.block(), Some(16384));
        assert_eq!(Scenario::OneShot.batch(), Some(4));
    }

    #[test]
    fn names_are_stable() {
        let names: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["baseline", "oneshot", "rss"]);
    }
}
