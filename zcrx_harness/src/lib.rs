// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A harness for validating a NIC's zero-copy receive offload path.
//!
//! The harness drives a device through ring, header-data-split, and
//! flow-steering configuration changes, runs an `iou-zcrx` producer/consumer
//! workload over the configured path, and restores every setting to its
//! pre-test value, in reverse order of application, on every exit path.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod env;
mod ethtool;
mod resources;
mod rollback;
mod scenario;
mod steering;
mod tracing;
pub mod workload;

pub use crate::tracing::try_init_tracing;
pub use env::Target;
pub use env::TestEnvironment;
pub use env::ToolError;
pub use ethtool::DataSplitMode;
pub use ethtool::EthtoolClient;
pub use ethtool::ParseError;
pub use ethtool::ReadError;
pub use ethtool::RingConfig;
pub use resources::reserve_port;
pub use resources::ChannelPlan;
pub use resources::InsufficientChannels;
pub use resources::PortLease;
pub use rollback::RollbackStack;
pub use scenario::DeviceState;
pub use scenario::Scenario;
pub use scenario::ScenarioError;
pub use scenario::SkipReason;
pub use steering::FlowSteering;
pub use steering::RssContext;
pub use steering::SteeringRule;
pub use workload::WorkloadError;
