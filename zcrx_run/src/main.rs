// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs the zero-copy receive validation scenarios against a device.

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use zcrx_harness::Scenario;
use zcrx_harness::Target;
use zcrx_harness::TestEnvironment;

/// Exit code reserved for a skipped test run.
const EXIT_SKIP: u8 = 4;

#[derive(Parser)]
#[clap(about = "Validate a NIC's zero-copy receive path")]
struct Options {
    /// Network interface under test, on the target host.
    #[clap(long, short = 'i', env = "NETIF")]
    interface: String,
    /// ssh destination of the machine hosting the device; omit to run
    /// everything locally.
    #[clap(long, env = "REMOTE_HOST")]
    remote: Option<String>,
    /// IPv6 address of the target interface.
    #[clap(long, env = "REMOTE_V6")]
    remote_addr: Option<Ipv6Addr>,
    /// Path to the iou-zcrx workload binary.
    #[clap(long, env = "ZCRX_BIN")]
    workload: PathBuf,
    /// Path to the device settings tool.
    #[clap(long, default_value = "ethtool")]
    ethtool: PathBuf,
    /// Which scenario to run.
    #[clap(long, value_enum, default_value = "all")]
    scenario: ScenarioArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScenarioArg {
    All,
    Baseline,
    Oneshot,
    Rss,
}

impl ScenarioArg {
    fn scenarios(self) -> Vec<Scenario> {
        match self {
            ScenarioArg::All => Scenario::ALL.to_vec(),
            ScenarioArg::Baseline => vec![Scenario::Baseline],
            ScenarioArg::Oneshot => vec![Scenario::OneShot],
            ScenarioArg::Rss => vec![Scenario::Rss],
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let opts = Options::parse();
    zcrx_harness::try_init_tracing().context("failed to initialize tracing")?;

    let target = match opts.remote {
        Some(host) => Target::Ssh { host },
        None => Target::Local,
    };
    let mut env = TestEnvironment::new(opts.interface, target, opts.workload);
    env.remote_addr = opts.remote_addr;
    env.ethtool = opts.ethtool;
    env.deploy().context("failed to deploy workload binary")?;

    let scenarios = opts.scenario.scenarios();
    let mut failed = false;
    let mut skipped = 0;
    for scenario in &scenarios {
        match scenario.run(&env) {
            Ok(()) => tracing::info!(scenario = scenario.name(), "ok"),
            Err(err) if err.is_skip() => {
                skipped += 1;
                tracing::warn!(
                    scenario = scenario.name(),
                    reason = format!("{err:#}").as_str(),
                    "skip"
                );
            }
            Err(err) => {
                failed = true;
                tracing::error!(
                    scenario = scenario.name(),
                    error = format!("{err:#}").as_str(),
                    "fail"
                );
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else if skipped == scenarios.len() {
        ExitCode::from(EXIT_SKIP)
    } else {
        ExitCode::SUCCESS
    })
}
