// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed wrappers over the `ethtool` device settings tool.

use crate::env::run_capture;
use crate::env::Target;
use crate::env::ToolError;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to locate an expected value in the tool's output.
///
/// Distinct from [`ToolError`]: the tool ran and exited zero, but its output
/// did not contain what the caller needed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// An expected value was absent from the output.
    #[error("no {what} in output of `{command}`")]
    Missing {
        /// What was being looked for.
        what: String,
        /// The command line whose output was searched.
        command: String,
    },
    /// The tool's JSON output did not decode.
    #[error("malformed json from `{command}`")]
    Json {
        /// The command line whose output was decoded.
        command: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Error reading a structured value from the settings tool.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The tool invocation itself failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// The tool ran but its output was missing the expected value.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Header/data split mode of the receive ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSplitMode {
    /// Always split protocol headers from payload.
    On,
    /// The device decides.
    Auto,
}

impl DataSplitMode {
    fn as_str(&self) -> &'static str {
        match self {
            DataSplitMode::On => "on",
            DataSplitMode::Auto => "auto",
        }
    }
}

impl fmt::Display for DataSplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receive ring configuration, as reported by `ethtool --json -g`.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RingConfig {
    /// Receive ring size, in descriptors.
    pub rx: u32,
    /// Header/data split threshold, in bytes.
    #[serde(rename = "hds-thresh")]
    pub hds_thresh: u32,
    /// Header/data split mode.
    #[serde(rename = "tcp-data-split")]
    pub tcp_data_split: DataSplitMode,
}

/// Typed access to one interface's settings.
///
/// Every method maps to a single tool invocation; mutations report success
/// through the exit status, reads parse an identifier out of the output.
#[derive(Clone, Debug)]
pub struct EthtoolClient {
    program: PathBuf,
    ifname: String,
    target: Target,
}

impl EthtoolClient {
    /// Creates a client for `ifname` on `target`, invoking `program`.
    pub fn new(program: impl Into<PathBuf>, ifname: impl Into<String>, target: Target) -> Self {
        Self {
            program: program.into(),
            ifname: ifname.into(),
            target,
        }
    }

    fn output(&self, args: &[&str]) -> Result<String, ToolError> {
        run_capture(
            self.target
                .command(&self.program.to_string_lossy(), args.iter().copied()),
        )
    }

    fn cmdline(&self, args: &[&str]) -> String {
        let mut line = self.program.display().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Reads the ring configuration (`--json -g`).
    pub fn ring_config(&self) -> Result<RingConfig, ReadError> {
        let args = ["--json", "-g", self.ifname.as_str()];
        let output = self.output(&args)?;
        let rings: Vec<RingConfig> =
            serde_json::from_str(&output).map_err(|source| ParseError::Json {
                command: self.cmdline(&args),
                source,
            })?;
        rings
            .into_iter()
            .next()
            .ok_or_else(|| {
                ParseError::Missing {
                    what: "ring configuration object".to_string(),
                    command: self.cmdline(&args),
                }
                .into()
            })
    }

    /// Reads the current combined channel count (`-l`).
    ///
    /// The first `Combined:` line reports the preset maximum; the second is
    /// the current value.
    pub fn combined_channels(&self) -> Result<u32, ReadError> {
        let args = ["-l", self.ifname.as_str()];
        let output = self.output(&args)?;
        integers_after(&output, "Combined:")
            .get(1)
            .copied()
            .ok_or_else(|| {
                ParseError::Missing {
                    what: "second integer after `Combined:`".to_string(),
                    command: self.cmdline(&args),
                }
                .into()
            })
    }

    /// Sets the receive ring size (`-G rx`).
    pub fn set_ring_size(&self, rx: u32) -> Result<(), ToolError> {
        let rx = rx.to_string();
        self.output(&["-G", self.ifname.as_str(), "rx", rx.as_str()])
            .map(drop)
    }

    /// Sets the header/data split threshold (`-G hds-thresh`).
    pub fn set_hds_thresh(&self, thresh: u32) -> Result<(), ToolError> {
        let thresh = thresh.to_string();
        self.output(&["-G", self.ifname.as_str(), "hds-thresh", thresh.as_str()])
            .map(drop)
    }

    /// Sets the header/data split mode (`-G tcp-data-split`).
    pub fn set_data_split(&self, mode: DataSplitMode) -> Result<(), ToolError> {
        self.output(&["-G", self.ifname.as_str(), "tcp-data-split", mode.as_str()])
            .map(drop)
    }

    /// Spreads default rss traffic over the first `n` channels (`-X equal`).
    pub fn set_rss_spread(&self, n: u32) -> Result<(), ToolError> {
        let n = n.to_string();
        self.output(&["-X", self.ifname.as_str(), "equal", n.as_str()])
            .map(drop)
    }

    /// Restores the default rss spread (`-X default`).
    pub fn reset_rss_spread(&self) -> Result<(), ToolError> {
        self.output(&["-X", self.ifname.as_str(), "default"]).map(drop)
    }

    /// Allocates a one-channel rss context anchored at `channel`, returning
    /// the context id assigned by the tool.
    pub fn create_rss_context(&self, channel: u32) -> Result<u32, ReadError> {
        let channel = channel.to_string();
        let args = [
            "-X",
            self.ifname.as_str(),
            "context",
            "new",
            "start",
            channel.as_str(),
            "equal",
            "1",
        ];
        let output = self.output(&args)?;
        integers_after(&output, "New RSS context is")
            .first()
            .copied()
            .ok_or_else(|| {
                ParseError::Missing {
                    what: "integer after `New RSS context is`".to_string(),
                    command: self.cmdline(&args),
                }
                .into()
            })
    }

    /// Deletes an rss context.
    pub fn delete_rss_context(&self, context: u32) -> Result<(), ToolError> {
        let context = context.to_string();
        self.output(&[
            "-X",
            self.ifname.as_str(),
            "delete",
            "context",
            context.as_str(),
        ])
        .map(drop)
    }

    /// Routes tcp6 traffic for `port` straight to `channel` (`-N ...
    /// action`), returning the rule id assigned by the tool.
    pub fn create_flow_rule(&self, port: u16, channel: u32) -> Result<u32, ReadError> {
        let port = port.to_string();
        let channel = channel.to_string();
        let args = [
            "-N",
            self.ifname.as_str(),
            "flow-type",
            "tcp6",
            "dst-port",
            port.as_str(),
            "action",
            channel.as_str(),
        ];
        self.rule_id(&args)
    }

    /// Routes tcp6 traffic for `port` to an rss context (`-N ... context`),
    /// returning the rule id assigned by the tool.
    pub fn create_context_flow_rule(&self, port: u16, context: u32) -> Result<u32, ReadError> {
        let port = port.to_string();
        let context = context.to_string();
        let args = [
            "-N",
            self.ifname.as_str(),
            "flow-type",
            "tcp6",
            "dst-port",
            port.as_str(),
            "context",
            context.as_str(),
        ];
        self.rule_id(&args)
    }

    /// Deletes a flow-steering rule.
    pub fn delete_flow_rule(&self, rule: u32) -> Result<(), ToolError> {
        let rule = rule.to_string();
        self.output(&["-N", self.ifname.as_str(), "delete", rule.as_str()])
            .map(drop)
    }

    fn rule_id(&self, args: &[&str]) -> Result<u32, ReadError> {
        let output = self.output(args)?;
        integers_after(&output, "ID").first().copied().ok_or_else(|| {
            ParseError::Missing {
                what: "integer after `ID`".to_string(),
                command: self.cmdline(args),
            }
            .into()
        })
    }
}

/// Returns every integer that immediately follows `label` in `output`.
fn integers_after(output: &str, label: &str) -> Vec<u32> {
    let mut values = Vec::new();
    for (pos, _) in output.match_indices(label) {
        let rest = output[pos + label.len()..].trim_start();
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if let Ok(value) = rest[..end].parse() {
            values.push(value);
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::integers_after;
    use super::DataSplitMode;
    use super::RingConfig;

    const CHANNELS_OUTPUT: &str = "\
Channel parameters for eth0:
Pre-set maximums:
RX:\t\tn/a
TX:\t\tn/a
Other:\t\t1
Combined:\t8
Current hardware settings:
RX:\t\tn/a
TX:\t\tn/a
Other:\t\t1
Combined:\t4
";

    #[test]
    fn second_combined_value_is_the_current_count() {
        assert_eq!(integers_after(CHANNELS_OUTPUT, "Combined:"), vec![8, 4]);
    }

    #[test]
    fn context_id_parses_from_tool_phrasing() {
        assert_eq!(
            integers_after("New RSS context is 1\n", "New RSS context is"),
            vec![1]
        );
    }

    #[test]
    fn rule_id_parses_from_tool_phrasing() {
        assert_eq!(
            integers_after("Added rule with ID 1000\n", "ID"),
            vec![1000]
        );
    }

    #[test]
    fn missing_label_yields_nothing() {
        assert!(integers_after("RX flow hash indirection table:\n", "ID").is_empty());
    }

    #[test]
    fn ring_config_decodes_json() {
        let output = r#"[ {
            "ifname": "eth0",
            "rx": 1024,
            "rx-mini": 0,
            "rx-jumbo": 0,
            "tx": 1024,
            "hds-thresh": 1536,
            "hds-thresh-max": 4096,
            "tcp-data-split": "auto"
        } ]"#;
        let rings: Vec<RingConfig> = serde_json::from_str(output).unwrap();
        let ring = rings[0];
        assert_eq!(ring.rx, 1024);
        assert_eq!(ring.hds_thresh, 1536);
        assert_eq!(ring.tcp_data_split, DataSplitMode::Auto);
    }

    #[test]
    fn data_split_mode_round_trips() {
        assert_eq!(DataSplitMode::On.to_string(), "on");
        assert_eq!(DataSplitMode::Auto.to_string(), "auto");
        let mode: DataSplitMode = serde_json::from_str("\"on\"").unwrap();
        assert_eq!(mode, DataSplitMode::On);
    }
}
