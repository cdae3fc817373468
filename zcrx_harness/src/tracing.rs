// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::util::TryInitError;

/// Installs the harness tracing subscriber.
///
/// Level targets come from the `ZCRX_LOG` environment variable when set,
/// defaulting to DEBUG.
pub fn try_init_tracing() -> Result<(), TryInitError> {
    let targets = if let Ok(var) = std::env::var("ZCRX_LOG") {
        var.parse().unwrap()
    } else {
        Targets::new().with_default(LevelFilter::DEBUG)
    };
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false) // avoid polluting captured logs with escape sequences
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(targets)
        .try_init()
}
