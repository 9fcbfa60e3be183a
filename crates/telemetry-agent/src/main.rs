// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use agent_egress::{
    app::EgressApp,
    config::AgentConfig,
    health::Registrar,
    metrics::Registry,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("AGENT_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}. Shutting down telemetry agent.");
            return;
        }
    };
    debug!("Starting telemetry agent egress to {}", config.router_addr);

    let health = Arc::new(Registrar::default());
    let metrics = Arc::new(Registry::default());

    let buffer = EgressApp::new(config, health.clone(), metrics.clone()).start();
    info!(
        "Telemetry agent started with a buffer of {} envelopes",
        buffer.capacity()
    );

    let mut health_interval = interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = health_interval.tick() => {
                debug!("Health: {:?}", health.snapshot());
                for counter in metrics.counters() {
                    debug!(
                        "Metric {} {:?}: {}",
                        counter.name(),
                        counter.options().tags,
                        counter.take_delta()
                    );
                }
                for gauge in metrics.gauges() {
                    debug!("Metric {} ({}): {}", gauge.name(), gauge.unit(), gauge.value());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down telemetry agent");
                break;
            }
        }
    }
}
