// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the egress pipeline together: buffer, transponder, counter
//! aggregation and the client pool behind it.

use crate::clientpool::{
    system_lookup, BalancedConnector, Balancer, ClientPool, ConnManager, ConnManagerConfig,
    Connector, Lookup, SenderFetcher,
};
use crate::config::AgentConfig;
use crate::counter_aggregator::CounterAggregator;
use crate::diode::EnvelopeBuffer;
use crate::health::HealthRegistrar;
use crate::metrics::{EnvelopeAverager, MetricClient, MetricOptions};
use crate::rpc::tcp::TcpDialer;
use crate::rpc::Dialer;
use crate::transponder::{Transponder, TransponderConfig, Writer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const AVERAGE_ENVELOPE_PERIOD: Duration = Duration::from_secs(60);

pub struct EgressApp {
    config: AgentConfig,
    health: Arc<dyn HealthRegistrar>,
    metrics: Arc<dyn MetricClient>,
    lookup: Lookup,
    dialer: Option<Arc<dyn Dialer>>,
}

impl EgressApp {
    pub fn new(
        config: AgentConfig,
        health: Arc<dyn HealthRegistrar>,
        metrics: Arc<dyn MetricClient>,
    ) -> Self {
        EgressApp {
            config,
            health,
            metrics,
            lookup: system_lookup(),
            dialer: None,
        }
    }

    /// Replaces the resolver used for collector addresses.
    pub fn with_lookup(mut self, lookup: Lookup) -> Self {
        self.lookup = lookup;
        self
    }

    /// Replaces the TCP transport.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Spawns the pipeline and returns the buffer producers write into.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Arc<EnvelopeBuffer> {
        let ingress_dropped = self.metrics.new_counter_metric(
            "dropped",
            MetricOptions::v2().with_tag("direction", "ingress"),
        );
        let buffer = Arc::new(EnvelopeBuffer::new(
            self.config.egress.buffer_size,
            move |missed| {
                warn!("Dropped {} envelopes", missed);
                ingress_dropped.increment(missed);
            },
        ));

        let pool = Arc::new(self.client_pool());
        pool.start();

        let writer: Arc<dyn Writer> = if self.config.egress.counter_aggregation {
            Arc::new(CounterAggregator::new(Arc::clone(&pool)))
        } else {
            pool
        };

        let transponder = Transponder::new(
            Arc::clone(&buffer),
            writer,
            TransponderConfig {
                batch_size: self.config.egress.batch_size,
                batch_interval: self.config.egress.batch_interval,
                idle_wait: self.config.egress.idle_wait,
                tags: self.config.tags.tags().clone(),
            },
            self.metrics.as_ref(),
        );
        tokio::spawn(transponder.start());

        buffer
    }

    fn client_pool(&self) -> ClientPool {
        let dialer = match &self.dialer {
            Some(dialer) => Arc::clone(dialer),
            None => {
                let averager = Arc::new(EnvelopeAverager::default());
                let gauge = self.metrics.new_gauge_metric(
                    "average_envelope",
                    "bytes/minute",
                    MetricOptions::v2().with_tag("loggregator", "v2"),
                );
                tokio::spawn(Arc::clone(&averager).run(AVERAGE_ENVELOPE_PERIOD, gauge));
                Arc::new(
                    TcpDialer::new(self.config.pool.dial_timeout)
                        .with_io_timeout(self.config.pool.io_timeout)
                        .with_averager(averager),
                )
            }
        };

        let mut balancers = Vec::with_capacity(2);
        if let Some(zone_addr) = &self.config.router_addr_with_az {
            balancers.push(Balancer::with_lookup(zone_addr.clone(), Arc::clone(&self.lookup)));
        }
        balancers.push(Balancer::with_lookup(
            self.config.router_addr.clone(),
            Arc::clone(&self.lookup),
        ));
        debug!("Connecting to collectors via {:?}", balancers);

        let fetcher = SenderFetcher::new(Arc::clone(&self.health), dialer);
        let connector: Arc<dyn Connector> = Arc::new(BalancedConnector::new(fetcher, balancers));

        let pool_config = &self.config.pool;
        let managers = (0..pool_config.connections)
            .map(|_| {
                ConnManager::new(
                    Arc::clone(&connector),
                    ConnManagerConfig::jittered(
                        pool_config.max_writes_base,
                        pool_config.max_writes_jitter,
                        pool_config.poll_interval,
                        pool_config.max_connection_age,
                    ),
                )
            })
            .collect();
        ClientPool::new(managers)
    }
}
