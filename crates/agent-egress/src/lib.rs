// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod app;
pub mod batching;
pub mod clientpool;
pub mod config;
pub mod counter_aggregator;
pub mod diode;
pub mod envelope;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod transponder;
