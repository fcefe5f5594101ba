// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod document;
pub mod elastic;
pub mod errors;
pub mod flow;
pub mod logger;
pub mod normalizer;
pub mod partition;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod shutdown;
pub mod spool;
pub mod store;
pub mod tokenizer;
pub mod watchdog;
