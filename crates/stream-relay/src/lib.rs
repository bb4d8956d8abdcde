// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming relay from a keyword-filtered firehose into a partitioned log, and from that log
//! into a search index.
//!
//! The ingest side connects a [`firehose::FirehoseClient`] to a bounded
//! [`intake_queue::IntakeQueue`] which a [`publisher::LogPublisher`] drains into the log. The
//! index side runs an [`index_writer::IndexWriter`] that reads the log and writes a bounded
//! number of documents. [`coordinator`] wires both sides to configuration and process signals.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod errors;
pub mod firehose;
mod http;
pub mod index;
pub mod index_writer;
pub mod intake_queue;
pub mod log_consumer;
pub mod publisher;
pub mod routing;

pub use config::RelayConfig;
pub use errors::RelayError;
