// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the relay.
//!
//! Configuration and connection errors are fatal to the pipeline that hits them. Transient
//! publish failures never surface here: they are reported per message through
//! [`crate::publisher::SendOutcome`].

use std::path::PathBuf;

/// Failure to load a credential resource. No partial record exists when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("File [{}] not found.", resource.display())]
    NotFound { resource: PathBuf },

    #[error("File [{}] has wrong format at line {line}. Please use: {expected}", resource.display())]
    Malformed {
        resource: PathBuf,
        line: usize,
        expected: &'static str,
    },

    #[error("File [{}] could not be read: {source}", resource.display())]
    Io {
        resource: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FirehoseError {
    #[error("Failed to build firehose HTTP client: {0}")]
    Client(String),

    #[error("Failed to connect to firehose endpoint {endpoint}: {cause}")]
    Connect { endpoint: String, cause: String },

    #[error("Firehose endpoint {endpoint} refused the stream with status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Firehose stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to create log producer: {0}")]
    Client(String),

    #[error("Failed to enqueue message for the log: {0}")]
    Enqueue(String),

    #[error("Failed to flush log producer: {0}")]
    Flush(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("Failed to create log consumer: {0}")]
    Client(String),

    #[error("Failed to subscribe to topic {topic}: {cause}")]
    Subscribe { topic: String, cause: String },

    #[error("Failed to poll the log: {0}")]
    Poll(String),

    #[error("Failed to store offset {offset} for {topic}/{partition}: {cause}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        cause: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Failed to build index HTTP client: {0}")]
    Client(String),

    #[error("Index request to {url} failed: {cause}")]
    Transport { url: String, cause: String },

    #[error("Index rejected document with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Index response did not contain a document id: {0}")]
    MissingId(String),

    #[error("Index client is closed")]
    Closed,
}

/// Reasons an index writer run ends with an error. The index client has already been closed.
#[derive(Debug, thiserror::Error)]
pub enum IndexWriterError {
    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Top-level error returned by the lifecycle coordinator.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Firehose(#[from] FirehoseError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    IndexWriter(#[from] IndexWriterError),
}
