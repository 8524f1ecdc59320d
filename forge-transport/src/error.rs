// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use forge_model::{ClientId, MessageType};

/// Transport-level error taxonomy. Each variant maps onto one row of the
/// failure table the request processor acts on; nothing here is recoverable
/// inside the stream itself.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Socket-level failure: the connection is unusable and must be dropped.
    #[error("stream failure: {0}")]
    Failure(#[from] std::io::Error),

    /// The client sent an explicit connection teardown.
    #[error("connection terminated by client")]
    ConnectionTerminate,

    /// The client asked for its whole session to be dropped.
    #[error("client session {0} terminated by client")]
    ClientSessionTerminate(ClientId),

    /// The client interrupted the in-flight compilation.
    #[error("stream interrupted by client")]
    Interrupted,

    /// A class-unload writer is waiting on this session; the compilation
    /// must abandon non-terminal I/O so the caches can be reset.
    #[error("compilation interrupted by pending class unload")]
    CompilationInterrupted,

    #[error("wire version incompatible: ours={ours:#018x} theirs={theirs:#018x}")]
    VersionIncompatible { ours: u64, theirs: u64 },

    #[error("message type mismatch: expected {expected:?}, received {actual:?}")]
    TypeMismatch {
        expected: Option<MessageType>,
        actual: MessageType,
    },

    /// Undecodable frame: unknown tag, oversized length or payload that
    /// fails validation. Treated like a stream failure by callers.
    #[error("malformed frame: {0}")]
    Corrupt(String),
}

impl StreamError {
    /// True when the peer connection cannot carry further traffic.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, StreamError::CompilationInterrupted)
    }
}
