// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::sync::Arc;

use forge_model::{
    ClientId, CompilationReply, CompilationRequest, FailureCode, Message, MessageType,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::frame::{read_frame, write_frame};

/// Byte-stream the endpoint runs over: plain TCP or a TLS wrap of it.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Seam through which a stream observes the class-unload gate of the session
/// it is currently bound to. A pending writer turns every non-terminal send
/// into `CompilationInterrupted` so no new blocking I/O starts on a session
/// about to be reset.
pub trait InterruptProbe: Send + Sync {
    fn unload_pending(&self) -> bool;
}

/// First message of a connection turn, as validated by
/// [`ServerStream::read_compile_request`].
pub enum IncomingRequest {
    Compile(CompilationRequest),
    /// Administrative request for the method list of a named AOT cache.
    AotCacheMap { cache_name: String },
}

/// One server-side client connection. Owns the socket, tracks
/// the last outgoing type so replies can be matched, and carries the
/// session's interrupt probe while a compilation is in flight.
pub struct ServerStream {
    io: Box<dyn Conn>,
    version_tag: u64,
    peer: String,
    last_sent: Option<MessageType>,
    probe: Option<Arc<dyn InterruptProbe>>,
    client_id: Option<ClientId>,
}

impl ServerStream {
    pub fn new(io: Box<dyn Conn>, version_tag: u64, peer: String) -> Self {
        Self {
            io,
            version_tag,
            peer,
            last_sent: None,
            probe: None,
            client_id: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_client_id(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn bind_session_probe(&mut self, probe: Arc<dyn InterruptProbe>) {
        self.probe = Some(probe);
    }

    pub fn clear_session_probe(&mut self) {
        self.probe = None;
    }

    /// Frames and transmits one message. Non-terminal sends are refused with
    /// `CompilationInterrupted` while a class-unload writer is waiting.
    pub async fn write(&mut self, message: &Message) -> Result<(), StreamError> {
        let message_type = message.message_type();
        if !message_type.is_terminal_reply() {
            if let Some(probe) = &self.probe {
                if probe.unload_pending() {
                    debug!("[Stream] {:?} refused, class unload pending", message_type);
                    return Err(StreamError::CompilationInterrupted);
                }
            }
        }

        write_frame(&mut self.io, message, self.version_tag).await?;
        self.last_sent = Some(message_type);
        Ok(())
    }

    /// Blocks until the reply to the last outgoing fetch arrives. Interrupt
    /// and teardown control frames surface as their distinguished errors;
    /// any other type must match the expected reply type.
    pub async fn read(&mut self) -> Result<Message, StreamError> {
        let frame = read_frame(&mut self.io).await?;
        let message = frame.decode()?;

        match &message {
            Message::CompilationInterrupted => return Err(StreamError::Interrupted),
            Message::ConnectionTerminate => return Err(StreamError::ConnectionTerminate),
            _ => {}
        }

        let expected = self.last_sent.and_then(Message::reply_type_for);
        if expected != Some(message.message_type()) {
            return Err(StreamError::TypeMismatch {
                expected,
                actual: message.message_type(),
            });
        }
        Ok(message)
    }

    /// Reads the first message of a request turn: validates the wire version
    /// tag, recognizes the teardown messages, and insists on a compilation
    /// request (or the AOT-cache-map administrative request).
    pub async fn read_compile_request(&mut self) -> Result<IncomingRequest, StreamError> {
        let frame = read_frame(&mut self.io).await?;
        if frame.version_tag != 0 && frame.version_tag != self.version_tag {
            return Err(StreamError::VersionIncompatible {
                ours: self.version_tag,
                theirs: frame.version_tag,
            });
        }

        match frame.decode()? {
            Message::ConnectionTerminate => Err(StreamError::ConnectionTerminate),
            Message::ClientSessionTerminate { client_id } => {
                Err(StreamError::ClientSessionTerminate(client_id))
            }
            Message::CompilationRequest(request) => Ok(IncomingRequest::Compile(request)),
            Message::AotCacheMapRequest { cache_name } => {
                Ok(IncomingRequest::AotCacheMap { cache_name })
            }
            other => Err(StreamError::TypeMismatch {
                expected: Some(MessageType::CompilationRequest),
                actual: other.message_type(),
            }),
        }
    }

    /// Terminal failure reply. Best effort: a send failure here is logged
    /// and swallowed because the request is being aborted anyway.
    pub async fn write_error(&mut self, code: FailureCode, detail: u64) {
        let message = Message::CompilationFailure { code, detail };
        if let Err(e) = self.write(&message).await {
            warn!("[Stream] could not write error {:?} to {}: {}", code, self.peer, e);
        }
    }

    /// Terminal success reply; same best-effort contract as `write_error`.
    pub async fn finish_compilation(&mut self, reply: CompilationReply) {
        let message = Message::CompilationCode(reply);
        if let Err(e) = self.write(&message).await {
            warn!("[Stream] could not finish compilation for {}: {}", self.peer, e);
        }
    }
}

/// Client-side counterpart, used by the test harness and by client VMs.
/// Performs no type matching of its own: a client drives the protocol and
/// decides what it expects next.
pub struct ClientStream {
    io: Box<dyn Conn>,
    version_tag: u64,
}

impl ClientStream {
    pub async fn connect(addr: &str, version_tag: u64) -> Result<Self, StreamError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { io: Box::new(stream), version_tag })
    }

    pub fn from_io(io: Box<dyn Conn>, version_tag: u64) -> Self {
        Self { io, version_tag }
    }

    /// Overrides the tag stamped on outgoing frames. Tests use this to
    /// provoke the server's version check.
    pub fn set_version_tag(&mut self, version_tag: u64) {
        self.version_tag = version_tag;
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), StreamError> {
        write_frame(&mut self.io, message, self.version_tag).await
    }

    pub async fn recv(&mut self) -> Result<Message, StreamError> {
        read_frame(&mut self.io).await?.decode()
    }
}
