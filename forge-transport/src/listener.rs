// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use socket2::SockRef;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::stream::ServerStream;
use crate::tls::TlsSettings;

const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: String,
    pub version_tag: u64,
    pub tls: Option<TlsSettings>,
}

/// Accept loop feeding the worker pool's queue. One connection becomes one
/// `ServerStream`; the bounded queue provides the back-pressure, and a full
/// queue sheds the connection rather than parking the accept loop.
pub struct CompileListener {
    listener: TcpListener,
    config: ListenerConfig,
}

impl CompileListener {
    pub async fn bind(config: ListenerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("[Listener] Accepting compilation requests at {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, queue: mpsc::Sender<ServerStream>) -> anyhow::Result<()> {
        let acceptor = match &self.config.tls {
            Some(settings) => Some(settings.acceptor()?),
            None => None,
        };

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[Listener] accept failed: {}", e);
                    continue;
                }
            };

            let sock_ref = SockRef::from(&stream);
            let _ = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
            let _ = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE);
            let _ = stream.set_nodelay(true);

            let server_stream = match &acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        ServerStream::new(Box::new(tls_stream), self.config.version_tag, peer.to_string())
                    }
                    Err(e) => {
                        // A failed handshake aborts the session before any frame is read.
                        warn!("[Listener] TLS handshake with {} failed: {}", peer, e);
                        continue;
                    }
                },
                None => ServerStream::new(Box::new(stream), self.config.version_tag, peer.to_string()),
            };

            if let Err(e) = queue.try_send(server_stream) {
                warn!("[Listener] Load Shedding: dropping connection from {} ({})", peer, e);
            }
        }
    }
}
