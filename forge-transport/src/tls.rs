// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore};
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;

/// TLS material for the listener. When `client_ca` is set, the peer must
/// present a certificate chaining to it; the handshake failing means the
/// session is aborted before any frame is read.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

impl TlsSettings {
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let certs = load_certs(&self.cert)?;
        let key = load_key(&self.key)?;

        let builder = rustls::ServerConfig::builder().with_safe_defaults();
        let config = match &self.client_ca {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(&cert).context("adding client CA certificate")?;
                }
                builder
                    .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
                    .with_single_cert(certs, key)?
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(certs, key)?,
        };

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<Certificate>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
    if certs.is_empty() {
        bail!("no certificates found in {:?}", path);
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &PathBuf) -> Result<PrivateKey> {
    let pem = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let mut reader = pem.as_slice();
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    bail!("no private key found in {:?}", path)
}
