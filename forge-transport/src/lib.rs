// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

pub mod error;
pub mod frame;
pub mod listener;
pub mod stream;
pub mod tls;

pub use error::StreamError;
pub use listener::{CompileListener, ListenerConfig};
pub use stream::{ClientStream, IncomingRequest, InterruptProbe, ServerStream};
pub use tls::TlsSettings;
