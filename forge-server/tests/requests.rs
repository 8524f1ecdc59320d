// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

mod common;

use anyhow::Result;
use common::{start_server, start_server_with, ServerOptions, TestClient};
use forge_model::{
    ClassHandle, ClientId, FailureCode, MemoryState, Message, ThreadState,
};

#[tokio::test]
async fn single_happy_path() -> Result<()> {
    // 1. Boot a server and connect one client.
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 1).await?;
    client.add_class(ClassHandle(0x1000), "Lfoo/Bar;");

    // 2. First request of the session: seqNo=1 depending on criticalSeqNo=1.
    let request = client.request(1, 1, ClassHandle(0x1000));
    let reply = client.compile(request).await?;

    // 3. Expect generated code with relaxed health tags.
    match reply {
        Message::CompilationCode(reply) => {
            assert!(!reply.code.is_empty());
            assert_eq!(reply.memory_state, MemoryState::Normal);
            assert_eq!(reply.thread_state, ThreadState::Normal);
        }
        other => panic!("expected CompilationCode, got {:?}", other.message_type()),
    }
    assert_eq!(server.compiler.count(), 1);
    Ok(())
}

#[tokio::test]
async fn identical_requests_produce_identical_artifacts() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 2).await?;
    client.add_class(ClassHandle(0x2000), "Lfoo/Baz;");

    let first = client.compile(client.request(1, 1, ClassHandle(0x2000))).await?;
    let second = client.compile(client.request(2, 1, ClassHandle(0x2000))).await?;

    match (first, second) {
        (Message::CompilationCode(a), Message::CompilationCode(b)) => {
            assert_eq!(a.code, b.code, "same method at same opt level must yield identical code");
            assert_eq!(a.data, b.data);
        }
        _ => panic!("expected two successful replies"),
    }
    Ok(())
}

#[tokio::test]
async fn version_mismatch_is_rejected_with_the_distinguished_code() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 3).await?;
    client.add_class(ClassHandle(0x3000), "Lv/V;");
    client.stream.set_version_tag(forge_model::wire_version(0xBAD));

    let reply = client.compile(client.request(1, 1, ClassHandle(0x3000))).await?;
    match reply {
        Message::CompilationFailure { code, .. } => {
            assert_eq!(code, FailureCode::StreamVersionIncompatible);
        }
        other => panic!("expected CompilationFailure, got {:?}", other.message_type()),
    }
    Ok(())
}

#[tokio::test]
async fn session_terminate_removes_the_session() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 4).await?;
    client.add_class(ClassHandle(0x4000), "Lt/T;");

    client.compile(client.request(1, 1, ClassHandle(0x4000))).await?;
    assert_eq!(server.ctx.registry.size(), 1);

    client
        .stream
        .send(&Message::ClientSessionTerminate { client_id: ClientId(4) })
        .await?;

    // Teardown is processed by whichever worker picks the stream up next.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(server.ctx.registry.size(), 0);
    Ok(())
}

#[tokio::test]
async fn memory_pressure_is_tagged_and_tightens_sampling() -> Result<()> {
    // 1. Free memory below the VERY_LOW threshold of the default config.
    let options = ServerOptions { free_memory_bytes: 1024, ..ServerOptions::default() };
    let server = start_server_with(options).await?;
    let mut client = TestClient::connect(&server.addr, 5).await?;
    client.add_class(ClassHandle(0x5000), "Lm/M;");

    // 2. Any successful compilation carries the VERY_LOW tag.
    let reply = client.compile(client.request(1, 1, ClassHandle(0x5000))).await?;
    match reply {
        Message::CompilationCode(reply) => {
            assert_eq!(reply.memory_state, MemoryState::VeryLow);
        }
        other => panic!("expected CompilationCode, got {:?}", other.message_type()),
    }

    // 3. The sampler shortened its refresh window to 50 ms.
    assert_eq!(
        server.ctx.health.current_sample_period(),
        std::time::Duration::from_millis(50)
    );
    Ok(())
}

#[tokio::test]
async fn unload_purges_the_signature_index() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 6).await?;
    let class = ClassHandle(0x6000);
    let payload = client.add_class(class, "Lfoo/Bar;");

    // 1. Compile once so class K is cached under loader L.
    client.compile(client.request(1, 1, class)).await?;
    {
        let session = server.ctx.registry.find(ClientId(6)).expect("session must exist");
        assert_eq!(
            session.lookup_class_by_signature(payload.loader, "Lfoo/Bar;"),
            Some(class)
        );
        server.ctx.registry.release(&session);
    }

    // 2. Deliver a critical request whose unload list names K. The request
    //    compiles a different class.
    let other = ClassHandle(0x6100);
    client.add_class(other, "Lfoo/Other;");
    let mut request = client.request(2, 1, other);
    request.unloaded_classes = vec![class];
    client.compile(request).await?;

    // 3. The secondary index no longer resolves (L, signature).
    let session = server.ctx.registry.find(ClientId(6)).expect("session must exist");
    assert_eq!(session.lookup_class_by_signature(payload.loader, "Lfoo/Bar;"), None);
    assert!(!session.rom_class_is_cached(class));
    server.ctx.registry.release(&session);
    Ok(())
}
