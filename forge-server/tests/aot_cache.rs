// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

mod common;

use anyhow::Result;
use common::{start_server, start_server_with, ServerOptions, TestClient};
use forge_model::{ClassHandle, Message};

fn aot_client_setup(client: &mut TestClient) {
    client.vm_info.uses_aot_cache = true;
    client.vm_info.aot_cache_name = "default".to_string();
}

#[tokio::test]
async fn aot_cache_hit_short_circuits_the_compiler() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 20).await?;
    aot_client_setup(&mut client);
    let class = ClassHandle(0xD000);
    client.add_class(class, "Ld/D;");

    // 1. Store a compiled method in the AOT cache.
    let mut store = client.request(1, 1, class);
    store.aot_cache_store = true;
    store.method_index = 7;
    store.ram_class_chain = vec![class];
    let reply = client.compile(store).await?;
    assert!(matches!(reply, Message::CompilationCode(_)));
    assert_eq!(server.compiler.count(), 1);

    // 2. A load request for the same (chain, index, level, header) key is
    //    served from the cache; the compiler must not run again.
    let mut load = client.request(2, 1, class);
    load.aot_cache_load = true;
    load.method_index = 7;
    load.ram_class_chain = vec![class];
    let reply = client.compile(load).await?;

    match reply {
        Message::AotCacheSerializedMethod { method, records, .. } => {
            assert!(!method.is_empty());
            // The client knows no record ids yet: the full closure of the
            // method (loader, class, chain, header) must be shipped first.
            assert_eq!(records.len(), 4);
        }
        other => panic!("expected AotCacheSerializedMethod, got {:?}", other.message_type()),
    }
    assert_eq!(server.compiler.count(), 1, "the compiler must not be invoked on a hit");
    Ok(())
}

#[tokio::test]
async fn known_record_ids_are_not_resent() -> Result<()> {
    let server = start_server().await?;
    let mut client = TestClient::connect(&server.addr, 21).await?;
    aot_client_setup(&mut client);
    let class = ClassHandle(0xD100);
    client.add_class(class, "Ld/E;");

    let mut store = client.request(1, 1, class);
    store.aot_cache_store = true;
    store.ram_class_chain = vec![class];
    client.compile(store).await?;

    // First load: learn every record id from the reply.
    let mut load = client.request(2, 1, class);
    load.aot_cache_load = true;
    load.ram_class_chain = vec![class];
    let first = client.compile(load).await?;
    let first_count = match first {
        Message::AotCacheSerializedMethod { records, .. } => records.len(),
        other => panic!("expected serialized method, got {:?}", other.message_type()),
    };
    assert_eq!(first_count, 4);

    // Second load declares the ids as known; the closure difference is
    // empty and no records travel again.
    let known: Vec<_> = {
        let session = server.ctx.registry.find(forge_model::ClientId(21)).expect("session");
        let cache = server.ctx.aot_map.as_ref().unwrap().method_signatures("default");
        assert_eq!(cache.map(|s| s.len()), Some(1));
        server.ctx.registry.release(&session);
        // The ids are deterministic: first of each kind.
        use forge_model::{RecordId, RecordKind};
        vec![
            RecordId::new(RecordKind::ClassLoader, 0),
            RecordId::new(RecordKind::Class, 0),
            RecordId::new(RecordKind::ClassChain, 0),
            RecordId::new(RecordKind::AotHeader, 0),
        ]
    };

    let mut load = client.request(3, 1, class);
    load.aot_cache_load = true;
    load.ram_class_chain = vec![class];
    load.new_known_ids = known;
    let second = client.compile(load).await?;
    match second {
        Message::AotCacheSerializedMethod { records, .. } => assert!(records.is_empty()),
        other => panic!("expected serialized method, got {:?}", other.message_type()),
    }
    Ok(())
}

#[tokio::test]
async fn server_offsets_store_failure_aborts_instead_of_degrading() -> Result<()> {
    // An AOT budget too small for any record: the chain record cannot be
    // created, so a server-offsets store request must abort.
    let mut options = ServerOptions::default();
    options.config.aot_cache_max_mb = 0;
    let server = start_server_with(options).await?;

    let mut client = TestClient::connect(&server.addr, 22).await?;
    aot_client_setup(&mut client);
    let class = ClassHandle(0xD200);
    client.add_class(class, "Ld/F;");

    let mut store = client.request(1, 1, class);
    store.aot_cache_store = true;
    store.use_server_offsets = true;
    store.ram_class_chain = vec![class];
    let reply = client.compile(store).await?;

    match reply {
        Message::AotCacheFailure { store_unavailable, .. } => assert!(store_unavailable),
        other => panic!("expected AotCacheFailure, got {:?}", other.message_type()),
    }
    assert_eq!(server.compiler.count(), 0, "the compilation must abort, not degrade");
    Ok(())
}

#[tokio::test]
async fn caches_persist_to_disk_and_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;

    // 1. Boot a server that persists AOT caches, store one method.
    let mut options = ServerOptions::default();
    options.config.aot_cache_dir = Some(dir.path().to_path_buf());
    let server = start_server_with(options).await?;

    let mut client = TestClient::connect(&server.addr, 23).await?;
    aot_client_setup(&mut client);
    let class = ClassHandle(0xD300);
    client.add_class(class, "Ld/G;");

    let mut store = client.request(1, 1, class);
    store.aot_cache_store = true;
    store.ram_class_chain = vec![class];
    client.compile(store).await?;

    // The save runs on a background task.
    let path = dir.path().join("default.aotcache");
    for _ in 0..50 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(path.exists(), "the cache must be written to disk after a store");

    // 2. A fresh server over the same directory loads the cache and serves
    //    the method without compiling.
    let mut options = ServerOptions::default();
    options.config.aot_cache_dir = Some(dir.path().to_path_buf());
    let second = start_server_with(options).await?;

    let mut client = TestClient::connect(&second.addr, 24).await?;
    aot_client_setup(&mut client);
    client.add_class(class, "Ld/G;");

    // The first request may race the async load; retry until it lands.
    let mut served = None;
    for seq in 1..=20u32 {
        let mut load = client.request(seq, 1, class);
        load.aot_cache_load = true;
        load.ram_class_chain = vec![class];
        match client.compile(load).await? {
            Message::AotCacheSerializedMethod { method, .. } => {
                served = Some(method);
                break;
            }
            Message::CompilationCode(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            other => panic!("unexpected reply {:?}", other.message_type()),
        }
    }
    assert!(served.is_some(), "the reloaded cache must serve the stored method");
    Ok(())
}
