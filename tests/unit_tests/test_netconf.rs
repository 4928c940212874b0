// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use command_runner_rs::{
    api::{
        error::{ErrorCode, RpcError},
        types::SessionData,
    },
    session::netconf::capability_set,
};

use crate::unit_tests::mocks::{
    MockOptions, PEER_HELLO, PEER_HELLO_V11_ONLY, mock_service, test_device,
};

fn netconf_hosts() -> Vec<(String, String)> {
    vec![("test-nc-1".to_string(), "mock-netconf".to_string())]
}

fn netconf_device() -> command_runner_rs::api::types::Device {
    let mut device = test_device("test-nc-1");
    device.session_data = Some(SessionData {
        subsystem: Some("netconf".to_string()),
        ..SessionData::default()
    });
    device
}

#[test]
fn capability_set_extracts_base_versions() {
    let caps = capability_set(PEER_HELLO.as_bytes());
    assert!(caps.contains("netconf:base:1.0"));
    assert!(caps.contains("netconf:base:1.1"));
    // Non-base capabilities are ignored.
    assert_eq!(caps.len(), 2);

    let caps = capability_set(PEER_HELLO_V11_ONLY.as_bytes());
    assert_eq!(caps.len(), 1);
    assert!(caps.contains("netconf:base:1.1"));

    assert!(capability_set(b"not xml at all").is_empty());
}

#[tokio::test]
async fn first_reply_carries_the_peer_hello() {
    let service = mock_service(
        MockOptions {
            netconf: true,
            ..MockOptions::default()
        },
        netconf_hosts(),
        |_| {},
        None,
    );

    let session = service
        .handler
        .open_session(&netconf_device(), 5, 60, "127.0.0.1", 5000, "")
        .await
        .expect("hello exchange succeeds");

    let first = service
        .handler
        .run_session(&session, "<get-config/>", 5, "127.0.0.1", 5000, "")
        .await
        .expect("rpc runs");
    assert_eq!(first.output, "<rpc-reply>ok</rpc-reply>");
    assert_eq!(first.capabilities.as_deref(), Some(PEER_HELLO));

    // Only the first reply surfaces the stored hello.
    let second = service
        .handler
        .run_session(&session, "<get-config/>", 5, "127.0.0.1", 5000, "")
        .await
        .expect("rpc runs");
    assert_eq!(second.capabilities, None);

    service
        .handler
        .close_session(&session, "127.0.0.1", 5000, "")
        .await
        .expect("closes");
}

#[tokio::test]
async fn disjoint_base_capabilities_fail_unsupported_device() {
    let service = mock_service(
        MockOptions {
            netconf: true,
            peer_hello: PEER_HELLO_V11_ONLY.to_string(),
            ..MockOptions::default()
        },
        netconf_hosts(),
        |_| {},
        None,
    );

    let err = service
        .handler
        .open_session(&netconf_device(), 5, 60, "127.0.0.1", 5000, "")
        .await
        .expect_err("no common base version");
    match err {
        RpcError::Session(e) => {
            assert_eq!(e.code, ErrorCode::UnsupportedDevice);
            assert!(e.message.contains("base"), "{}", e.message);
        },
        RpcError::Overloaded(_) => panic!("unexpected overload"),
    }
    assert_eq!(service.registry.count(), 0);
}

#[tokio::test]
async fn netconf_without_subsystem_or_exec_fails() {
    let service = mock_service(
        MockOptions {
            netconf: true,
            ..MockOptions::default()
        },
        netconf_hosts(),
        |_| {},
        None,
    );

    let err = service
        .handler
        .open_session(&test_device("test-nc-1"), 5, 60, "127.0.0.1", 5000, "")
        .await
        .expect_err("channel start is unspecified");
    match err {
        RpcError::Session(e) => {
            assert_eq!(e.code, ErrorCode::Runtime);
            assert!(e.message.contains("subsystem"), "{}", e.message);
        },
        RpcError::Overloaded(_) => panic!("unexpected overload"),
    }
}
