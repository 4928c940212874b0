// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use command_runner_rs::api::error::{ErrorCode, RpcError};

use crate::unit_tests::mocks::{MockOptions, cli_hosts, mock_service, test_device};

#[tokio::test]
async fn open_session_registers_and_lookup_returns_it() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let handler = &service.handler;

    let session = handler
        .open_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("opens");
    assert_eq!(session.hostname, "test-dev-1");
    assert_eq!(service.registry.count(), 1);

    let live = service
        .registry
        .get(session.id, "10.10.10.10", 1010)
        .expect("registered");
    assert_eq!(live.core().id(), session.id);
    assert_eq!(service.counters.get("sessions"), Some(1));

    // A different client triple does not see the session.
    assert!(service.registry.get(session.id, "10.10.10.11", 1010).is_err());

    handler
        .close_session(&session, "10.10.10.10", 1010, "")
        .await
        .expect("closes");
    assert_eq!(service.registry.count(), 0);
}

#[tokio::test]
async fn run_session_reuses_the_open_session() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let handler = &service.handler;

    let session = handler
        .open_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("opens");

    let first = handler
        .run_session(&session, "test1\n", 5, "10.10.10.10", 1010, "")
        .await
        .expect("runs");
    assert_eq!(first.output, "$ test1\nMock response for test1");
    assert_eq!(first.status, "success");

    let second = handler
        .run_session(&session, "show version\n", 5, "10.10.10.10", 1010, "")
        .await
        .expect("runs again");
    assert_eq!(second.output, "$ show version\nMock response for show version");
    assert_eq!(service.registry.count(), 1);

    handler
        .close_session(&session, "10.10.10.10", 1010, "")
        .await
        .expect("closes");
}

#[tokio::test]
async fn close_session_twice_fails_lookup() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let handler = &service.handler;

    let session = handler
        .open_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("opens");
    handler
        .close_session(&session, "10.10.10.10", 1010, "")
        .await
        .expect("first close");

    let err = handler
        .close_session(&session, "10.10.10.10", 1010, "")
        .await
        .expect_err("second close fails");
    match err {
        RpcError::Session(e) => {
            assert_eq!(e.code, ErrorCode::Lookup);
            assert!(e.message.contains("Session not found"), "{}", e.message);
        },
        RpcError::Overloaded(_) => panic!("unexpected overload"),
    }
}

#[tokio::test]
async fn repeated_close_on_the_session_object_is_a_noop() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let session = service
        .handler
        .open_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("opens");
    let live = service
        .registry
        .get(session.id, "10.10.10.10", 1010)
        .expect("registered");

    live.close().await;
    live.close().await;
    assert_eq!(service.registry.count(), 0);
    assert!(!live.core().connected());
}

#[tokio::test]
async fn in_use_counter_returns_to_zero_after_commands() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let session = service
        .handler
        .open_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("opens");
    let live = service
        .registry
        .get(session.id, "10.10.10.10", 1010)
        .expect("registered");
    assert!(!live.core().in_use());

    service
        .handler
        .run_session(&session, "test1\n", 5, "10.10.10.10", 1010, "")
        .await
        .expect("runs");
    assert!(!live.core().in_use());

    // Failures release the slot too.
    let _ = service
        .handler
        .run_session(&session, "command timeout\n", 1, "10.10.10.10", 1010, "")
        .await
        .expect_err("times out");
    assert!(!live.core().in_use());

    live.close().await;
}

#[tokio::test]
async fn open_session_failure_does_not_leak_registry_entries() {
    let service = mock_service(
        MockOptions {
            silent: true,
            ..MockOptions::default()
        },
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let err = service
        .handler
        .open_session(&test_device("test-dev-1"), 1, 60, "10.10.10.10", 1010, "")
        .await
        .expect_err("silent device cannot complete setup");
    match err {
        RpcError::Session(e) => assert_eq!(e.code, ErrorCode::ConnectionTimeout),
        RpcError::Overloaded(_) => panic!("unexpected overload"),
    }
    assert_eq!(service.registry.count(), 0);
}

#[tokio::test]
async fn raw_session_returns_unformatted_output() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let handler = &service.handler;

    let session = handler
        .open_raw_session(&test_device("test-dev-1"), 5, 60, "10.10.10.10", 1010, "")
        .await
        .expect("raw open skips prompt setup");

    let result = handler
        .run_raw_session(
            &session,
            "user prompt test\n",
            "<<<User Magic Prompt>>>",
            5,
            "10.10.10.10",
            1010,
            "",
        )
        .await
        .expect("caller regex delimits the output");
    // No prompt/echo formatting: the capture ends with the matched bytes.
    assert!(result.output.contains("Test for user prompts"), "{}", result.output);
    assert!(
        result.output.ends_with("<<<User Magic Prompt>>>"),
        "{}",
        result.output
    );

    handler
        .close_raw_session(&session, "10.10.10.10", 1010, "")
        .await
        .expect("closes");
    assert_eq!(service.registry.count(), 0);
}

#[tokio::test]
async fn session_uuid_is_generated_when_missing() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let result = service
        .handler
        .run(
            "show version\n",
            &test_device("test-dev-1"),
            5,
            5,
            "127.0.0.1",
            5000,
            "",
        )
        .await
        .expect("runs");
    assert!(!result.uuid.is_empty());

    let result = service
        .handler
        .run(
            "show version\n",
            &test_device("test-dev-1"),
            5,
            5,
            "127.0.0.1",
            5000,
            "req-42",
        )
        .await
        .expect("runs");
    assert_eq!(result.uuid, "req-42");
}
