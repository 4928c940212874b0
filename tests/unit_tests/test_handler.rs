// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use command_runner_rs::api::error::{ErrorCode, RpcError};
use serial_test::serial;

use crate::unit_tests::mocks::{
    MockOptions, MockPeer, cli_hosts, mock_service, test_device,
};

fn expect_session_err(err: RpcError) -> command_runner_rs::api::error::SessionException {
    match err {
        RpcError::Session(e) => e,
        RpcError::Overloaded(o) => panic!("unexpected overload: {o}"),
    }
}

#[tokio::test]
async fn run_single_success() {
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
        .expect("run succeeds");

    assert_eq!(result.status, "success");
    assert_eq!(result.output, "$ show version\nMock response for show version");
    assert_eq!(result.command, "show version\n");
    // The scoped session is closed and deregistered.
    assert_eq!(service.registry.count(), 0);
}

#[tokio::test]
async fn run_unknown_device_fails_lookup() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let err = service
        .handler
        .run(
            "show version\n",
            &test_device("test-dev-100"),
            5,
            5,
            "127.0.0.1",
            5000,
            "",
        )
        .await
        .expect_err("device is not in the catalog");

    let e = expect_session_err(err);
    assert_eq!(e.code, ErrorCode::Lookup);
    assert!(e.message.contains("Device not found"), "{}", e.message);
    assert!(e.message.contains("test-dev-100"), "{}", e.message);
    assert!(e.message.contains("thrift_uuid="), "{}", e.message);
}

#[tokio::test]
async fn run_connect_timeout() {
    let service = mock_service(
        MockOptions {
            silent: true,
            ..MockOptions::default()
        },
        cli_hosts(&["test-dev-2"]),
        |_| {},
        None,
    );
    let err = service
        .handler
        .run(
            "show version\n",
            &test_device("test-dev-2"),
            5,
            0,
            "127.0.0.1",
            5000,
            "",
        )
        .await
        .expect_err("no prompt ever arrives");

    let e = expect_session_err(err);
    assert_eq!(e.code, ErrorCode::ConnectionTimeout);
    assert!(
        e.message.contains("Timeout during connection setup"),
        "{}",
        e.message
    );
}

#[tokio::test]
#[serial]
async fn run_command_timeout_includes_partial_output() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let err = service
        .handler
        .run(
            "command timeout\n",
            &test_device("test-dev-1"),
            1,
            5,
            "127.0.0.1",
            5000,
            "",
        )
        .await
        .expect_err("device never sends the prompt");

    let e = expect_session_err(err);
    assert_eq!(e.code, ErrorCode::CommandExecutionTimeout);
    assert!(
        e.message.contains("Command Response Timeout"),
        "{}",
        e.message
    );
    assert!(
        e.message.contains("Mock response for command timeout"),
        "{}",
        e.message
    );
}

#[tokio::test]
async fn run_validates_device_fields() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let mut device = test_device("test-dev-1");
    device.password = None;
    let err = service
        .handler
        .run("show version\n", &device, 5, 5, "127.0.0.1", 5000, "")
        .await
        .expect_err("password is required");

    let e = expect_session_err(err);
    assert_eq!(e.code, ErrorCode::Validation);
    assert!(e.message.contains("password"), "{}", e.message);
}

#[tokio::test]
async fn per_command_prompt_override_wins() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    let mut device = test_device("test-dev-1");
    device.command_prompts = Some(
        [(
            "user prompt test".to_string(),
            r"<<<User Magic Prompt>>>".to_string(),
        )]
        .into_iter()
        .collect(),
    );
    let result = service
        .handler
        .run(
            "user prompt test\n",
            &device,
            5,
            5,
            "127.0.0.1",
            5000,
            "",
        )
        .await
        .expect("override matches");
    assert!(
        result.output.contains("Test for user prompts"),
        "{}",
        result.output
    );
}

#[tokio::test]
#[serial]
async fn bulk_local_with_one_invalid_host() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1", "test-dev-2", "test-dev-3", "test-dev-4"]),
        |_| {},
        None,
    );
    let requests: Vec<_> = (0..5)
        .map(|i| {
            (
                test_device(&format!("test-dev-{i}")),
                vec!["show version\n".to_string()],
            )
        })
        .collect();

    let results = service
        .handler
        .bulk_run(requests, 30, 5, "127.0.0.1", 5000, "")
        .await
        .expect("bulk never raises per-device errors");

    assert_eq!(results.len(), 5);
    let failed = &results["test-dev-0"];
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0].status.contains("Device not found"),
        "{}",
        failed[0].status
    );
    for i in 1..5 {
        let ok = &results[&format!("test-dev-{i}")];
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].status, "success");
        assert_eq!(ok[0].output, "$ show version\nMock response for show version");
    }
    assert_eq!(service.handler.bulk_session_count(), 0);
}

#[tokio::test]
async fn bulk_fan_out_chunks_to_peers() {
    let peer = Arc::new(MockPeer::new());
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&[]),
        |cfg| cfg.lb_threshold = 2,
        Some(peer.clone()),
    );

    let requests: Vec<_> = (0..10)
        .map(|i| {
            (
                test_device(&format!("bulk-dev-{i}")),
                vec!["show version\n".to_string()],
            )
        })
        .collect();

    let results = service
        .handler
        .bulk_run(requests, 31, 5, "127.0.0.1", 5000, "")
        .await
        .expect("fan-out succeeds");

    assert_eq!(peer.call_count(), 5);
    assert_eq!(results.len(), 10);
    for i in 0..10 {
        let r = &results[&format!("bulk-dev-{i}")];
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].output, format!("bulk-dev-{i}: remote ok"));
    }
}

#[tokio::test]
async fn bulk_fan_out_retries_overloaded_peers() {
    let peer = Arc::new(MockPeer::overloading(2));
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&[]),
        |cfg| cfg.lb_threshold = 2,
        Some(peer.clone()),
    );

    let requests: Vec<_> = (0..2)
        .map(|i| {
            (
                test_device(&format!("bulk-dev-{i}")),
                vec!["show version\n".to_string()],
            )
        })
        .collect();

    let results = service
        .handler
        .bulk_run(requests, 31, 5, "127.0.0.1", 5000, "")
        .await
        .expect("retries succeed");

    // One chunk, two overload rejections, then success.
    assert_eq!(peer.call_count(), 3);
    assert_eq!(results.len(), 2);
    assert_eq!(results["bulk-dev-0"][0].output, "bulk-dev-0: remote ok");
}

#[tokio::test]
async fn bulk_fan_out_synthesizes_failures_after_retry_exhaustion() {
    let peer = Arc::new(MockPeer::overloading(usize::MAX));
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&[]),
        |cfg| {
            cfg.lb_threshold = 2;
            cfg.bulk_retry_limit = 1;
        },
        Some(peer.clone()),
    );

    let requests: Vec<_> = (0..2)
        .map(|i| {
            (
                test_device(&format!("bulk-dev-{i}")),
                vec!["show version\n".to_string()],
            )
        })
        .collect();

    let results = service
        .handler
        .bulk_run(requests, 31, 5, "127.0.0.1", 5000, "")
        .await
        .expect("failures are folded into the map");

    assert_eq!(results.len(), 2);
    for i in 0..2 {
        let r = &results[&format!("bulk-dev-{i}")];
        assert_eq!(r.len(), 1);
        assert!(
            r[0].status.contains("bulk_run_remote failed"),
            "{}",
            r[0].status
        );
    }
}

#[tokio::test]
async fn bulk_run_timeout_too_low_is_an_assertion_error() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&[]),
        |cfg| cfg.lb_threshold = 1,
        Some(Arc::new(MockPeer::new())),
    );
    let requests = vec![(
        test_device("bulk-dev-0"),
        vec!["show version\n".to_string()],
    )];

    let err = service
        .handler
        .bulk_run(requests, 25, 5, "127.0.0.1", 5000, "")
        .await
        .expect_err("25s - 20s overhead leaves no budget");
    let e = expect_session_err(err);
    assert_eq!(e.code, ErrorCode::Assertion);
    assert!(e.message.contains("too low"), "{}", e.message);
}

#[tokio::test]
async fn bulk_local_over_limit_is_overloaded() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |cfg| cfg.bulk_session_limit = 3,
        None,
    );
    let requests: Vec<_> = (0..4)
        .map(|i| {
            (
                test_device(&format!("test-dev-{i}")),
                vec!["show version\n".to_string()],
            )
        })
        .collect();

    let err = service
        .handler
        .bulk_run_local(requests, 30, 5, "127.0.0.1", 5000, "")
        .await
        .expect_err("admission control rejects");
    match err {
        RpcError::Overloaded(o) => assert!(o.message.contains("bulk session count"), "{o}"),
        RpcError::Session(e) => panic!("expected overload, got {e}"),
    }
    assert_eq!(service.handler.bulk_session_count(), 0);
}

#[tokio::test]
async fn counters_are_exported_with_the_service_prefix() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1"]),
        |_| {},
        None,
    );
    service
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
        .expect("run succeeds");

    let counters = service.handler.get_counters();
    assert_eq!(counters["fbnet.command_runner.cli_session.setup"], 1);
    assert_eq!(counters["fbnet.command_runner.cli_session.connected"], 1);
    assert_eq!(counters["fbnet.command_runner.cli_session.closed"], 1);
    assert_eq!(counters["fbnet.command_runner.sessions"], 0);

    let matching = service
        .handler
        .get_regex_counters(r"fbnet\.command_runner\.cli_session\..*")
        .expect("valid pattern");
    assert_eq!(matching.len(), 4);
}

#[tokio::test]
async fn bulk_results_commands_match_inputs() {
    let service = mock_service(
        MockOptions::default(),
        cli_hosts(&["test-dev-1", "test-dev-2"]),
        |_| {},
        None,
    );
    let requests = vec![
        (
            test_device("test-dev-1"),
            vec!["show version\n".to_string(), "test1\n".to_string()],
        ),
        (test_device("test-dev-2"), vec!["test1\n".to_string()]),
    ];

    let results = service
        .handler
        .bulk_run(requests, 30, 5, "127.0.0.1", 5000, "")
        .await
        .expect("bulk succeeds");

    assert_eq!(results.len(), 2);
    let dev1: Vec<&str> = results["test-dev-1"]
        .iter()
        .map(|r| r.command.as_str())
        .collect();
    assert_eq!(dev1, ["show version\n", "test1\n"]);
    let dev2: Vec<&str> = results["test-dev-2"]
        .iter()
        .map(|r| r.command.as_str())
        .collect();
    assert_eq!(dev2, ["test1\n"]);
}
