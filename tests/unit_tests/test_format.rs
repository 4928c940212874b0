// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use bytes::Bytes;
use command_runner_rs::session::{
    cli::{fixup_whitespace, format_output},
    reader::ResponseMatch,
};

fn resp(data: &[u8], matched: &[u8]) -> ResponseMatch {
    ResponseMatch {
        data: Bytes::copy_from_slice(data),
        matched: Bytes::copy_from_slice(matched),
        groups: HashMap::new(),
    }
}

#[test]
fn strips_bell_and_backspace_eaten_chars() {
    assert_eq!(fixup_whitespace(b"ab\x08c\x07d"), b"acd".to_vec());
}

#[test]
fn normalizes_line_endings() {
    assert_eq!(fixup_whitespace(b"a\r\r\nb\n\r\rc\rd"), b"a\nb\nc\nd".to_vec());
}

#[test]
fn output_starts_with_prompt_and_canonical_echo() {
    let r = resp(b"show  version\nMock response for show version", b"\n$");
    let out = format_output(b"show version", &r);
    assert_eq!(out, b"$ show version\nMock response for show version".to_vec());
}

#[test]
fn echo_with_backspaces_is_canonicalized() {
    let r = resp(
        b"show vers\x08sion\r\nMock response for show version\r\n",
        b"\n$ ",
    );
    let out = format_output(b"show version", &r);
    assert_eq!(out, b"$ show version\nMock response for show version".to_vec());
}

#[test]
fn only_first_echo_occurrence_is_replaced() {
    let r = resp(b"show version\nshow version output line\n", b"\n$");
    let out = format_output(b"show version", &r);
    assert_eq!(
        out,
        b"$ show version\nshow version output line".to_vec()
    );
}

#[test]
fn special_regex_chars_in_command_are_escaped() {
    let r = resp(b"show run | match x\nconfig line\n", b"\n$");
    let out = format_output(b"show run | match x", &r);
    assert_eq!(out, b"$ show run | match x\nconfig line".to_vec());
}

#[test]
fn empty_capture_still_carries_the_prompt() {
    let r = resp(b"", b"\n$");
    let out = format_output(b"ping", &r);
    assert_eq!(out, b"$ ".to_vec());
}
