//! Handler-level tests: queries go through `HijackHandler::handle_request` and
//! the captured wire response is parsed back.

mod common;

use std::net::Ipv4Addr;

use hickory_proto::op::{OpCode, ResponseCode};
use hickory_proto::rr::RecordType;
use servicekeel::{DnsState, HijackHandler};

use common::*;

fn handler_with(names: &[&str]) -> HijackHandler {
    let state = DnsState::new("127.0.66.0/24").unwrap();
    for name in names {
        state.add_mapping(name).unwrap();
    }
    HijackHandler::new(state)
}

#[tokio::test]
async fn mapping_alias_and_removal() {
    let handler = handler_with(&[]);
    let state = handler.state().clone();

    let ip = state.add_mapping("mysql.default.svc.").unwrap();
    assert_eq!(ip, Ipv4Addr::new(127, 0, 66, 0));
    state.add_mapping_alias("mysql.default.svc.", ["mysql.default.svc.cluster.local."]);

    let msg = execute_query(&handler, "mysql.default.svc.", RecordType::A).await;
    assert_a_response(&msg, &[ip]);
    assert!(msg.authoritative());
    assert_eq!(msg.answers()[0].ttl(), 5);

    let msg = execute_query(&handler, "mysql.default.svc.cluster.local.", RecordType::A).await;
    assert_a_response(&msg, &[ip]);

    state.remove_mapping("mysql.default.svc.").unwrap();

    let msg = execute_query(&handler, "mysql.default.svc.", RecordType::A).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
    assert!(msg.answers().is_empty());

    let msg = execute_query(&handler, "mysql.default.svc.cluster.local.", RecordType::A).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn aaaa_is_never_answered() {
    let handler = handler_with(&["mysql.default.svc."]);

    for name in ["mysql.default.svc.", "unknown.example."] {
        let msg = execute_query(&handler, name, RecordType::AAAA).await;
        assert_response_code(&msg, ResponseCode::NoError);
        assert!(msg.answers().is_empty(), "AAAA for {name} returned records");
    }
}

#[tokio::test]
async fn unmapped_a_is_nxdomain() {
    let handler = handler_with(&["mysql.default.svc."]);

    let msg = execute_query(&handler, "redis.default.svc.", RecordType::A).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
    assert!(!msg.authoritative());
}

#[tokio::test]
async fn other_types_do_not_force_nxdomain() {
    let handler = handler_with(&["mysql.default.svc."]);

    let msg = execute_query(&handler, "unknown.example.", RecordType::MX).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg.answers().is_empty());

    let msg = execute_query(&handler, "mysql.default.svc.", RecordType::TXT).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg.answers().is_empty());
}

#[tokio::test]
async fn multiple_questions_in_one_request() {
    let handler = handler_with(&["mysql.default.svc.", "redis.cache."]);
    let mysql = Ipv4Addr::new(127, 0, 66, 0);
    let redis = Ipv4Addr::new(127, 0, 66, 1);

    // A + AAAA for the same name: only the A answer.
    let bytes = build_message_bytes(
        &[("mysql.default.svc.", RecordType::A), ("mysql.default.svc.", RecordType::AAAA)],
        OpCode::Query,
        7,
    );
    let msg = execute_bytes(&handler, &bytes).await;
    assert_a_response(&msg, &[mysql]);
    assert_eq!(msg.answers().len(), 1);

    // Two A questions, both mapped.
    let bytes = build_message_bytes(
        &[("mysql.default.svc.", RecordType::A), ("redis.cache.", RecordType::A)],
        OpCode::Query,
        8,
    );
    let msg = execute_bytes(&handler, &bytes).await;
    assert_a_response(&msg, &[mysql, redis]);

    // One hit and one miss still answers.
    let bytes = build_message_bytes(
        &[("mysql.default.svc.", RecordType::A), ("ghost.", RecordType::A)],
        OpCode::Query,
        9,
    );
    let msg = execute_bytes(&handler, &bytes).await;
    assert_a_response(&msg, &[mysql]);

    // A miss plus AAAA is a name error.
    let bytes = build_message_bytes(
        &[("ghost.", RecordType::A), ("ghost.", RecordType::AAAA)],
        OpCode::Query,
        10,
    );
    let msg = execute_bytes(&handler, &bytes).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn short_names_resolve_through_search_domains() {
    let handler = handler_with(&[]);
    let state = handler.state();
    state.set_search_domains([
        "default.svc.cluster-a.local",
        "svc.cluster-a.local",
        "cluster-a.local",
    ]);
    let ip = state.add_mapping("test.default.svc.cluster-a.local.").unwrap();

    let msg = execute_query(&handler, "test.", RecordType::A).await;
    assert_a_response(&msg, &[ip]);
    // The answer carries the name that was asked for.
    assert_eq!(msg.answers()[0].name().to_ascii(), "test.");

    let msg = execute_query(&handler, "test.default.", RecordType::A).await;
    assert_a_response(&msg, &[ip]);

    let msg = execute_query(&handler, "nonexistent.", RecordType::A).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn query_names_are_case_insensitive() {
    let handler = handler_with(&["mysql.default.svc."]);

    let msg = execute_query(&handler, "MySQL.Default.SVC.", RecordType::A).await;
    assert_a_response(&msg, &[Ipv4Addr::new(127, 0, 66, 0)]);
}

#[tokio::test]
async fn custom_ttl() {
    let handler = handler_with(&["mysql.default.svc."]).with_ttl(2);

    let msg = execute_query(&handler, "mysql.default.svc.", RecordType::A).await;
    assert_eq!(msg.answers()[0].ttl(), 2);
}

#[tokio::test]
async fn non_query_opcode_is_not_implemented() {
    let handler = handler_with(&["mysql.default.svc."]);

    let bytes = build_message_bytes(&[("mysql.default.svc.", RecordType::A)], OpCode::Status, 11);
    let msg = execute_bytes(&handler, &bytes).await;
    assert_response_code(&msg, ResponseCode::NotImp);
    assert!(msg.answers().is_empty());
}

#[tokio::test]
async fn response_echoes_request_id() {
    let handler = handler_with(&["mysql.default.svc."]);

    let bytes = build_message_bytes(&[("mysql.default.svc.", RecordType::A)], OpCode::Query, 4242);
    let msg = execute_bytes(&handler, &bytes).await;
    assert_eq!(msg.id(), 4242);
}
