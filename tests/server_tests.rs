//! End-to-end server tests
//!
//! A full node (bundled consensus, TCP server) exercised through the
//! protocol client.

mod common;

use std::net::TcpStream;

use quorumsql::engine::Value;
use quorumsql::error::Error;
use quorumsql::protocol::{
    read_response, write_request, Consistency, Request, Response,
};
use common::TestServer;

// =============================================================================
// Basic Request Cycle
// =============================================================================

#[test]
fn test_handshake_open_prepare_exec() {
    let server = TestServer::start();
    let mut client = server.client();

    let db = client.open("app").unwrap();
    let stmt = client.prepare(db, "CREATE TABLE test (n INT)").unwrap();
    assert!(stmt.mutates);
    assert_eq!(stmt.param_count, 0);

    let result = client.exec(stmt.id, &[]).unwrap();
    assert_eq!(result.rows_affected, 0);
    client.finalize(stmt.id).unwrap();
}

#[test]
fn test_insert_256_rows_and_query_them() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let create = client.prepare(db, "CREATE TABLE test (n INT)").unwrap();
    client.exec(create.id, &[]).unwrap();

    let begin = client.prepare(db, "BEGIN").unwrap();
    client.exec(begin.id, &[]).unwrap();

    let insert = client
        .prepare(db, "INSERT INTO test (n) VALUES(123)")
        .unwrap();
    for _ in 0..256 {
        let result = client.exec(insert.id, &[]).unwrap();
        assert_eq!(result.rows_affected, 1);
    }

    let commit = client.prepare(db, "COMMIT").unwrap();
    client.exec(commit.id, &[]).unwrap();

    let select = client.prepare(db, "SELECT n FROM test").unwrap();
    assert!(!select.mutates);
    let result = client.query(select.id, &[]).unwrap();

    assert_eq!(result.columns, vec!["n".to_string()]);
    assert_eq!(result.rows.len(), 256);
    for row in &result.rows {
        assert_eq!(row, &vec![Value::Integer(123)]);
    }
}

#[test]
fn test_insert_ids_are_monotonic() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let create = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.exec(create.id, &[]).unwrap();

    let insert = client.prepare(db, "INSERT INTO t (n) VALUES (?)").unwrap();
    assert_eq!(insert.param_count, 1);
    for expected_id in 1..=5u64 {
        let result = client.exec(insert.id, &[Value::Integer(7)]).unwrap();
        assert_eq!(result.last_insert_id, expected_id);
    }
}

#[test]
fn test_read_your_writes() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    for sql in [
        "CREATE TABLE t (n INT, label TEXT)",
        "INSERT INTO t (n, label) VALUES (1, 'first')",
    ] {
        let stmt = client.prepare(db, sql).unwrap();
        client.exec(stmt.id, &[]).unwrap();
    }

    let select = client.prepare(db, "SELECT label FROM t WHERE n = 1").unwrap();
    let result = client.query(select.id, &[]).unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("first".to_string())]]);
}

#[test]
fn test_local_consistency_query() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    for sql in ["CREATE TABLE t (n INT)", "INSERT INTO t (n) VALUES (5)"] {
        let stmt = client.prepare(db, sql).unwrap();
        client.exec(stmt.id, &[]).unwrap();
    }

    let select = client.prepare(db, "SELECT n FROM t").unwrap();
    let result = client
        .query_with(select.id, &[], Consistency::Local)
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(5)]]);
}

#[test]
fn test_writes_visible_across_connections() {
    let server = TestServer::start();

    let mut writer = server.client();
    let db = writer.open("app").unwrap();
    for sql in ["CREATE TABLE t (n INT)", "INSERT INTO t (n) VALUES (9)"] {
        let stmt = writer.prepare(db, sql).unwrap();
        writer.exec(stmt.id, &[]).unwrap();
    }

    let mut reader = server.client();
    let db = reader.open("app").unwrap();
    let select = reader.prepare(db, "SELECT n FROM t").unwrap();
    let result = reader.query(select.id, &[]).unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(9)]]);
}

// =============================================================================
// Error Paths
// =============================================================================

#[test]
fn test_syntax_error_keeps_connection_alive() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let err = client.prepare(db, "FROBNICATE THE DATABASE").unwrap_err();
    assert!(matches!(err, Error::Syntax(_)));

    // The connection survives engine errors
    let stmt = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.exec(stmt.id, &[]).unwrap();
}

#[test]
fn test_finalize_unknown_handle() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let stmt = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.finalize(stmt.id).unwrap();

    // Releasing an already-released handle reports InvalidHandle
    let err = client.finalize(stmt.id).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)));

    // And the connection is still usable
    let again = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.exec(again.id, &[]).unwrap();
}

#[test]
fn test_exec_of_finalized_statement() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let stmt = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.finalize(stmt.id).unwrap();
    let err = client.exec(stmt.id, &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)));
}

#[test]
fn test_query_of_mutating_statement_rejected() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let create = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.exec(create.id, &[]).unwrap();

    let insert = client.prepare(db, "INSERT INTO t (n) VALUES (1)").unwrap();
    let err = client.query(insert.id, &[]).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

#[test]
fn test_parameter_count_mismatch() {
    let server = TestServer::start();
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let create = client.prepare(db, "CREATE TABLE t (n INT)").unwrap();
    client.exec(create.id, &[]).unwrap();

    let insert = client.prepare(db, "INSERT INTO t (n) VALUES (?)").unwrap();
    let err = client.exec(insert.id, &[]).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

#[test]
fn test_invalid_database_name_rejected() {
    let server = TestServer::start();
    let mut client = server.client();
    let err = client.open("../escape").unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

// =============================================================================
// Protocol Violations
// =============================================================================

#[test]
fn test_handshake_version_mismatch_closes_connection() {
    let server = TestServer::start();
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = stream;

    write_request(&mut writer, &Request::Handshake { version: 999 }).unwrap();
    match read_response(&mut reader).unwrap() {
        Response::Error { code, .. } => {
            assert_eq!(code, Error::ProtocolMismatch { client: 999, server: 1 }.wire_code());
        }
        other => panic!("unexpected response {other:?}"),
    }

    // The server closed the connection: the next read hits EOF
    let err = read_response(&mut reader).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_request_before_handshake_closes_connection() {
    let server = TestServer::start();
    let stream = TcpStream::connect(server.addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = stream;

    write_request(&mut writer, &Request::Open { name: "app".to_string() }).unwrap();
    match read_response(&mut reader).unwrap() {
        Response::Error { code, .. } => {
            assert_eq!(code, Error::Frame(String::new()).wire_code());
        }
        other => panic!("unexpected response {other:?}"),
    }

    let err = read_response(&mut reader).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

// =============================================================================
// Row Streaming
// =============================================================================

#[test]
fn test_large_result_set_streams_in_batches() {
    // A frame budget small enough to force many row batches
    let server = TestServer::start_with(|b| b.max_frame_size(4096));
    let mut client = server.client();
    let db = client.open("app").unwrap();

    let create = client.prepare(db, "CREATE TABLE t (s TEXT)").unwrap();
    client.exec(create.id, &[]).unwrap();

    let payload = "y".repeat(512);
    let insert = client.prepare(db, "INSERT INTO t (s) VALUES (?)").unwrap();
    for _ in 0..64 {
        client.exec(insert.id, &[Value::Text(payload.clone())]).unwrap();
    }

    let select = client.prepare(db, "SELECT s FROM t").unwrap();
    let result = client.query(select.id, &[]).unwrap();
    assert_eq!(result.rows.len(), 64);
    for row in &result.rows {
        assert_eq!(row, &vec![Value::Text(payload.clone())]);
    }
}
