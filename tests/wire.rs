//! Wire level tests against a scripted in-process server.
//!
//! The helper server speaks just enough of the v3 protocol to drive the
//! client through startup and the scripted reply sequences.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use postq::{
    Connection, ErrorKind, First, NotifyEvent, StateError, TransactionStatus, Value, transfer,
};

// ===== backend message builders =====

fn msg(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.put_u8(kind);
    out.put_i32(4 + body.len() as i32);
    out.put_slice(body);
    out
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
    msg(b'S', &body)
}

fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    msg(b'C', &body)
}

fn parse_complete() -> Vec<u8> {
    msg(b'1', &[])
}

fn bind_complete() -> Vec<u8> {
    msg(b'2', &[])
}

fn close_complete() -> Vec<u8> {
    msg(b'3', &[])
}

fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i16(oids.len() as i16);
    for oid in oids {
        body.put_u32(*oid);
    }
    msg(b't', &body)
}

fn row_description(fields: &[(&str, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i16(fields.len() as i16);
    for (name, oid) in fields {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0); // table oid
        body.put_i16(0); // attnum
        body.put_u32(*oid);
        body.put_i16(-1); // typlen
        body.put_i32(-1); // typmod
        body.put_u16(0); // format, unknown at describe time
    }
    msg(b'T', &body)
}

fn data_row(columns: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i16(columns.len() as i16);
    for column in columns {
        match column {
            None => body.put_i32(-1),
            Some(value) => {
                body.put_i32(value.len() as i32);
                body.put_slice(value);
            }
        }
    }
    msg(b'D', &body)
}

fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
        body.put_u8(key);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    msg(b'E', &body)
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i32(pid);
    body.put_slice(channel.as_bytes());
    body.put_u8(0);
    body.put_slice(payload.as_bytes());
    body.put_u8(0);
    msg(b'A', &body)
}

fn empty_query_response() -> Vec<u8> {
    msg(b'I', &[])
}

fn copy_out_response() -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i8(0);
    body.put_i16(0);
    msg(b'H', &body)
}

fn copy_in_response() -> Vec<u8> {
    let mut body = Vec::new();
    body.put_i8(0);
    body.put_i16(0);
    msg(b'G', &body)
}

fn copy_data(payload: &[u8]) -> Vec<u8> {
    msg(b'd', payload)
}

fn copy_done() -> Vec<u8> {
    msg(b'c', &[])
}

// ===== scripted server =====

type Script = Box<dyn FnMut(u8, &[u8]) -> Vec<u8> + Send>;

struct TestServer {
    url: String,
    /// Kinds of every frame received after startup, in order.
    log: Arc<Mutex<Vec<u8>>>,
}

/// Spawn a server for exactly one connection. `push` is written
/// spontaneously after the given delay, emulating asynchronous traffic.
async fn spawn_server(script: Script, push: Option<(Duration, Vec<u8>)>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut script = script;
        let (socket, _) = listener.accept().await.unwrap();
        let (mut reader, writer) = socket.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));

        // startup: length prefixed, no kind octet
        loop {
            let len = reader.read_i32().await.unwrap();
            let mut body = vec![0u8; len as usize - 4];
            reader.read_exact(&mut body).await.unwrap();
            let code = i32::from_be_bytes(body[..4].try_into().unwrap());
            if code == 80877103 {
                // SSLRequest: stay in plaintext
                writer.lock().await.write_all(b"N").await.unwrap();
                continue;
            }
            assert_eq!(code, 196608, "protocol version");
            break;
        }

        let mut greeting = Vec::new();
        greeting.extend(msg(b'R', &0i32.to_be_bytes())); // AuthenticationOk
        greeting.extend(parameter_status("client_encoding", "UTF8"));
        greeting.extend(parameter_status("integer_datetimes", "on"));
        greeting.extend(parameter_status("server_version", "16.2"));
        greeting.extend(parameter_status("standard_conforming_strings", "on"));
        greeting.extend(parameter_status("DateStyle", "ISO, MDY"));
        let mut key_data = Vec::new();
        key_data.put_i32(4242);
        key_data.put_i32(98765);
        greeting.extend(msg(b'K', &key_data));
        greeting.extend(ready(b'I'));
        writer.lock().await.write_all(&greeting).await.unwrap();

        if let Some((delay, bytes)) = push {
            let writer = writer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = writer.lock().await.write_all(&bytes).await;
            });
        }

        loop {
            let mut kind = [0u8; 1];
            if reader.read_exact(&mut kind).await.is_err() {
                break;
            }
            let len = reader.read_i32().await.unwrap();
            let mut body = vec![0u8; len as usize - 4];
            reader.read_exact(&mut body).await.unwrap();

            server_log.lock().unwrap().push(kind[0]);
            if kind[0] == b'X' {
                break;
            }
            let response = script(kind[0], &body);
            if !response.is_empty() {
                writer.lock().await.write_all(&response).await.unwrap();
            }
        }
    });

    TestServer {
        url: format!("pq://tester:sekret@127.0.0.1:{port}/testdb?[sslmode]=disable"),
        log,
    }
}

// ===== tests =====

#[tokio::test]
async fn simple_query_concatenates_per_statement() {
    let server = spawn_server(
        Box::new(|kind, _body| match kind {
            b'Q' => {
                let mut out = Vec::new();
                out.extend(row_description(&[("n", 25)]));
                out.extend(data_row(&[Some(b"one")]));
                out.extend(data_row(&[Some(b"two")]));
                out.extend(command_complete("SELECT 2"));
                out.extend(command_complete("CREATE TABLE"));
                out.extend(ready(b'I'));
                out
            }
            _ => vec![],
        }),
        None,
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();
    assert_eq!(conn.parameter("server_version"), Some("16.2"));
    assert_eq!(conn.pid(), 4242);

    let results = conn.query_simple("SELECT n FROM t; CREATE TABLE x()").await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rows.len(), 2);
    assert_eq!(results[0].rows_affected, 2);
    assert_eq!(results[0].rows[0].try_get::<_, String>("n").unwrap(), "one");
    assert_eq!(results[1].tag.as_str(), "CREATE TABLE");
    assert!(results[1].rows.is_empty());

    // state invariant: back to ready, idle
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn extended_query_echoes_integer() {
    let server = spawn_server(
        Box::new(|kind, _body| match kind {
            b'P' => parse_complete(),
            b'D' => {
                let mut out = parameter_description(&[23]);
                out.extend(row_description(&[("int4", 23)]));
                out
            }
            b'B' => bind_complete(),
            b'E' => {
                let mut out = data_row(&[Some(&(-12345i32).to_be_bytes())]);
                out.extend(command_complete("SELECT 1"));
                out
            }
            b'S' => ready(b'I'),
            _ => vec![],
        }),
        None,
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();
    let stmt = conn.prepare("SELECT $1::int4").await.unwrap();
    assert_eq!(stmt.param_oids(), &[23]);

    let first = stmt.first(&mut conn, &[(-12345i32).into()]).await.unwrap();
    let First::Value(Value::Int4(echoed)) = first else {
        panic!("expected scalar, got {first:?}");
    };
    assert_eq!(echoed, -12345);
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn failed_block_rejects_locally_until_rollback() {
    let server = spawn_server(
        Box::new({
            // mirrors the server's transaction state machine
            let mut begun = false;
            let mut failed = false;
            move |kind, _body| match kind {
                b'Q' => match begun {
                    false => {
                        begun = true;
                        let mut out = command_complete("BEGIN");
                        out.extend(ready(b'T'));
                        out
                    }
                    true => {
                        begun = false;
                        failed = false;
                        let mut out = command_complete("ROLLBACK");
                        out.extend(ready(b'I'));
                        out
                    }
                },
                b'P' => parse_complete(),
                b'D' => {
                    let mut out = parameter_description(&[]);
                    out.extend(row_description(&[("?column?", 23)]));
                    out
                }
                b'B' => match begun && !failed {
                    true => {
                        failed = true;
                        error_response("22012", "division by zero")
                    }
                    false => bind_complete(),
                },
                b'E' => match failed {
                    // everything until Sync is ignored after an error
                    true => vec![],
                    false => {
                        let mut out = data_row(&[Some(&1i32.to_be_bytes())]);
                        out.extend(command_complete("SELECT 1"));
                        out
                    }
                },
                b'S' => match (failed, begun) {
                    (true, _) => ready(b'E'),
                    (false, true) => ready(b'T'),
                    (false, false) => ready(b'I'),
                },
                _ => vec![],
            }
        }),
        None,
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();
    conn.execute("BEGIN").await.unwrap();

    let stmt = conn.prepare("SELECT 1/0").await.unwrap();
    let err = stmt.first(&mut conn, &[]).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("22012"));
    assert_eq!(conn.transaction_status(), TransactionStatus::FailedBlock);

    let frames_before = server.log.lock().unwrap().len();

    // rejected locally: no bytes cross the wire
    let err = conn.prepare("SELECT 1").await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::State(StateError::InFailedBlock)
    ));
    assert_eq!(server.log.lock().unwrap().len(), frames_before);

    conn.execute("ROLLBACK").await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    // and the connection is usable again
    let stmt = conn.prepare("SELECT 1").await.unwrap();
    let First::Value(Value::Int4(one)) = stmt.first(&mut conn, &[]).await.unwrap() else {
        panic!("expected scalar");
    };
    assert_eq!(one, 1);
}

#[tokio::test]
async fn notification_delivery_then_idle() {
    let server = spawn_server(
        Box::new(|kind, _body| match kind {
            b'Q' => {
                // the empty polling query
                let mut out = empty_query_response();
                out.extend(ready(b'I'));
                out
            }
            _ => vec![],
        }),
        Some((Duration::from_millis(50), notification(7001, "c", "hello"))),
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();

    let mut manager = conn.iter_notifications(Some(Duration::from_millis(300)));

    let event = manager.next().await.expect("manager yields");
    let NotifyEvent::Notified { connection, notifications } = event else {
        panic!("expected a notification before the idle tick");
    };
    assert_eq!(connection, 0);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].channel.as_str(), "c");
    assert_eq!(notifications[0].payload.as_str(), "hello");
    assert_eq!(notifications[0].pid, 7001);

    // nothing further: the idle tick arrives, the safe point to break
    match manager.next().await {
        Some(NotifyEvent::Idle) => {}
        other => panic!("expected idle, got {other:?}"),
    }
}

#[tokio::test]
async fn copy_transfer_counts_every_row() {
    const ROWS: usize = 1000;

    let source = spawn_server(
        Box::new(|kind, _body| match kind {
            b'Q' => {
                let mut out = copy_out_response();
                for i in 1..=ROWS {
                    out.extend(copy_data(format!("{i}\n").as_bytes()));
                }
                out.extend(copy_done());
                out.extend(command_complete(&format!("COPY {ROWS}")));
                out.extend(ready(b'I'));
                out
            }
            _ => vec![],
        }),
        None,
    )
    .await;

    let sink = spawn_server(
        Box::new({
            let mut rows = 0usize;
            move |kind, _body| match kind {
                b'Q' => copy_in_response(),
                b'd' => {
                    rows += 1;
                    vec![]
                }
                b'c' => {
                    let mut out = command_complete(&format!("COPY {rows}"));
                    out.extend(ready(b'I'));
                    out
                }
                _ => vec![],
            }
        }),
        None,
    )
    .await;

    let mut from = Connection::connect(&source.url).await.unwrap();
    let mut to = Connection::connect(&sink.url).await.unwrap();

    let producer = from
        .copy_out("COPY (SELECT i FROM generate_series(1,1000) g(i)) TO STDOUT")
        .await
        .unwrap();
    let receiver = to.copy_in("COPY loading_table FROM STDIN").await.unwrap();

    let stats = transfer(producer, vec![receiver]).await.unwrap();
    assert_eq!(stats.chunks, ROWS as u64);

    // both connections are back in an ordinary ready state
    assert_eq!(from.transaction_status(), TransactionStatus::Idle);
    assert_eq!(to.transaction_status(), TransactionStatus::Idle);
    let count = sink.log.lock().unwrap().iter().filter(|k| **k == b'd').count();
    assert_eq!(count, ROWS);
}

#[tokio::test]
async fn row_stream_is_lazy_and_single_pass() {
    use futures_util::StreamExt;

    let server = spawn_server(
        Box::new(|kind, _body| match kind {
            b'P' => parse_complete(),
            b'D' => {
                let mut out = parameter_description(&[]);
                out.extend(row_description(&[("i", 23)]));
                out
            }
            b'B' => bind_complete(),
            b'E' => {
                let mut out = Vec::new();
                for i in [10i32, 20, 30] {
                    out.extend(data_row(&[Some(&i.to_be_bytes())]));
                }
                out.extend(command_complete("SELECT 3"));
                out
            }
            b'S' => ready(b'I'),
            _ => vec![],
        }),
        None,
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();
    let stmt = conn.prepare("SELECT i FROM t").await.unwrap();

    let mut stream = stmt.rows(&mut conn, &[]).await.unwrap();
    let mut seen = Vec::new();
    while let Some(row) = stream.next().await {
        seen.push(row.unwrap().try_get::<_, i32>("i").unwrap());
    }
    assert_eq!(seen, vec![10, 20, 30]);
    assert_eq!(stream.tag().map(|t| t.rows_affected()), Some(3));
    drop(stream);

    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = spawn_server(
        Box::new(|kind, _body| match kind {
            b'C' => close_complete(),
            b'P' => parse_complete(),
            b'D' => {
                let mut out = parameter_description(&[]);
                out.extend(row_description(&[("x", 23)]));
                out
            }
            b'S' => ready(b'I'),
            _ => vec![],
        }),
        None,
    )
    .await;

    let mut conn = Connection::connect(&server.url).await.unwrap();
    let mut stmt = conn.prepare("SELECT 1").await.unwrap();

    stmt.close(&mut conn).await.unwrap();
    stmt.close(&mut conn).await.unwrap();
    assert!(stmt.is_closed());

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());

    // operations after close fail locally
    let err = conn.query_simple("SELECT 1").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(StateError::Closed)));

    // exactly one Close and one Terminate crossed the wire
    tokio::time::sleep(Duration::from_millis(50)).await;
    let log = server.log.lock().unwrap();
    assert_eq!(log.iter().filter(|k| **k == b'C').count(), 1);
    assert_eq!(log.iter().filter(|k| **k == b'X').count(), 1);
}
