use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::test::{init_test_log, settle, test_config};
use crate::testserver::{read_request, write_response, TestServer};
use crate::{Client, Error, Request, SendBody, Transport};

fn new_client() -> (Client, Arc<Transport>) {
    let transport = Arc::new(Transport::new(test_config()));
    (Client::with_transport(transport.clone()), transport)
}

/// A server whose connections serve exactly one request and then
/// abruptly drop the next one after reading it: the classic stale
/// keep-alive connection.
fn one_then_drop(requests: Arc<AtomicUsize>) -> impl Fn(TcpStream) -> std::io::Result<()> + Send + Sync {
    move |stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        if read_request(&mut reader).is_some() {
            requests.fetch_add(1, Ordering::SeqCst);
            write_response(&mut out, 200, "OK", &[], b"first")?;
        }
        if read_request(&mut reader).is_some() {
            // received in full, never answered.
            requests.fetch_add(1, Ordering::SeqCst);
            out.shutdown(Shutdown::Both)?;
        }
        Ok(())
    }
}

#[test]
fn get_retries_on_stale_conn() {
    init_test_log();
    let requests = Arc::new(AtomicUsize::new(0));
    let server = TestServer::new(one_then_drop(requests.clone()));
    let (client, _) = new_client();

    let mut resp = client.get(&server.url("/")).unwrap();
    assert_eq!(resp.body_mut().read_to_string().unwrap(), "first");
    drop(resp);
    settle();

    // the second GET rides the pooled conn, hits the drop, and is
    // transparently replayed on a fresh dial.
    let mut resp = client.get(&server.url("/")).unwrap();
    assert_eq!(resp.body_mut().read_to_string().unwrap(), "first");

    assert_eq!(server.dials(), 2);
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[test]
fn streaming_post_not_retried() {
    init_test_log();
    let requests = Arc::new(AtomicUsize::new(0));
    let server = TestServer::new(one_then_drop(requests.clone()));
    let (client, _) = new_client();

    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    drop(resp);
    settle();

    let mut req = Request::new(http::Method::POST, &server.url("/")).unwrap();
    req.set_body(SendBody::from_reader(&b"cannot replay"[..], Some(13)));
    let err = client.do_request(req).unwrap_err();

    // the failure surfaces instead of a retry.
    assert_eq!(server.dials(), 1);
    assert!(matches!(
        err.root_cause(),
        Error::Io(_) | Error::ServerClosedIdle
    ));
}

#[test]
fn post_with_body_not_retried_after_write() {
    init_test_log();
    let requests = Arc::new(AtomicUsize::new(0));
    let server = TestServer::new(one_then_drop(requests.clone()));
    let (client, _) = new_client();

    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    drop(resp);
    settle();

    // a Bytes body is replayable, but POST is not idempotent and the
    // request reached the wire: no retry.
    let err = client
        .post(&server.url("/"), "text/plain", "data")
        .unwrap_err();
    assert_eq!(server.dials(), 1);
    let _ = err;
}

#[test]
fn idempotency_key_lets_post_retry() {
    init_test_log();
    let requests = Arc::new(AtomicUsize::new(0));
    let server = TestServer::new(one_then_drop(requests.clone()));
    let (client, _) = new_client();

    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    drop(resp);
    settle();

    let mut req = Request::new(http::Method::POST, &server.url("/")).unwrap();
    req.set_header("Idempotency-Key", "abc-123").unwrap();
    req.set_body(SendBody::from("data"));
    let mut resp = client.do_request(req).unwrap();
    assert_eq!(resp.body_mut().read_to_string().unwrap(), "first");
    assert_eq!(server.dials(), 2);
}

#[test]
fn no_retry_on_fresh_conn() {
    init_test_log();
    // drops every first request: a fresh dial fails and must not loop.
    let server = TestServer::new(|stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        if read_request(&mut reader).is_some() {
            stream.shutdown(Shutdown::Both)?;
        }
        Ok(())
    });
    let (client, _) = new_client();

    let err = client.get(&server.url("/")).unwrap_err();
    assert_eq!(server.dials(), 1);
    let _ = err;
}
