use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::test::{init_test_log, test_config};
use crate::testserver::{read_request, TestServer};
use crate::{Client, Context, Error, Request, Transport, TransportConfig};

/// Reads the request and then goes silent, holding the conn open.
fn black_hole(stream: TcpStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    while read_request(&mut reader).is_some() {
        thread::sleep(Duration::from_secs(30));
    }
    Ok(())
}

#[test]
fn response_header_timeout_fires() {
    init_test_log();
    let server = TestServer::new(black_hole);
    let transport = Arc::new(Transport::new(TransportConfig {
        response_header_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    }));
    let client = Client::with_transport(transport);

    let start = Instant::now();
    let err = client.get(&server.url("/")).unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_temporary());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn context_deadline_fires() {
    init_test_log();
    let server = TestServer::new(black_hole);
    let client = Client::with_transport(Arc::new(Transport::new(test_config())));

    let mut req = Request::new(http::Method::GET, &server.url("/")).unwrap();
    req.set_context(Context::with_timeout(Duration::from_millis(200)));

    let start = Instant::now();
    let err = client.do_request(req).unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn cancel_surfaces_cancellation_not_io() {
    init_test_log();
    let server = TestServer::new(black_hole);
    let client = Client::with_transport(Arc::new(Transport::new(test_config())));

    let ctx = Context::new();
    let mut req = Request::new(http::Method::GET, &server.url("/")).unwrap();
    req.set_context(ctx.clone());

    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        ctx.cancel();
    });

    let err = client.do_request(req).unwrap_err();
    canceler.join().unwrap();

    // the socket teardown manufactures io errors; the cause reported
    // must still be the cancellation.
    assert!(
        matches!(err.root_cause(), Error::RequestCanceled),
        "got {:?}",
        err
    );
}

#[test]
fn cancel_before_dispatch() {
    init_test_log();
    let server = TestServer::new(black_hole);
    let client = Client::with_transport(Arc::new(Transport::new(test_config())));

    let ctx = Context::new();
    ctx.cancel();
    let mut req = Request::new(http::Method::GET, &server.url("/")).unwrap();
    req.set_context(ctx);

    let err = client.do_request(req).unwrap_err();
    assert!(matches!(err.root_cause(), Error::RequestCanceled));
}

#[test]
fn cancel_during_body_read() {
    init_test_log();
    // sends headers and half a body, then stalls.
    let server = TestServer::new(|stream: TcpStream| {
        use std::io::Write;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        if read_request(&mut reader).is_some() {
            out.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")?;
            out.flush()?;
            thread::sleep(Duration::from_secs(30));
        }
        Ok(())
    });
    let client = Client::with_transport(Arc::new(Transport::new(test_config())));

    let ctx = Context::new();
    let mut req = Request::new(http::Method::GET, &server.url("/")).unwrap();
    req.set_context(ctx.clone());

    let mut resp = client.do_request(req).unwrap();

    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        ctx.cancel();
    });

    let err = resp.body_mut().read_to_string().unwrap_err();
    canceler.join().unwrap();
    assert!(err.to_string().contains("canceled"), "got {}", err);
}
