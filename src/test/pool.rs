use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::test::{init_test_log, settle, test_config};
use crate::testserver::{read_request, serve_all, write_response, TestServer};
use crate::{Client, Transport, TransportConfig};

fn client_with(config: TransportConfig) -> (Client, Arc<Transport>) {
    let transport = Arc::new(Transport::new(config));
    (Client::with_transport(transport.clone()), transport)
}

/// Two concurrent requests against max_conns_per_host=1 share one dial:
/// the second waits and reuses the connection once the first body is
/// drained.
#[test]
fn single_conn_is_shared() {
    init_test_log();
    let server = TestServer::new(|stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        while read_request(&mut reader).is_some() {
            // slow enough that the requests genuinely overlap.
            thread::sleep(Duration::from_millis(100));
            write_response(&mut out, 200, "OK", &[], b"shared")?;
        }
        Ok(())
    });
    let (client, _) = client_with(TransportConfig {
        max_conns_per_host: 1,
        ..test_config()
    });

    let mut workers = Vec::new();
    for _ in 0..2 {
        let client = client.clone();
        let url = server.url("/");
        workers.push(thread::spawn(move || {
            let mut resp = client.get(&url).unwrap();
            resp.body_mut().read_to_string().unwrap()
        }));
    }
    for w in workers {
        assert_eq!(w.join().unwrap(), "shared");
    }
    assert_eq!(server.dials(), 1);
}

#[test]
fn idle_caps_enforced() {
    init_test_log();
    let server = TestServer::new(|stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        while read_request(&mut reader).is_some() {
            thread::sleep(Duration::from_millis(150));
            write_response(&mut out, 200, "OK", &[], b"x")?;
        }
        Ok(())
    });
    let (client, transport) = client_with(TransportConfig {
        max_idle_conns_per_host: 2,
        ..test_config()
    });

    // three overlapping requests force three dials.
    let mut workers = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        let url = server.url("/");
        workers.push(thread::spawn(move || {
            let mut resp = client.get(&url).unwrap();
            resp.body_mut().read_to_string().unwrap();
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    settle();

    assert_eq!(server.dials(), 3);
    // only two survive in the pool.
    assert!(transport.pool().idle_len() <= 2);
}

#[test]
fn pool_wide_idle_cap() {
    init_test_log();
    let server = TestServer::new(|stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        while read_request(&mut reader).is_some() {
            thread::sleep(Duration::from_millis(150));
            write_response(&mut out, 200, "OK", &[], b"x")?;
        }
        Ok(())
    });
    let (client, transport) = client_with(TransportConfig {
        max_idle_conns: 1,
        max_idle_conns_per_host: 10,
        ..test_config()
    });

    let mut workers = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        let url = server.url("/");
        workers.push(thread::spawn(move || {
            let mut resp = client.get(&url).unwrap();
            resp.body_mut().read_to_string().unwrap();
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    settle();

    assert!(transport.pool().idle_len() <= 1);
}

#[test]
fn idle_timeout_evicts() {
    init_test_log();
    let server = TestServer::new(serve_all(200, vec![], b"x".to_vec()));
    let (client, transport) = client_with(TransportConfig {
        idle_conn_timeout: Some(Duration::from_millis(100)),
        ..test_config()
    });

    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    drop(resp);
    settle();
    assert_eq!(transport.pool().idle_len(), 1);

    // the janitor sweeps it out.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(transport.pool().idle_len(), 0);

    // and the next request works on a fresh dial.
    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    assert_eq!(server.dials(), 2);
}

#[test]
fn close_idle_connections_empties_pool() {
    init_test_log();
    let server = TestServer::new(serve_all(200, vec![], b"x".to_vec()));
    let (client, transport) = client_with(test_config());

    let mut resp = client.get(&server.url("/")).unwrap();
    resp.body_mut().read_to_string().unwrap();
    drop(resp);
    settle();
    assert_eq!(transport.pool().idle_len(), 1);

    transport.close_idle_connections();
    assert_eq!(transport.pool().idle_len(), 0);
}

/// Waiters blocked on the per-host cap are released in arrival order.
#[test]
fn conn_waiters_fifo() {
    init_test_log();
    let server = TestServer::new(|stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        while read_request(&mut reader).is_some() {
            thread::sleep(Duration::from_millis(60));
            write_response(&mut out, 200, "OK", &[], b"x")?;
        }
        Ok(())
    });
    let (client, _) = client_with(TransportConfig {
        max_conns_per_host: 1,
        ..test_config()
    });

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        let url = server.url("/");
        let order = order.clone();
        let started = started.clone();
        workers.push(thread::spawn(move || {
            // stagger arrivals well beyond scheduling jitter.
            while started.load(Ordering::SeqCst) < i {
                thread::sleep(Duration::from_millis(5));
            }
            started.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20 * i as u64));
            let mut resp = client.get(&url).unwrap();
            resp.body_mut().read_to_string().unwrap();
            order.lock().unwrap().push(i);
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}
