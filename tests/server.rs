//! End-to-end tests over real loopback sockets: one server per test, each
//! with its own listener thread and worker pool.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lyn::h1::{H1Pipeline, Reply, RequestHead};
use lyn::listener::{Listener, StopHandle};
use lyn::{Config, Server};

struct TestServer {
    addr: std::net::SocketAddr,
    stop: StopHandle,
    thread: Option<JoinHandle<Server>>,
}

impl TestServer {
    fn start(config: Config) -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();

        let pipeline = H1Pipeline::new(|req: &RequestHead<'_>| {
            Reply::text(format!("you asked for {}", req.target))
        });
        let server = Server::start(&config, Arc::new(pipeline)).expect("server start");

        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let stop = listener.stop_handle();
        let thread = thread::spawn(move || listener.run(server));

        TestServer {
            addr,
            stop,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn stop(mut self) {
        self.stop.stop();
        let mut server = self.thread.take().unwrap().join().expect("listener join");
        server.shutdown();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.stop();
            if let Ok(mut server) = thread.join() {
                server.shutdown();
            }
        }
    }
}

/// Read one full response: the head through `\r\n\r\n`, then exactly
/// `Content-Length` body bytes.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).expect("read head");
        assert_ne!(0, read, "connection closed mid-head: {:?}", raw);
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).expect("utf8 head");

    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("content-length header")
        .trim()
        .parse()
        .expect("content-length value");

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("read body");
    (head, String::from_utf8(body).expect("utf8 body"))
}

fn small_config() -> Config {
    Config {
        workers: 2,
        ..Config::default()
    }
}

#[test]
fn serves_a_keep_alive_conversation() {
    let server = TestServer::start(small_config());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("Date: "), "head: {head}");
    assert!(head.contains(" GMT"), "head: {head}");
    assert_eq!("you asked for /first", body);

    // Same connection, second request.
    stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!("you asked for /second", body);

    server.stop();
}

#[test]
fn serves_pipelined_requests_back_to_back() {
    let server = TestServer::start(small_config());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
        .unwrap();

    let (_, first) = read_response(&mut stream);
    let (_, second) = read_response(&mut stream);
    assert_eq!("you asked for /a", first);
    assert_eq!("you asked for /b", second);

    server.stop();
}

#[test]
fn connection_close_is_honored() {
    let server = TestServer::start(small_config());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /bye HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"), "head: {head}");
    assert_eq!("you asked for /bye", body);

    // Server closes its side after the response.
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected trailing bytes: {n}"),
        Err(_) => {}
    }

    server.stop();
}

#[test]
fn malformed_requests_get_a_400_and_a_close() {
    let server = TestServer::start(small_config());
    let mut stream = server.connect();

    stream.write_all(b"NONSENSE\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 "), "head: {head}");

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());

    server.stop();
}

#[test]
fn peer_hangup_mid_request_does_not_wedge_the_worker() {
    let server = TestServer::start(small_config());

    {
        let mut stream = server.connect();
        stream.write_all(b"GET /partial").unwrap();
        // Dropped here: the worker sees the hangup and destroys the
        // connection.
    }
    thread::sleep(Duration::from_millis(200));

    let mut stream = server.connect();
    stream.write_all(b"GET /after HTTP/1.1\r\n\r\n").unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!("you asked for /after", body);

    server.stop();
}

#[test]
fn idle_keep_alive_connections_are_reaped() {
    let server = TestServer::start(Config {
        workers: 1,
        keep_alive_timeout: 1,
        ..Config::default()
    });

    let mut stream = server.connect();
    stream.write_all(b"GET /x HTTP/1.1\r\n\r\n").unwrap();
    let _ = read_response(&mut stream);

    // No further traffic: the death queue expires the connection after the
    // keep-alive timeout and closes our socket.
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected bytes instead of close: {n}"),
        Err(err) => panic!("expected clean close, got {err}"),
    }

    server.stop();
}

#[test]
fn cors_config_reaches_the_response() {
    let server = TestServer::start(Config {
        workers: 1,
        allow_cors: true,
        ..Config::default()
    });

    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(
        head.contains("Access-Control-Allow-Origin: *\r\n"),
        "head: {head}"
    );

    server.stop();
}

#[test]
fn head_requests_omit_the_body() {
    let server = TestServer::start(small_config());
    let mut stream = server.connect();

    stream
        .write_all(b"HEAD /h HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8(raw).unwrap();
    let head_end = text.find("\r\n\r\n").expect("head terminator") + 4;

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    // Content-Length advertises the body a GET would have carried, but
    // nothing follows the head.
    assert!(text.contains("Content-Length: "));
    assert_eq!(head_end, text.len());

    server.stop();
}

#[test]
fn shutdown_with_live_connections_closes_them_all() {
    let server = TestServer::start(small_config());

    let mut streams = Vec::new();
    for _ in 0..20 {
        let mut stream = server.connect();
        // Leave the request unfinished so every connection stays alive.
        stream.write_all(b"GET /pending").unwrap();
        streams.push(stream);
    }
    // Let the workers pick all of them up.
    thread::sleep(Duration::from_millis(300));

    server.stop();

    for mut stream in streams {
        let mut rest = Vec::new();
        match stream.read_to_end(&mut rest) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected bytes at shutdown: {n}"),
            // Reset is fine too; the fd was closed with bytes in flight.
            Err(_) => {}
        }
    }
}

#[test]
fn requests_spread_across_many_connections() {
    let server = TestServer::start(small_config());

    let mut streams: Vec<TcpStream> = (0..32).map(|_| server.connect()).collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        stream
            .write_all(format!("GET /conn-{i} HTTP/1.1\r\n\r\n").as_bytes())
            .unwrap();
    }
    for (i, stream) in streams.iter_mut().enumerate() {
        let (_, body) = read_response(stream);
        assert_eq!(format!("you asked for /conn-{i}"), body);
    }

    server.stop();
}
