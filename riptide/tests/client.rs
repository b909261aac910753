//! Integration tests for the client-side reactor pool: register
//! already-connected sockets and drive callbacks for inbound bytes.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use riptide::{Callback, Client, Config, Conn, Error, TaskConfig};

#[derive(Default)]
struct Received {
    opens: AtomicUsize,
    closes: AtomicUsize,
    bytes: Mutex<Vec<u8>>,
    conns: Mutex<Vec<Arc<Conn>>>,
}

struct Collector {
    received: Arc<Received>,
}

impl Callback for Collector {
    fn on_open(&self, conn: &Arc<Conn>) {
        self.received.opens.fetch_add(1, Ordering::SeqCst);
        self.received.conns.lock().unwrap().push(conn.clone());
    }
    fn on_data(&self, _conn: &Arc<Conn>, data: &[u8]) {
        self.received.bytes.lock().unwrap().extend_from_slice(data);
    }
    fn on_close(&self, _conn: &Arc<Conn>, _err: Option<&Error>) {
        self.received.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.reactors = 1;
    config.task = TaskConfig {
        min: 1,
        max: 8,
        init_count: 1,
    };
    config
}

/// A plain std echo server on a free port.
fn spawn_std_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => return,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn wait_until(msg: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out: {msg}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn register_and_round_trip() {
    let addr = spawn_std_echo();
    let received = Arc::new(Received::default());
    let client = Arc::new(
        Client::new(
            test_config(),
            Collector {
                received: received.clone(),
            },
        )
        .unwrap(),
    );

    let serving = client.clone();
    let server_thread = thread::spawn(move || serving.serve());

    let stream = TcpStream::connect(&addr).unwrap();
    client.register(stream).unwrap();
    assert_eq!(received.opens.load(Ordering::SeqCst), 1);
    assert_eq!(client.active_connections(), 1);

    let conn = received.conns.lock().unwrap()[0].clone();
    let n = conn.write(b"over and back").unwrap();
    assert_eq!(n, 13);

    wait_until("echo received", Duration::from_secs(5), || {
        received.bytes.lock().unwrap().len() == 13
    });
    assert_eq!(&*received.bytes.lock().unwrap(), b"over and back");

    conn.close();
    wait_until("close observed", Duration::from_secs(5), || {
        received.closes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(client.active_connections(), 0);

    client.shutdown();
    server_thread.join().unwrap();
}

#[test]
fn peer_close_delivers_on_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let received = Arc::new(Received::default());
    let client = Arc::new(
        Client::new(
            test_config(),
            Collector {
                received: received.clone(),
            },
        )
        .unwrap(),
    );

    let serving = client.clone();
    let server_thread = thread::spawn(move || serving.serve());

    let stream = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    client.register(stream).unwrap();

    // Server side hangs up; the client reactor must observe it once.
    drop(accepted);
    wait_until("close observed", Duration::from_secs(5), || {
        received.closes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(received.closes.load(Ordering::SeqCst), 1);

    client.shutdown();
    server_thread.join().unwrap();
}

#[test]
fn round_robin_over_reactors() {
    let addr = spawn_std_echo();
    let received = Arc::new(Received::default());
    let mut config = test_config();
    config.reactors = 2;
    let client = Arc::new(
        Client::new(
            config,
            Collector {
                received: received.clone(),
            },
        )
        .unwrap(),
    );

    let serving = client.clone();
    let server_thread = thread::spawn(move || serving.serve());

    for _ in 0..4 {
        let stream = TcpStream::connect(&addr).unwrap();
        client.register(stream).unwrap();
    }
    assert_eq!(received.opens.load(Ordering::SeqCst), 4);
    assert_eq!(client.active_connections(), 4);

    let conns: Vec<Arc<Conn>> = received.conns.lock().unwrap().clone();
    for conn in &conns {
        conn.write(b"ab").unwrap();
    }
    wait_until("all echoes received", Duration::from_secs(5), || {
        received.bytes.lock().unwrap().len() == 8
    });

    for conn in &conns {
        conn.close();
    }
    wait_until("all closes observed", Duration::from_secs(5), || {
        received.closes.load(Ordering::SeqCst) == 4
    });

    client.shutdown();
    server_thread.join().unwrap();
}
