//! Minimal echo server: `cargo run --example echo_server`, then
//! `nc 127.0.0.1 7878`.

use std::sync::Arc;

use riptide::{Callback, Config, Conn, Error, Server};

struct Echo;

impl Callback for Echo {
    fn on_open(&self, conn: &Arc<Conn>) {
        println!("open fd={}", conn.fd());
    }

    fn on_data(&self, conn: &Arc<Conn>, data: &[u8]) {
        let _ = conn.write(data);
    }

    fn on_close(&self, conn: &Arc<Conn>, err: Option<&Error>) {
        println!("close fd={} err={err:?}", conn.fd());
    }
}

fn main() -> Result<(), Error> {
    let server = Server::new(Config::default(), Echo)?;
    println!("echo server on 127.0.0.1:7878");
    server.listen_and_serve("127.0.0.1:7878")
}
