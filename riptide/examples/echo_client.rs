//! Drive the echo server with the client reactor:
//! `cargo run --example echo_client`.

use std::net::TcpStream;
use std::sync::Arc;

use riptide::{Callback, Client, Config, Conn, Error};

struct Print;

impl Callback for Print {
    fn on_open(&self, conn: &Arc<Conn>) {
        let _ = conn.write(b"hello from riptide\n");
    }

    fn on_data(&self, conn: &Arc<Conn>, data: &[u8]) {
        print!("{}", String::from_utf8_lossy(data));
        conn.close();
    }

    fn on_close(&self, _conn: &Arc<Conn>, _err: Option<&Error>) {
        std::process::exit(0);
    }
}

fn main() -> Result<(), Error> {
    let client = Client::new(Config::default(), Print)?;
    let stream = TcpStream::connect("127.0.0.1:7878").map_err(Error::Io)?;
    client.register(stream)?;
    client.serve();
    Ok(())
}
