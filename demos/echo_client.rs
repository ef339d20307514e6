//! Framed client for the echo servers: sends ten messages and prints the
//! echoes, buffering reads until a whole frame is decodable.

use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};
use sluice::{Error, PacketConfig};

fn main() -> Result<()> {
    let packet = PacketConfig::new(2, 512, 512)?;
    let mut stream = TcpStream::connect("127.0.0.1:8081").context("connect to echo server")?;
    let mut recv_buf = Vec::new();

    for i in 0..10 {
        let frame = packet.encode(format!("This is {i}").as_bytes())?;
        stream.write_all(&frame)?;

        let payload = read_frame(&packet, &mut stream, &mut recv_buf)?;
        println!("{}", String::from_utf8_lossy(&payload));
    }
    Ok(())
}

/// Reads from `stream` into `recv_buf` until one whole frame is decodable,
/// then consumes and returns its payload.
fn read_frame(
    packet: &PacketConfig,
    stream: &mut TcpStream,
    recv_buf: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    loop {
        match packet.decode(recv_buf) {
            Ok(payload) => {
                recv_buf.drain(..packet.header_len() + payload.len());
                return Ok(payload);
            }
            Err(Error::TruncatedFrame { .. }) => {
                let mut chunk = [0u8; 1024];
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    bail!("server closed the connection");
                }
                recv_buf.extend_from_slice(&chunk[..n]);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
