// TCP connection handler
// Line-delimited JSON over a split TCP stream

use std::io;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A single TCP connection exchanging one JSON object per line
pub struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();

        Connection {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next line without its terminator. `None` on EOF.
    ///
    /// Cancel safe, so it can sit in a `select!` next to writes.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line.to_string()));
                }
                None => return Ok(None),
            }
        }
    }

    /// Serialize and write one message followed by a newline.
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let json_str = serde_json::to_string(value)?;
        self.write_line(&json_str).await
    }

    /// Write an already-encoded line as-is.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
