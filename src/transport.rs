//! Byte transport beneath a connection
//!
//! The receive thread only calls [`Transport::recv`] and the transmit thread
//! only calls [`Transport::send`], so implementations must allow the two to
//! run concurrently. [`Transport::shutdown`] unblocks both.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

pub trait Transport: Send + Sync {
    /// Write every buffer in order; returns the number of bytes written,
    /// which is less than the total only if the peer went away.
    fn send(&self, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Fill `buf`; returns fewer bytes than requested only at end of stream
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn shutdown(&self);

    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Transport over a connected TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(TcpTransport { stream, peer })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn send(&self, bufs: &[&[u8]]) -> io::Result<usize> {
        let mut writer = &self.stream;
        let mut total = 0;
        for buf in bufs {
            match writer.write_all(buf) {
                Ok(()) => total += buf.len(),
                Err(e) if e.kind() == io::ErrorKind::WriteZero => return Ok(total),
                Err(e) => return Err(e),
            }
        }
        writer.flush()?;
        Ok(total)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = &self.stream;
        let mut got = 0;
        while got < buf.len() {
            match reader.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(got)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
