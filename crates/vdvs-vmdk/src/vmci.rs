//! vSocket wire protocol to the hypervisor volume service.
//!
//! Every request is one connection carrying one frame each way. A frame is
//! a magic word, the payload length (trailing NUL included) and the
//! NUL-terminated JSON payload. Integers use the guest's native byte order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use bytes::{Bytes, BytesMut};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, VsockAddr};
use serde::Serialize;

/// Marks the start of every frame.
pub const MAGIC: u32 = 0x0bad_beef;

/// Context id of the hypervisor host.
pub const ESX_CID: u32 = 2;

/// Protocol version sent with every request.
pub const PROTOCOL_VERSION: &str = "2";

/// Replies larger than this are treated as corrupt.
pub const MAX_REPLY_LEN: u32 = 1 << 20;

/// Request envelope understood by the volume service.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub cmd: &'a str,
    pub details: Details<'a>,
    pub version: &'a str,
}

#[derive(Debug, Serialize)]
pub struct Details<'a> {
    #[serde(rename = "Name")]
    pub name: &'a str,
    #[serde(rename = "Opts", skip_serializing_if = "Option::is_none")]
    pub opts: Option<&'a HashMap<String, String>>,
}

impl<'a> Request<'a> {
    pub fn new(cmd: &'a str, name: &'a str, opts: Option<&'a HashMap<String, String>>) -> Self {
        Self {
            cmd,
            details: Details { name, opts },
            version: PROTOCOL_VERSION,
        }
    }
}

/// Frames a payload for the wire.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let len = payload.len() as u32 + 1;
    let mut buf = BytesMut::with_capacity(8 + payload.len() + 1);
    buf.extend_from_slice(&MAGIC.to_ne_bytes());
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&[0]);
    buf.freeze()
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    Ok(u32::from_ne_bytes(word))
}

/// Reads one frame and returns its payload without trailing NULs.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let magic = read_u32(r)?;
    if magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to receive magic: 0x{:x}", magic),
        ));
    }
    let len = read_u32(r)?;
    if len > MAX_REPLY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("reply length {} exceeds {}", len, MAX_REPLY_LEN),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    while payload.last() == Some(&0) {
        payload.pop();
    }
    Ok(payload)
}

/// Sends one request frame on `stream` and reads the reply payload.
pub fn round_trip_on<S: Read + Write>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(&encode_frame(payload))?;
    stream.flush()?;
    read_frame(stream)
}

/// Blocking request/reply exchange with the volume service.
pub trait Transport: Send + Sync + 'static {
    fn round_trip(&self, payload: &[u8]) -> io::Result<Vec<u8>>;
}

/// `AF_VSOCK` stream socket to the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct VsockTransport {
    cid: u32,
    port: u32,
}

impl VsockTransport {
    pub fn new(port: u32) -> Self {
        Self { cid: ESX_CID, port }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    fn connect(&self) -> io::Result<File> {
        let fd = socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        connect(fd.as_raw_fd(), &VsockAddr::new(self.cid, self.port))?;
        Ok(File::from(fd))
    }
}

impl Transport for VsockTransport {
    fn round_trip(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = self.connect()?;
        round_trip_on(&mut stream, payload)
    }
}
