use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Directory holding the manager's listening sockets.
pub const SOCKET_DIR: &str = "/tmp/sl";

/// Control bit of `h1`; the low seven bits carry the module index.
pub const H_CONTROL: u8 = 0x80;

/// Largest body read issued in a single call.
const READ_CHUNK: usize = 4096;

/// Message kinds (`h2`). Manager-bound and runtime-bound kinds share the
/// low code space; the control bit and direction disambiguate.
pub mod kind {
    pub const KEEPALIVE: u8 = 0x00;
    pub const LOG_RUNTIME: u8 = 0x01;
    pub const EXITED: u8 = 0x02;
    pub const CH_OPEN: u8 = 0x03;
    pub const CH_CLOSE: u8 = 0x04;
    pub const LOG_MODULE: u8 = 0x05;
    pub const PROFILE: u8 = 0x06;

    pub const CREATE: u8 = 0x00;
    pub const DELETE: u8 = 0x01;
    pub const STOP: u8 = 0x02;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {0} bytes exceeds the u16 frame limit")]
    Oversize(usize),
}

/// One framed manager message. The header (u16le payload length, h1, h2)
/// is the first four bytes on the wire; the payload follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub h1: u8,
    pub h2: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(h1: u8, h2: u8, payload: Vec<u8>) -> Self {
        Self { h1, h2, payload }
    }

    pub fn is_control(&self) -> bool {
        self.h1 & H_CONTROL != 0
    }

    /// Module index carried in the header.
    pub fn index(&self) -> u8 {
        self.h1 & !H_CONTROL
    }

    /// Read one frame. A short header is an error; the body is read in
    /// bounded chunks until the declared length is satisfied or the peer
    /// closes.
    pub async fn read<R>(stream: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let payloadlen = u16::from_le_bytes([header[0], header[1]]) as usize;

        let mut payload = vec![0u8; payloadlen];
        let mut filled = 0;
        while filled < payloadlen {
            let end = usize::min(filled + READ_CHUNK, payloadlen);
            stream.read_exact(&mut payload[filled..end]).await?;
            filled = end;
        }

        Ok(Self {
            h1: header[2],
            h2: header[3],
            payload,
        })
    }

    /// Write one frame: header, then body. Frames are never partially
    /// delivered; oversized payloads are rejected rather than narrowed.
    pub async fn write_to<W>(&self, stream: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::Oversize(self.payload.len()))?;

        let mut header = [0u8; 4];
        header[..2].copy_from_slice(&len.to_le_bytes());
        header[2] = self.h1;
        header[3] = self.h2;

        stream.write_all(&header).await?;
        stream.write_all(&self.payload).await?;
        stream.flush().await?;

        Ok(())
    }
}

/// Socket address for a runtime (`module` = `None`) or one of its modules.
pub fn socket_path(runtime: u8, module: Option<u8>) -> PathBuf {
    match module {
        None => PathBuf::from(format!("{SOCKET_DIR}/{runtime:02x}.s")),
        Some(module) => PathBuf::from(format!("{SOCKET_DIR}/{runtime:02x}.{module:02x}.s")),
    }
}

/// Connect to the manager. Fails immediately if the socket does not exist.
pub async fn connect(runtime: u8, module: Option<u8>) -> Result<UnixStream, ProtocolError> {
    Ok(UnixStream::connect(socket_path(runtime, module)).await?)
}
