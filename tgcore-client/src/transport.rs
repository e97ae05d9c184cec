//! Byte streams to data centers and the framed connection on top of them.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tgcore_crypto::rsa;
use tgcore_mtproto::authentication::{self, Finished};
use tgcore_mtproto::{FrameCodec, FrameError, Framing, MsgIdGenerator, plain};
use tgcore_tl::{Registry, Serializable, TlObject};

use crate::errors::InvocationError;
use crate::locked;

/// A bidirectional byte stream to a data center.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send + 'a>>;

/// Opens byte streams. The default dials TCP; tests and proxies plug in
/// their own.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, dc_id: i32, addr: &'a str) -> ConnectFuture<'a>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, _dc_id: i32, addr: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxStream)
        })
    }
}

/// Which MTProto transport framing to use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// 1-byte length prefix for short frames.
    #[default]
    Abridged,
    /// 4-byte little-endian length prefix.
    Intermediate,
    /// Length, sequence number and CRC32 around every frame.
    Full,
    /// Abridged framing under an AES-CTR obfuscation layer, optionally keyed
    /// with an MTProxy secret.
    Obfuscated { secret: Option<[u8; 16]> },
}

impl TransportKind {
    pub(crate) fn codec(&self, dc_id: i32) -> Result<FrameCodec, FrameError> {
        Ok(match self {
            Self::Abridged => FrameCodec::plain(Framing::Abridged),
            Self::Intermediate => FrameCodec::plain(Framing::Intermediate),
            Self::Full => FrameCodec::plain(Framing::Full),
            Self::Obfuscated { secret } => {
                let dc = i16::try_from(dc_id).map_err(|_| FrameError::Unsupported)?;
                FrameCodec::obfuscated(Framing::Abridged, secret.as_ref(), dc)?
            }
        })
    }
}

// ─── Connection ───────────────────────────────────────────────────────────────

type SharedCodec = Arc<Mutex<FrameCodec>>;

/// A framed stream to one data center.
pub(crate) struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub async fn open(
        connector: &dyn Connector,
        kind: &TransportKind,
        dc_id: i32,
        addr: &str,
    ) -> Result<Self, InvocationError> {
        tracing::debug!("[tgcore] connecting to DC{dc_id} at {addr}");
        let codec = Arc::new(Mutex::new(kind.codec(dc_id)?));
        let stream = connector.connect(dc_id, addr).await?;
        let (read, write) = tokio::io::split(stream);
        Ok(Self {
            reader: FrameReader { half: read, codec: Arc::clone(&codec), buf: vec![0; 16 * 1024] },
            writer: FrameWriter { half: write, codec },
        })
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), InvocationError> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, InvocationError> {
        self.reader.recv().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

pub(crate) struct FrameReader {
    half: ReadHalf<BoxStream>,
    codec: SharedCodec,
    buf: Vec<u8>,
}

impl FrameReader {
    /// The next complete frame. End of stream and read errors both surface
    /// as [`InvocationError::Disconnected`].
    pub async fn recv(&mut self) -> Result<Vec<u8>, InvocationError> {
        loop {
            if let Some(frame) = locked(&self.codec).next_frame()? {
                return Ok(frame);
            }
            let n = match self.half.read(&mut self.buf).await {
                Ok(0) => return Err(InvocationError::Disconnected),
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("[tgcore] read failed: {e}");
                    return Err(InvocationError::Disconnected);
                }
            };
            locked(&self.codec).push_inbound(&self.buf[..n]);
        }
    }
}

pub(crate) struct FrameWriter {
    half: WriteHalf<BoxStream>,
    codec: SharedCodec,
}

impl FrameWriter {
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), InvocationError> {
        let wire = locked(&self.codec).encode(payload);
        let result = async {
            self.half.write_all(&wire).await?;
            self.half.flush().await
        }
        .await;
        result.map_err(|e| {
            tracing::debug!("[tgcore] write failed: {e}");
            InvocationError::Disconnected
        })
    }
}

// ─── Auth key exchange ────────────────────────────────────────────────────────

/// Run the DH handshake over a fresh connection.
pub(crate) async fn authenticate(
    conn: &mut Connection,
    registry: &Registry,
    trusted: &[rsa::Key],
) -> Result<Finished, InvocationError> {
    let mut ids = MsgIdGenerator::new(0);

    let (request, step1) = authentication::step1()?;
    let response = exchange(conn, registry, &mut ids, &request).await?;
    let (request, step2) = authentication::step2(step1, &response, trusted)?;
    let response = exchange(conn, registry, &mut ids, &request).await?;
    let (request, step3) = authentication::step3(step2, &response)?;
    let response = exchange(conn, registry, &mut ids, &request).await?;
    let finished = authentication::finish(step3, &response)?;

    tracing::info!("[tgcore] auth key negotiated (time offset {}s)", finished.time_offset);
    Ok(finished)
}

async fn exchange(
    conn: &mut Connection,
    registry: &Registry,
    ids: &mut MsgIdGenerator,
    request: &TlObject,
) -> Result<TlObject, InvocationError> {
    conn.send(&plain::pack(ids.next(), &request.to_bytes())).await?;
    let frame = conn.recv().await?;
    let (_, body) = plain::unpack(&frame)?;
    Ok(registry.decode_object(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let codec = Arc::new(Mutex::new(FrameCodec::plain(Framing::Intermediate)));
        let (read, write) = tokio::io::split(Box::new(client) as BoxStream);
        let mut conn = Connection {
            reader: FrameReader { half: read, codec: Arc::clone(&codec), buf: vec![0; 64] },
            writer: FrameWriter { half: write, codec },
        };

        let (mut server_read, mut server_write) = tokio::io::split(server);
        conn.send(&[1, 2, 3, 4]).await.unwrap();

        let mut wire = [0u8; 12];
        server_read.read_exact(&mut wire).await.unwrap();
        let mut accepted = None;
        for len in 1..=wire.len() {
            if let Some(found) = FrameCodec::accept(&wire[..len], None).unwrap() {
                accepted = Some((found, len));
                break;
            }
        }
        let ((mut server_codec, used), _) = accepted.unwrap();
        server_codec.push_inbound(&wire[used..]);
        assert_eq!(server_codec.next_frame().unwrap(), Some(vec![1, 2, 3, 4]));

        let reply = server_codec.encode(&[9; 8]);
        server_write.write_all(&reply).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), vec![9; 8]);

        drop(server_write);
        drop(server_read);
        assert!(matches!(conn.recv().await, Err(InvocationError::Disconnected)));
    }

    #[test]
    fn obfuscated_codec_needs_a_small_dc_id() {
        let kind = TransportKind::Obfuscated { secret: None };
        assert!(kind.codec(2).is_ok());
        assert!(kind.codec(70_000).is_err());
    }
}
