use std::sync::Arc;
use std::time::Duration;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("remote peer closed the connection")]
    RemotePeerClosed,
    #[error("transport was closed locally")]
    ServerClosed,
    #[error("read deadline exceeded")]
    ReadTimeout,
    #[error("zlib error: {0}")]
    Compression(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// The per-connection byte pipe. Owned by the session task; TLS and zlib
/// are layered in place, each at most once per stream lifetime.
pub struct Transport {
    socket: Option<Socket>,
    read_buffer: Vec<u8>,
    keep_alive: Duration,
    compressor: Option<ZlibCodec>,
}

impl Transport {
    pub fn new(socket: TcpStream, buffer_size: usize, keep_alive: Duration) -> Self {
        Self {
            socket: Some(Socket::Plain(socket)),
            read_buffer: vec![0; buffer_size],
            keep_alive,
            compressor: None,
        }
    }

    pub fn is_secured(&self) -> bool {
        matches!(self.socket, Some(Socket::Tls(_)))
    }

    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Reads the next chunk of stream bytes. The read deadline is re-armed
    /// on every call from the configured keep-alive.
    pub async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::ServerClosed)?;
        let read = async {
            match socket {
                Socket::Plain(stream) => stream.read(&mut self.read_buffer).await,
                Socket::Tls(stream) => stream.read(&mut self.read_buffer).await,
            }
        };
        let count = tokio::time::timeout(self.keep_alive, read)
            .await
            .map_err(|_| TransportError::ReadTimeout)??;
        if count == 0 {
            return Err(TransportError::RemotePeerClosed);
        }

        let bytes = &self.read_buffer[..count];
        match &mut self.compressor {
            Some(compressor) => compressor.decompress(bytes),
            None => Ok(bytes.to_vec()),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let deflated;
        let bytes = match &mut self.compressor {
            Some(compressor) => {
                deflated = compressor.compress(bytes)?;
                &deflated
            }
            None => bytes,
        };

        let socket = self.socket.as_mut().ok_or(TransportError::ServerClosed)?;
        match socket {
            Socket::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Socket::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = match &mut socket {
                Socket::Plain(stream) => stream.shutdown().await,
                Socket::Tls(stream) => stream.shutdown().await,
            };
        }
    }

    /// Replaces the plain TCP stream with a server-side TLS stream.
    pub async fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), TransportError> {
        match self.socket.take() {
            Some(Socket::Plain(stream)) => {
                let accepted = TlsAcceptor::from(config).accept(stream).await?;
                self.socket = Some(Socket::Tls(Box::new(accepted)));
                Ok(())
            }
            Some(tls @ Socket::Tls(_)) => {
                self.socket = Some(tls);
                Err(TransportError::Io(std::io::Error::other(
                    "transport is already secured",
                )))
            }
            None => Err(TransportError::ServerClosed),
        }
    }

    pub fn enable_compression(&mut self, level: Option<u32>) {
        if self.compressor.is_none() {
            self.compressor = Some(ZlibCodec::new(level));
        }
    }

    /// Channel-binding data for SCRAM `-PLUS` mechanisms. Sourced from the
    /// TLS keying-material exporter; absent on plaintext transports.
    pub fn channel_binding_bytes(&self, kind: &str) -> Option<Vec<u8>> {
        if kind != "tls-unique" {
            return None;
        }
        match &self.socket {
            Some(Socket::Tls(stream)) => {
                let (_, connection) = stream.get_ref();
                connection
                    .export_keying_material(vec![0u8; 32], b"EXPORTER-Channel-Binding", None)
                    .ok()
            }
            _ => None,
        }
    }
}

/// Stateful zlib streams for XEP-0138. One deflate and one inflate context
/// live for the rest of the connection once compression is negotiated.
struct ZlibCodec {
    deflate: Compress,
    inflate: Decompress,
}

impl ZlibCodec {
    fn new(level: Option<u32>) -> Self {
        let level = level.map_or_else(Compression::default, Compression::new);
        Self {
            deflate: Compress::new(level, true),
            inflate: Decompress::new(true),
        }
    }

    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut output = Vec::with_capacity(input.len() + 64);
        let mut consumed = 0;
        loop {
            if output.len() == output.capacity() {
                output.reserve(1024);
            }
            let in_before = self.deflate.total_in();
            let out_before = self.deflate.total_out();
            let status = self
                .deflate
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|err| TransportError::Compression(err.to_string()))?;
            consumed += (self.deflate.total_in() - in_before) as usize;
            let produced = self.deflate.total_out() - out_before;

            if matches!(status, Status::StreamEnd)
                || (consumed >= input.len() && produced == 0 && output.len() < output.capacity())
            {
                return Ok(output);
            }
        }
    }

    fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut output = Vec::with_capacity(input.len() * 4);
        let mut consumed = 0;
        loop {
            if output.len() == output.capacity() {
                output.reserve(1024);
            }
            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();
            let status = self
                .inflate
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|err| TransportError::Compression(err.to_string()))?;
            consumed += (self.inflate.total_in() - in_before) as usize;
            let produced = self.inflate.total_out() - out_before;

            if matches!(status, Status::StreamEnd)
                || (consumed >= input.len() && produced == 0 && output.len() < output.capacity())
            {
                return Ok(output);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trips_across_codec_instances() {
        let mut writer = ZlibCodec::new(Some(6));
        let mut reader = ZlibCodec::new(None);

        let first = b"<presence from=\"alice@localhost/phone\"/>";
        let second = b"<message to=\"bob@localhost\"><body>hi</body></message>";

        let deflated = writer.compress(first).unwrap();
        assert_ne!(deflated, first.to_vec());
        assert_eq!(reader.decompress(&deflated).unwrap(), first.to_vec());

        // the dictionary persists across writes on the same stream
        let deflated = writer.compress(second).unwrap();
        assert_eq!(reader.decompress(&deflated).unwrap(), second.to_vec());
    }

    #[test]
    fn zlib_handles_large_payloads() {
        let mut writer = ZlibCodec::new(Some(1));
        let mut reader = ZlibCodec::new(None);

        let payload = "<body>".repeat(4096);
        let deflated = writer.compress(payload.as_bytes()).unwrap();
        assert_eq!(reader.decompress(&deflated).unwrap(), payload.as_bytes());
    }

    #[tokio::test]
    async fn read_reports_peer_close_and_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut transport = Transport::new(server, 4096, Duration::from_millis(50));
        assert!(matches!(
            transport.read().await,
            Err(TransportError::ReadTimeout)
        ));

        drop(client);
        assert!(matches!(
            transport.read().await,
            Err(TransportError::RemotePeerClosed)
        ));
    }
}
