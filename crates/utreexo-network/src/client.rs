use crate::{Error, Result};
use bitcoin::consensus::encode::{self, Decodable};
use futures::Stream;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use utreexo_primitives::UBlock;

/// Timeout for the stream connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 64 * 1024;

/// Buffers raw bytes until complete values can be decoded.
struct UBlockDecoder {
    unparsed: Vec<u8>,
}

impl UBlockDecoder {
    fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    fn is_empty(&self) -> bool {
        self.unparsed.is_empty()
    }

    /// Returns [`None`] until a whole value is buffered.
    fn decode_next<D: Decodable>(&mut self) -> std::result::Result<Option<D>, encode::Error> {
        match encode::deserialize_partial::<D>(&self.unparsed) {
            Ok((value, index)) => {
                self.unparsed.drain(..index);
                Ok(Some(value))
            }
            Err(encode::Error::Io(err)) if err.kind() == bitcoin::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Receiving end of a UBlock stream.
pub struct UBlockClient {
    stream: TcpStream,
    decoder: UBlockDecoder,
    read_buffer: Box<[u8]>,
}

impl UBlockClient {
    /// Connects to `addr` and requests the blocks `start..end`.
    pub async fn connect(addr: &str, start: i32, end: i32) -> Result<Self> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout(addr.to_string()))??;
        stream.set_nodelay(true)?;

        let mut request = [0u8; 8];
        request[..4].copy_from_slice(&start.to_be_bytes());
        request[4..].copy_from_slice(&end.to_be_bytes());
        stream.write_all(&request).await?;

        tracing::debug!(addr, start, end, "Requested UBlocks");

        Ok(Self {
            stream,
            decoder: UBlockDecoder::new(READ_CHUNK),
            read_buffer: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    /// Next UBlock of the range, `None` once the server closed the stream cleanly.
    pub async fn next_ublock(&mut self) -> Result<Option<UBlock>> {
        loop {
            if let Some(ublock) = self.decoder.decode_next::<UBlock>()? {
                return Ok(Some(ublock));
            }

            let n = self.stream.read(&mut self.read_buffer).await?;
            if n == 0 {
                return if self.decoder.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::PeerShutdown)
                };
            }
            tracing::trace!("<= recv {n} bytes");
            self.decoder.input(&self.read_buffer[..n]);
        }
    }

    /// Turns the client into a stream of UBlocks ending at the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<UBlock>> {
        futures::stream::try_unfold(self, |mut client| async move {
            Ok::<_, Error>(client.next_ublock().await?.map(|ublock| (ublock, client)))
        })
    }
}
