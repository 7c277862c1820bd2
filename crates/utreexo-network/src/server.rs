use crate::{Error, Result, UP_TO_TIP};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use utreexo_proof_store::ProofStore;

/// How long a connection waits for a new record before checking whether the store closed.
const TIP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Source of the consensus-encoded blocks served alongside their proofs.
pub trait BlockProvider: Send + Sync + 'static {
    fn raw_block(&self, height: i32) -> std::io::Result<Vec<u8>>;
}

/// Serves the records of a [`ProofStore`] to compact state nodes.
pub struct UBlockServer<B> {
    store: Arc<ProofStore>,
    blocks: Arc<B>,
    follow_tip: bool,
}

impl<B> Clone for UBlockServer<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            blocks: self.blocks.clone(),
            follow_tip: self.follow_tip,
        }
    }
}

impl<B: BlockProvider> UBlockServer<B> {
    pub fn new(store: Arc<ProofStore>, blocks: Arc<B>) -> Self {
        Self {
            store,
            blocks,
            follow_tip: false,
        }
    }

    /// Keeps open-ended requests streaming new records as the store grows,
    /// instead of closing them at the tip the request found.
    pub fn follow_tip(mut self, follow: bool) -> Self {
        self.follow_tip = follow;
        self
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Every connection is served by its own task; a failing connection is
    /// logged and dropped without affecting the others.
    pub async fn run(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("🌐 Serving UBlocks on {local_addr}");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Stopped accepting UBlock connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(?err, "Failed to accept connection");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_connection(stream, peer_addr).await {
                            tracing::debug!(?peer_addr, ?err, "UBlock connection closed");
                        }
                    });
                }
            }
        }
    }

    async fn serve_connection(self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let mut stream = BufWriter::new(stream);

        let mut request = [0u8; 8];
        stream.get_mut().read_exact(&mut request).await?;
        let start = i32::from_be_bytes([request[0], request[1], request[2], request[3]]);
        let end = i32::from_be_bytes([request[4], request[5], request[6], request[7]]);
        if start < 1 || end <= start {
            return Err(Error::BadRequest { start, end });
        }

        let end = if end == UP_TO_TIP && !self.follow_tip {
            end.min(self.store.tip().saturating_add(1))
        } else {
            end
        };

        tracing::debug!(?peer_addr, start, end, "UBlock range requested");

        for height in start..end {
            if !self.wait_for_record(height).await? {
                break;
            }
            let ublock = self.raw_ublock(height).await?;
            stream.write_all(&ublock).await?;
            // Flush at the tip so a following client sees every available block.
            if self.store.tip() <= height {
                stream.flush().await?;
            }
        }

        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Waits until the record of `height` exists; `false` once the store closed.
    async fn wait_for_record(&self, height: i32) -> Result<bool> {
        loop {
            if self.store.tip() >= height {
                return Ok(true);
            }
            if self.store.is_closed() {
                return Ok(false);
            }
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.wait_for_height(height, Some(TIP_POLL_INTERVAL)))
                .await
                .map_err(std::io::Error::other)?;
        }
    }

    async fn raw_ublock(&self, height: i32) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let blocks = self.blocks.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut ublock = blocks.raw_block(height).map_err(|err| Error::BlockUnavailable {
                height,
                reason: err.to_string(),
            })?;
            ublock.extend(store.get_raw(height)?);
            Ok(ublock)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}
