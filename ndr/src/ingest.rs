//! Bulk ingestion of data objects over TCP.
//!
//! Each connection carries a sequence of length delimited frames, every frame one
//! encoded [`Data`]. Objects are written through the [`Cache`] as they arrive. A frame
//! that does not decode ends the connection.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures_lite::StreamExt;
use ndr_base::Data;
use tokio::{io::AsyncRead, net::TcpListener, task::JoinSet};
use tokio_util::{
    codec::{FramedRead, LengthDelimitedCodec},
    sync::CancellationToken,
    task::AbortOnDropHandle,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::cache::Cache;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// A running bulk ingestion listener.
///
/// Dropping it stops accepting connections.
#[derive(Debug)]
pub struct BulkIngest {
    addr: SocketAddr,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl BulkIngest {
    /// Listens on `addr`, writing received objects into `cache`.
    pub async fn bind(addr: SocketAddr, cache: Cache) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind bulk ingestion to {addr}"))?;
        let addr = listener.local_addr()?;
        info!(%addr, "bulk ingestion listening");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            accept_loop(listener, cache, cancel.clone()).instrument(info_span!("bulk-ingest")),
        );
        Ok(Self {
            addr,
            cancel,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and closes the open ones.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, cache: Cache, cancel: CancellationToken) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(res) = conns.join_next() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        warn!(?err, "ingest connection panicked");
                    }
                }
            }
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection opened");
                    let cache = cache.clone();
                    conns.spawn(
                        async move {
                            match ingest(stream, &cache).await {
                                Ok(count) => debug!(count, "connection closed"),
                                Err(err) => warn!(?err, "connection dropped"),
                            }
                        }
                        .instrument(info_span!("conn", %peer)),
                    );
                }
                Err(err) => warn!(?err, "failed to accept connection"),
            }
        }
    }
    conns.shutdown().await;
    debug!("bulk ingestion stopped");
}

/// Reads framed objects from `reader` until it closes, returning how many were stored.
pub async fn ingest<R: AsyncRead + Unpin>(reader: R, cache: &Cache) -> Result<u64> {
    let mut frames = FramedRead::new(reader, LengthDelimitedCodec::new());
    let mut count = 0;
    while let Some(frame) = frames.next().await {
        let frame = frame.context("failed to read frame")?;
        let data = Data::decode(&frame).with_context(|| format!("undecodable object after {count}"))?;
        trace!(name = %data.name, "ingested");
        cache.put(&data);
        #[cfg(feature = "metrics")]
        inc!(Metrics, bulk_objects_ingested);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures_util::SinkExt;
    use ndr_base::Name;
    use tokio::{io::AsyncWriteExt, net::TcpStream};
    use tokio_util::codec::FramedWrite;

    use super::*;
    use crate::storage::mem;

    fn objects(prefix: &str, n: u64) -> Vec<Data> {
        let name: Name = prefix.parse().unwrap();
        (0..n)
            .map(|i| Data::new(name.append_segment(i), format!("part {i}")))
            .collect()
    }

    #[tokio::test]
    async fn ingest_stream() -> Result<()> {
        let cache = Cache::new(Arc::new(mem::Store::default()));
        let (client, server) = tokio::io::duplex(1024);
        let sent = objects("/bulk/a", 5);
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                let mut frames = FramedWrite::new(client, LengthDelimitedCodec::new());
                for data in sent {
                    frames.send(data.encode()).await?;
                }
                anyhow::Ok(())
            })
        };
        assert_eq!(ingest(server, &cache).await?, 5);
        writer.await??;
        for data in sent {
            assert_eq!(cache.get(&data.name, false, false)?, Some(data));
        }
        Ok(())
    }

    #[tokio::test]
    async fn garbage_frame_ends_connection() -> Result<()> {
        let cache = Cache::new(Arc::new(mem::Store::default()));
        let (client, server) = tokio::io::duplex(1024);
        let mut frames = FramedWrite::new(client, LengthDelimitedCodec::new());
        frames.send(objects("/bulk/b", 1)[0].encode()).await?;
        frames.send(Bytes::from_static(b"\xff\xff\xff")).await?;
        drop(frames);
        assert!(ingest(server, &cache).await.is_err());
        assert_eq!(cache.pending(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn tcp_listener() -> Result<()> {
        let cache = Cache::new(Arc::new(mem::Store::default()));
        let ingest = BulkIngest::bind("127.0.0.1:0".parse()?, cache.clone()).await?;
        let stream = TcpStream::connect(ingest.local_addr()).await?;
        let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
        let sent = objects("/bulk/tcp", 3);
        for data in &sent {
            frames.send(data.encode()).await?;
        }
        frames.get_mut().shutdown().await?;
        let last = &sent[2].name;
        while cache.get(last, false, false)?.is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(cache.get(&"/bulk/tcp".parse()?, true, false)?.is_some());
        ingest.shutdown();
        Ok(())
    }
}
