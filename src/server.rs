use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ReceivedEntry};
use crate::config::TransferLimits;
use crate::error::{Error, Result};
use crate::preview;
use crate::protocol::{self, TransferHeader, Verdict};
use crate::session::{Role, TransferSession};

/// Connections being told `Busy` at once; beyond this they are just closed.
const REJECT_SLOTS: usize = 16;
/// How long a rejected connection may linger while its header drains.
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Published once per inbound session when it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub session: TransferSession,
    /// Name the file was stored under, for completed sessions.
    pub stored_name: Option<String>,
}

/// Accepts inbound transfers and commits them to the catalog.
pub struct TransferServer {
    listener: TcpListener,
    receiver: Arc<Receiver>,
}

impl TransferServer {
    pub async fn bind(addr: SocketAddr, catalog: Arc<Catalog>, limits: TransferLimits) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Transfer server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            receiver: Arc::new(Receiver::new(catalog, limits)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sender side of the session event channel; call `subscribe()` on it.
    pub fn events(&self) -> broadcast::Sender<TransferEvent> {
        self.receiver.events.clone()
    }

    /// Runs the accept loop until `cancel` fires. Connections over the
    /// concurrency cap are answered `Busy` instead of queueing, and dropped
    /// outright once the rejection slots are taken too.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let TransferServer { listener, receiver } = self;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        let receiver = receiver.clone();
                        match receiver.permits.clone().try_acquire_owned() {
                            Ok(permit) => {
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    receiver.handle(stream, addr).await;
                                });
                            }
                            Err(_) => match receiver.rejects.clone().try_acquire_owned() {
                                Ok(slot) => {
                                    tracing::warn!("Rejecting {}: transfer limit reached", addr);
                                    tokio::spawn(async move {
                                        let _slot = slot;
                                        receiver.reject_busy(stream).await;
                                    });
                                }
                                Err(_) => {
                                    tracing::warn!("Dropping {}: rejection backlog full", addr);
                                    drop(stream);
                                }
                            },
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            tracing::info!("Transfer server stopped");
        })
    }
}

/// Per-connection receive logic, independent of the socket type.
pub(crate) struct Receiver {
    catalog: Arc<Catalog>,
    limits: TransferLimits,
    permits: Arc<Semaphore>,
    rejects: Arc<Semaphore>,
    events: broadcast::Sender<TransferEvent>,
}

impl Receiver {
    pub(crate) fn new(catalog: Arc<Catalog>, limits: TransferLimits) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            catalog,
            permits: Arc::new(Semaphore::new(limits.max_concurrent_transfers)),
            rejects: Arc::new(Semaphore::new(REJECT_SLOTS)),
            limits,
            events,
        }
    }

    pub(crate) async fn handle<S>(&self, mut stream: S, addr: SocketAddr) -> TransferSession
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("Incoming connection from {}", addr);
        let mut session = TransferSession::new(Role::Receiver, addr);

        let stored_name = match self.receive(&mut stream, &mut session).await {
            Ok(entry) => {
                session.complete();
                tracing::info!(
                    "Received '{}' ({} bytes) from {}",
                    entry.name,
                    session.bytes_transferred,
                    addr
                );
                Some(entry.name)
            }
            Err(e) => {
                tracing::warn!("Inbound transfer from {} failed: {}", addr, e);
                session.fail(e.to_string());
                None
            }
        };

        let _ = self.events.send(TransferEvent {
            session: session.clone(),
            stored_name,
        });
        session
    }

    async fn receive<S>(&self, stream: &mut S, session: &mut TransferSession) -> Result<ReceivedEntry>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let io_timeout = self.limits.io_timeout;

        let (header, leftover) = match timeout(io_timeout, protocol::read_header(stream)).await {
            Err(_) => return Err(Error::Timeout("reading header")),
            Ok(Err(e)) => {
                self.reply(stream, Verdict::InvalidHeader).await;
                return Err(e);
            }
            Ok(Ok(h)) => h,
        };

        let Some(name) = protocol::sanitize_file_name(&header.file_name) else {
            self.reply(stream, Verdict::InvalidHeader).await;
            return Err(Error::Protocol(format!(
                "unusable file name {:?}",
                header.file_name
            )));
        };
        if header.file_size_bytes > self.limits.max_file_size {
            self.reply(stream, Verdict::TooLarge).await;
            return Err(Error::Rejected(format!(
                "{} is {} bytes, limit is {}",
                name, header.file_size_bytes, self.limits.max_file_size
            )));
        }

        let size = header.file_size_bytes;
        session.header_exchanged(TransferHeader::new(name.clone(), size));
        timeout(io_timeout, protocol::write_verdict(stream, Verdict::Accepted))
            .await
            .map_err(|_| Error::Timeout("sending verdict"))??;

        session.start_streaming();
        // Nothing is visible to the catalog until commit renames it in.
        let temp = self.catalog.temp_path();
        if let Err(e) = self.stream_body(stream, leftover, &temp, size, session).await {
            discard(&temp).await;
            return Err(e);
        }

        let preview =
            preview::generate_for_file(&temp, &name, self.limits.preview_max_source_bytes).await;
        let entry = match self.catalog.commit(&temp, &name, preview).await {
            Ok(entry) => entry,
            Err(e) => {
                discard(&temp).await;
                return Err(e);
            }
        };

        match timeout(io_timeout, protocol::write_verdict(stream, Verdict::Stored)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Completion ack not delivered: {}", e),
            Err(_) => tracing::debug!("Completion ack timed out"),
        }
        Ok(entry)
    }

    /// Copies exactly `size` bytes into `temp`, then requires a clean EOF.
    async fn stream_body<S>(
        &self,
        stream: &mut S,
        leftover: Bytes,
        temp: &Path,
        size: u64,
        session: &mut TransferSession,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let io_timeout = self.limits.io_timeout;
        let mut file = File::create(temp)
            .await
            .map_err(|e| Error::storage(temp, e))?;
        // The header read may have pulled in the start of the body.
        let mut body = (&leftover[..]).chain(stream);
        let mut buf = vec![0u8; self.limits.chunk_size];
        let mut remaining = size;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = timeout(io_timeout, body.read(&mut buf[..want]))
                .await
                .map_err(|_| Error::Timeout("reading body"))??;
            if n == 0 {
                return Err(Error::TransferSizeMismatch {
                    expected: size,
                    actual: size - remaining,
                });
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| Error::storage(temp, e))?;
            remaining -= n as u64;
            session.record_bytes(n as u64);
        }

        // The sender must close right after the declared size; anything more
        // means the header lied about the length.
        let mut trailing = [0u8; 1];
        match timeout(io_timeout, body.read(&mut trailing)).await {
            Err(_) => return Err(Error::Timeout("waiting for end of stream")),
            Ok(Ok(0)) => {}
            Ok(Ok(_)) => {
                return Err(Error::TransferSizeMismatch {
                    expected: size,
                    actual: size + 1,
                })
            }
            Ok(Err(e)) => return Err(e.into()),
        }

        file.flush().await.map_err(|e| Error::storage(temp, e))?;
        file.sync_all().await.map_err(|e| Error::storage(temp, e))?;
        Ok(())
    }

    async fn reject_busy<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // The answer does not depend on the header, so it goes out first.
        self.reply(&mut stream, Verdict::Busy).await;
        let _ = stream.shutdown().await;

        // Drain whatever the sender already wrote; closing with unread
        // input would reset the connection and could eat the verdict.
        let linger = self.limits.io_timeout.min(REJECT_LINGER);
        let mut sink = [0u8; 1024];
        let _ = timeout(linger, async {
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        })
        .await;
    }

    async fn reply<S>(&self, stream: &mut S, verdict: Verdict)
    where
        S: AsyncWrite + Unpin,
    {
        match timeout(self.limits.io_timeout, protocol::write_verdict(stream, verdict)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Could not send {:?}: {}", verdict, e),
            Err(_) => tracing::debug!("Timed out sending {:?}", verdict),
        }
    }
}

async fn discard(temp: &Path) {
    match tokio::fs::remove_file(temp).await {
        Ok(()) => tracing::debug!("Removed partial file {}", temp.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Failed to remove {}: {}", temp.display(), e),
    }
}
