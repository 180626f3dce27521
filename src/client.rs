use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::TransferLimits;
use crate::error::{Error, Result};
use crate::protocol::{self, TransferHeader, Verdict};
use crate::session::{Role, TransferSession};

type InFlightKey = (SocketAddr, String);

/// Pushes files to peers. Cheap to clone; clones share the concurrency cap
/// and the in-flight table.
#[derive(Clone)]
pub struct TransferClient {
    limits: TransferLimits,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl TransferClient {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limits.max_concurrent_transfers)),
            limits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Streams `file_path` to `peer`, advertised as `file_name`.
    ///
    /// One attempt; the returned session is `Completed`. Sends beyond the
    /// concurrency cap wait for a slot.
    pub async fn send_file(
        &self,
        peer: SocketAddr,
        file_path: &Path,
        file_name: &str,
    ) -> Result<TransferSession> {
        let _claim = InFlight::claim(&self.in_flight, (peer, file_name.to_string()))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Protocol("transfer client closed".into()))?;

        let mut session = TransferSession::new(Role::Sender, peer);
        match self.run(&mut session, peer, file_path, file_name).await {
            Ok(mut stream) => {
                session.complete();
                tracing::info!(
                    "Sent '{}' ({} bytes) to {}",
                    file_name,
                    session.bytes_transferred,
                    peer
                );
                // The receiver's Stored byte is informational only.
                match timeout(self.limits.io_timeout, protocol::read_verdict(&mut stream)).await {
                    Ok(Ok(Verdict::Stored)) => tracing::debug!("{} confirmed storage", peer),
                    Ok(Ok(other)) => tracing::debug!("{} answered {:?} after body", peer, other),
                    Ok(Err(e)) => tracing::debug!("No completion ack from {}: {}", peer, e),
                    Err(_) => tracing::debug!("Completion ack from {} timed out", peer),
                }
                Ok(session)
            }
            Err(e) => {
                tracing::warn!("Sending '{}' to {} failed: {}", file_name, peer, e);
                session.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        session: &mut TransferSession,
        peer: SocketAddr,
        file_path: &Path,
        file_name: &str,
    ) -> Result<TcpStream> {
        let unreadable = |source: std::io::Error| Error::LocalFileUnreadable {
            path: file_path.to_path_buf(),
            source,
        };

        // Open before connecting so a bad path never touches the network.
        let mut file = File::open(file_path).await.map_err(unreadable)?;
        let meta = file.metadata().await.map_err(unreadable)?;
        if !meta.is_file() {
            return Err(unreadable(std::io::Error::new(
                ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let size = meta.len();

        tracing::info!("Connecting to {}...", peer);
        let mut stream = match timeout(self.limits.connect_timeout, TcpStream::connect(peer)).await {
            Err(_) => {
                return Err(Error::PeerUnreachable {
                    addr: peer,
                    reason: "connection timed out".into(),
                })
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(Error::ConnectionRefused(peer))
            }
            Ok(Err(e)) => {
                return Err(Error::PeerUnreachable {
                    addr: peer,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(s)) => s,
        };

        let header = TransferHeader::new(file_name, size);
        timeout(self.limits.io_timeout, protocol::write_header(&mut stream, &header))
            .await
            .map_err(|_| Error::Timeout("sending header"))??;
        let verdict = timeout(self.limits.io_timeout, protocol::read_verdict(&mut stream))
            .await
            .map_err(|_| Error::Timeout("waiting for verdict"))??;
        if verdict != Verdict::Accepted {
            return Err(Error::Rejected(verdict.describe().to_string()));
        }
        session.header_exchanged(header);

        session.start_streaming();
        let mut buf = vec![0u8; self.limits.chunk_size];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await.map_err(unreadable)?;
            if n == 0 {
                // The file shrank after we announced its size.
                return Err(Error::TransferSizeMismatch {
                    expected: size,
                    actual: size - remaining,
                });
            }
            timeout(self.limits.io_timeout, stream.write_all(&buf[..n]))
                .await
                .map_err(|_| Error::Timeout("writing body"))??;
            remaining -= n as u64;
            session.record_bytes(n as u64);
        }

        // Half-close: the receiver treats EOF as the end of the body.
        timeout(self.limits.io_timeout, stream.shutdown())
            .await
            .map_err(|_| Error::Timeout("closing stream"))??;
        Ok(stream)
    }
}

/// Marks a (peer, file name) pair busy for as long as it lives.
struct InFlight<'a> {
    table: &'a Mutex<HashSet<InFlightKey>>,
    key: InFlightKey,
}

impl<'a> InFlight<'a> {
    fn claim(table: &'a Mutex<HashSet<InFlightKey>>, key: InFlightKey) -> Result<Self> {
        if !table.lock().insert(key.clone()) {
            return Err(Error::AlreadyInFlight {
                addr: key.0,
                file_name: key.1,
            });
        }
        Ok(Self { table, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::server::TransferServer;
    use crate::session::SessionState;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn limits() -> TransferLimits {
        TransferLimits {
            chunk_size: 1024,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            ..TransferLimits::default()
        }
    }

    async fn start_server(dir: &Path) -> (SocketAddr, Arc<Catalog>, CancellationToken) {
        let catalog = Arc::new(Catalog::open(dir).await.unwrap());
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), catalog.clone(), limits())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        server.spawn(cancel.clone());
        (addr, catalog, cancel)
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let inbox = TempDir::new().unwrap();
        let outbox = TempDir::new().unwrap();
        let (addr, catalog, cancel) = start_server(inbox.path()).await;
        let client = TransferClient::new(limits());

        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("empty.txt", Vec::new()),
            ("small.txt", b"hello over the lan".to_vec()),
            ("big.bin", (0..10_000u32).map(|i| (i % 251) as u8).collect()),
        ];
        for (name, content) in &cases {
            let path = outbox.path().join(name);
            std::fs::write(&path, content).unwrap();

            let session = client.send_file(addr, &path, name).await.unwrap();
            assert_eq!(session.state(), SessionState::Completed);
            assert_eq!(session.bytes_transferred, content.len() as u64);
        }

        assert_eq!(catalog.list().len(), cases.len());
        for (name, content) in &cases {
            assert_eq!(&std::fs::read(inbox.path().join(name)).unwrap(), content);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let client = TransferClient::new(limits());
        let err = client
            .send_file("127.0.0.1:9".parse().unwrap(), Path::new("/no/such/file"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LocalFileUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let outbox = TempDir::new().unwrap();
        let path = outbox.path().join("a.txt");
        std::fs::write(&path, b"a").unwrap();

        // Grab a free port, then close it.
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let err = TransferClient::new(limits())
            .send_file(addr, &path, "a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let inbox = TempDir::new().unwrap();
        let outbox = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open(inbox.path()).await.unwrap());
        let server_limits = TransferLimits {
            max_file_size: 4,
            ..limits()
        };
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), catalog.clone(), server_limits)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        server.spawn(cancel.clone());

        let path = outbox.path().join("big.txt");
        std::fs::write(&path, b"more than four bytes").unwrap();
        let err = TransferClient::new(limits())
            .send_file(addr, &path, "big.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(catalog.list().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_same_pair_not_concurrent() {
        let table = Mutex::new(HashSet::new());
        let addr: SocketAddr = "10.0.0.5:5005".parse().unwrap();

        let first = InFlight::claim(&table, (addr, "a.txt".into())).unwrap();
        assert!(matches!(
            InFlight::claim(&table, (addr, "a.txt".into())),
            Err(Error::AlreadyInFlight { .. })
        ));
        let _other = InFlight::claim(&table, (addr, "b.txt".into())).unwrap();
        drop(first);
        assert!(InFlight::claim(&table, (addr, "a.txt".into())).is_ok());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() {
        let outbox = TempDir::new().unwrap();
        let path = outbox.path().join("a.txt");
        std::fs::write(&path, b"a").unwrap();

        // TEST-NET-1 never answers; hosts without a route fail even sooner.
        let client = TransferClient::new(TransferLimits {
            connect_timeout: Duration::from_millis(200),
            ..limits()
        });
        let started = std::time::Instant::now();
        let err = client
            .send_file("192.0.2.1:5005".parse().unwrap(), &path, "a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_receiver_that_stops_reading_times_out() {
        let outbox = TempDir::new().unwrap();
        let path = outbox.path().join("large.bin");
        std::fs::write(&path, vec![7u8; 64 * 1024 * 1024]).unwrap();

        // Accepts the header, then never reads the body.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stalled = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            protocol::read_header(&mut stream).await.unwrap();
            protocol::write_verdict(&mut stream, Verdict::Accepted)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = TransferClient::new(TransferLimits {
            chunk_size: 64 * 1024,
            io_timeout: Duration::from_millis(300),
            ..limits()
        });
        let err = client.send_file(addr, &path, "large.bin").await.unwrap_err();
        match err {
            Error::Timeout(step) => assert_eq!(step, "writing body"),
            other => panic!("expected a body timeout, got {:?}", other),
        }
        stalled.abort();
    }
}
