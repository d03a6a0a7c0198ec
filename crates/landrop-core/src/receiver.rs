//! Inbound side of a transfer.
//!
//! The receiver accepts TCP connections and gives each one its own task. A
//! connection reads one header line, then either serves a download request
//! or publishes the offer and waits for the application's decision through
//! its [`PendingConnection`].

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use storage::Storage;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransferError;
use crate::lines::read_line;
use crate::model::ConnectionId;
use crate::sender::{Sender, SenderHandle, SenderOptions};
use crate::wire::{Decision, DownloadRequest, Header, Offer};

/// Bytes a sender may push before the decision arrives.
const MAX_EARLY_BYTES: usize = 1024 * 1024;

/// An offer waiting for the application to accept or reject it.
#[derive(Debug)]
pub struct IncomingOffer {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub file_name: String,
    pub file_size: u64,
    pub connection: PendingConnection,
}

enum Resolution {
    Accept { file: File, path: PathBuf },
    Reject,
}

/// The decision half of a connection in `AwaitingFileHandle`.
///
/// Dropping it without a decision leaves the connection open until the peer
/// disconnects or gives up.
#[derive(Debug)]
pub struct PendingConnection {
    id: ConnectionId,
    decision: oneshot::Sender<Resolution>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Accept { path, .. } => write!(f, "Accept({})", path.display()),
            Resolution::Reject => f.write_str("Reject"),
        }
    }
}

impl PendingConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Reply `OK` and stream the body into `file`. Returns `false` if the
    /// connection is already gone.
    pub fn accept(self, file: File, path: PathBuf) -> bool {
        self.decision.send(Resolution::Accept { file, path }).is_ok()
    }

    /// Reply `NO` and close.
    pub fn reject(self) -> bool {
        self.decision.send(Resolution::Reject).is_ok()
    }

    /// Whether the connection task has already ended.
    pub fn is_closed(&self) -> bool {
        self.decision.is_closed()
    }
}

#[derive(Debug)]
pub enum ReceiverEvent {
    TransferRequested(IncomingOffer),
    Progress {
        id: ConnectionId,
        percent: u8,
    },
    /// The declared size was fully written.
    Finished {
        id: ConnectionId,
        file_name: String,
        path: PathBuf,
    },
    /// The peer went away before the declared size arrived.
    Cancelled {
        id: ConnectionId,
        received: u64,
        expected: u64,
    },
    Error {
        id: ConnectionId,
        error: TransferError,
    },
    /// A download request was answered by starting an outbound transfer.
    UploadStarted {
        file_name: String,
        peer: SocketAddr,
        handle: SenderHandle,
    },
}

/// Listening end of the transfer protocol.
#[derive(Debug)]
pub struct Receiver {
    port: u16,
    accept_task: JoinHandle<()>,
}

impl Receiver {
    /// Listen on `port` on all interfaces, falling back to an ephemeral port
    /// when it is taken. Events for every connection go to `events`.
    pub async fn bind<S>(
        port: u16,
        storage: Arc<S>,
        options: SenderOptions,
        events: mpsc::UnboundedSender<ReceiverEvent>,
    ) -> Result<Self, TransferError>
    where
        S: Storage + 'static,
    {
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => listener,
            Err(e) if port != 0 => {
                tracing::warn!("Port {} unavailable ({}), using an ephemeral port", port, e);
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
                    .await
                    .map_err(TransferError::Bind)?
            }
            Err(e) => return Err(TransferError::Bind(e)),
        };

        let port = listener.local_addr().map_err(TransferError::Bind)?.port();
        tracing::info!("Listening for transfers on port {}", port);

        let accept_task = tokio::spawn(accept_loop(listener, storage, options, events));
        Ok(Self { port, accept_task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting new connections. Connections already running continue.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop<S>(
    listener: TcpListener,
    storage: Arc<S>,
    options: SenderOptions,
    events: mpsc::UnboundedSender<ReceiverEvent>,
) where
    S: Storage + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = ConnectionId::next();
                tracing::debug!("{}: connection from {}", id, peer);
                let storage = storage.clone();
                let options = options.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    handle_connection(id, stream, peer, storage, options, events).await;
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

async fn handle_connection<S>(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    storage: Arc<S>,
    options: SenderOptions,
    events: mpsc::UnboundedSender<ReceiverEvent>,
) where
    S: Storage + 'static,
{
    let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
    let mut reader = BufReader::new(stream);

    let line = match read_line(&mut reader).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            tracing::debug!("{}: closed before sending a header", id);
            return;
        }
        Err(e) => {
            tracing::warn!("{}: dropping connection from {}: {}", id, peer, e);
            return;
        }
    };

    let offer = match Header::decode(&line) {
        Ok(Header::Offer(offer)) => offer,
        Ok(Header::Download(request)) => {
            serve_download(id, request, peer, storage.as_ref(), options, &events).await;
            return;
        }
        Err(e) => {
            tracing::warn!("{}: dropping connection from {}: {}", id, peer, e);
            return;
        }
    };

    tracing::info!("{}: {} offers {} ({} bytes)", id, peer, offer.file_name, offer.file_size);

    let (decision_tx, decision_rx) = oneshot::channel();
    let incoming = IncomingOffer {
        id,
        peer,
        file_name: offer.file_name.clone(),
        file_size: offer.file_size,
        connection: PendingConnection { id, decision: decision_tx },
    };
    if events.send(ReceiverEvent::TransferRequested(incoming)).is_err() {
        return;
    }

    let mut early = Vec::new();
    let resolution = match await_decision(&mut reader, decision_rx, &mut early).await {
        Ok(Some(resolution)) => resolution,
        Ok(None) => {
            tracing::info!("{}: {} disconnected before a decision", id, peer);
            let _ = events.send(ReceiverEvent::Cancelled {
                id,
                received: 0,
                expected: offer.file_size,
            });
            return;
        }
        Err(error) => {
            tracing::warn!("{}: {}", id, error);
            let _ = events.send(ReceiverEvent::Error { id, error });
            return;
        }
    };

    let (file, path) = match resolution {
        Resolution::Reject => {
            let stream = reader.get_mut();
            let _ = stream.write_all(Decision::Reject.encode().as_bytes()).await;
            let _ = stream.shutdown().await;
            tracing::info!("{}: rejected {}", id, offer.file_name);
            return;
        }
        Resolution::Accept { file, path } => (file, path),
    };

    if let Err(e) = reader.get_mut().write_all(Decision::Accept.encode().as_bytes()).await {
        let _ = events.send(ReceiverEvent::Error { id, error: TransferError::IoWrite(e) });
        return;
    }

    let event = write_body(id, &mut reader, file, &path, &offer, early, options.chunk_size, &events).await;
    let _ = reader.get_mut().shutdown().await;
    let _ = events.send(event);
}

/// Wait for the decision while watching the socket. Bytes that arrive early
/// are kept in `early`. `Ok(None)` means the peer disconnected first.
async fn await_decision(
    reader: &mut BufReader<TcpStream>,
    mut decision: oneshot::Receiver<Resolution>,
    early: &mut Vec<u8>,
) -> Result<Option<Resolution>, TransferError> {
    let mut abandoned = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        tokio::select! {
            res = &mut decision, if !abandoned => match res {
                Ok(resolution) => return Ok(Some(resolution)),
                Err(_) => abandoned = true,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => return Ok(None),
                Ok(n) => {
                    early.extend_from_slice(&buf[..n]);
                    if early.len() > MAX_EARLY_BYTES {
                        return Err(TransferError::ProtocolViolation(
                            "data sent before the offer was accepted".into(),
                        ));
                    }
                }
            },
        }
    }
}

async fn write_chunk(file: &mut File, chunk: &[u8]) -> std::io::Result<()> {
    file.write_all(chunk).await?;
    file.flush().await
}

#[allow(clippy::too_many_arguments)]
async fn write_body(
    id: ConnectionId,
    reader: &mut BufReader<TcpStream>,
    mut file: File,
    path: &Path,
    offer: &Offer,
    early: Vec<u8>,
    chunk_size: usize,
    events: &mpsc::UnboundedSender<ReceiverEvent>,
) -> ReceiverEvent {
    let expected = offer.file_size;
    let mut received: u64 = 0;

    if expected == 0 {
        let _ = events.send(ReceiverEvent::Progress { id, percent: 100 });
    }

    if !early.is_empty() {
        if let Err(e) = write_chunk(&mut file, &early).await {
            return ReceiverEvent::Error { id, error: TransferError::IoWrite(e) };
        }
        received += early.len() as u64;
        let _ = events.send(ReceiverEvent::Progress { id, percent: percent(received, expected) });
    }

    let mut buf = vec![0u8; chunk_size.max(1)];
    while received < expected {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("{}: read failed, treating as disconnect: {}", id, e);
                break;
            }
        };

        if let Err(e) = write_chunk(&mut file, &buf[..n]).await {
            tracing::warn!("{}: writing {} failed: {}", id, path.display(), e);
            return ReceiverEvent::Error { id, error: TransferError::IoWrite(e) };
        }
        received += n as u64;
        let _ = events.send(ReceiverEvent::Progress { id, percent: percent(received, expected) });
    }
    drop(file);

    if received < expected {
        tracing::info!(
            "{}: {} cancelled after {} of {} bytes",
            id,
            offer.file_name,
            received,
            expected
        );
        ReceiverEvent::Cancelled { id, received, expected }
    } else {
        tracing::info!("{}: received {} into {}", id, offer.file_name, path.display());
        ReceiverEvent::Finished {
            id,
            file_name: offer.file_name.clone(),
            path: path.to_path_buf(),
        }
    }
}

async fn serve_download<S>(
    id: ConnectionId,
    request: DownloadRequest,
    peer: SocketAddr,
    storage: &S,
    options: SenderOptions,
    events: &mpsc::UnboundedSender<ReceiverEvent>,
) where
    S: Storage + ?Sized,
{
    let path = match storage.resolve_shared(&request.relative_path).await {
        Ok(Some(path)) => path,
        Ok(None) => {
            tracing::info!("{}: requested file {:?} not found", id, request.relative_path);
            return;
        }
        Err(e) => {
            tracing::warn!("{}: refusing download request from {}: {:#}", id, peer, e);
            return;
        }
    };

    let target = SocketAddr::new(peer.ip(), request.reply_port);
    match Sender::send(&path, target, options) {
        Ok(handle) => {
            tracing::info!("{}: uploading {} to {}", id, path.display(), target);
            let _ = events.send(ReceiverEvent::UploadStarted {
                file_name: request.file_name,
                peer: target,
                handle,
            });
        }
        Err(e) => tracing::warn!("{}: cannot serve {}: {}", id, path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::io::AsyncBufReadExt;
    use tokio::time::timeout;

    struct Fixture {
        _temp: TempDir,
        storage: Arc<LocalStorage>,
        receiver: Receiver,
        events: mpsc::UnboundedReceiver<ReceiverEvent>,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(
            temp.path().join("received"),
            temp.path().join("shared"),
        ));
        let (tx, events) = mpsc::unbounded_channel();
        let receiver = Receiver::bind(0, storage.clone(), SenderOptions::default(), tx)
            .await
            .unwrap();
        Fixture { _temp: temp, storage, receiver, events }
    }

    async fn connect(port: u16) -> BufReader<TcpStream> {
        BufReader::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap())
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ReceiverEvent>) -> ReceiverEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for receiver event")
            .expect("event channel closed")
    }

    async fn expect_offer(events: &mut mpsc::UnboundedReceiver<ReceiverEvent>) -> IncomingOffer {
        match next_event(events).await {
            ReceiverEvent::TransferRequested(offer) => offer,
            other => panic!("expected offer, got {:?}", other),
        }
    }

    /// Drain progress events until something else shows up.
    async fn final_event(events: &mut mpsc::UnboundedReceiver<ReceiverEvent>) -> (Vec<u8>, ReceiverEvent) {
        let mut progress = Vec::new();
        loop {
            match next_event(events).await {
                ReceiverEvent::Progress { percent, .. } => progress.push(percent),
                other => return (progress, other),
            }
        }
    }

    #[tokio::test]
    async fn test_accepted_transfer_writes_file() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"hello.txt|11\n").await.unwrap();

        let offer = expect_offer(&mut fx.events).await;
        assert_eq!(offer.file_name, "hello.txt");
        assert_eq!(offer.file_size, 11);

        let (file, path) = fx.storage.open_destination(&offer.file_name).await.unwrap();
        assert!(offer.connection.accept(file, path.clone()));

        let mut reply = String::new();
        client.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "OK\n");

        client.get_mut().write_all(b"hello world").await.unwrap();

        let (progress, last) = final_event(&mut fx.events).await;
        assert_eq!(progress.last(), Some(&100));
        match last {
            ReceiverEvent::Finished { file_name, path: written, .. } => {
                assert_eq!(file_name, "hello.txt");
                assert_eq!(written, path);
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

        // The receiver closes its side once the declared size arrived.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bytes_before_decision_are_kept() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"eager.bin|6\nabc").await.unwrap();

        let offer = expect_offer(&mut fx.events).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (file, path) = fx.storage.open_destination(&offer.file_name).await.unwrap();
        offer.connection.accept(file, path.clone());

        let mut reply = String::new();
        client.read_line(&mut reply).await.unwrap();
        client.get_mut().write_all(b"def").await.unwrap();

        let (_, last) = final_event(&mut fx.events).await;
        assert!(matches!(last, ReceiverEvent::Finished { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_reject_replies_no() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"secret.pdf|100\n").await.unwrap();

        let offer = expect_offer(&mut fx.events).await;
        assert!(offer.connection.reject());

        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NO\n");
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer_cancels() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"partial.bin|1000\n").await.unwrap();

        let offer = expect_offer(&mut fx.events).await;
        let (file, path) = fx.storage.open_destination(&offer.file_name).await.unwrap();
        offer.connection.accept(file, path);

        let mut reply = String::new();
        client.read_line(&mut reply).await.unwrap();
        client.get_mut().write_all(&[1u8; 400]).await.unwrap();
        drop(client);

        let (progress, last) = final_event(&mut fx.events).await;
        assert_eq!(progress.last(), Some(&40));
        assert!(matches!(
            last,
            ReceiverEvent::Cancelled { received: 400, expected: 1000, .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_while_pending_cancels() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"later.txt|5\n").await.unwrap();

        let offer = expect_offer(&mut fx.events).await;
        drop(client);

        match next_event(&mut fx.events).await {
            ReceiverEvent::Cancelled { id, received: 0, expected: 5 } => assert_eq!(id, offer.id),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert!(!offer.connection.reject());
    }

    #[tokio::test]
    async fn test_malformed_header_closes_silently() {
        let mut fx = fixture().await;
        let mut client = connect(fx.receiver.port()).await;
        client.get_mut().write_all(b"no separator here\n").await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_download_request_opens_transfer_back() {
        let mut fx = fixture().await;
        let shared = fx.storage.shared_dir();
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("notes.txt"), b"shared bytes").unwrap();

        let requester = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reply_port = requester.local_addr().unwrap().port();

        let mut client = connect(fx.receiver.port()).await;
        let request = DownloadRequest {
            relative_path: "notes.txt".into(),
            file_name: "notes.txt".into(),
            reply_port,
        };
        client.get_mut().write_all(request.encode().as_bytes()).await.unwrap();

        let (stream, _) = timeout(Duration::from_secs(5), requester.accept()).await.unwrap().unwrap();
        let mut incoming = BufReader::new(stream);
        let mut line = String::new();
        incoming.read_line(&mut line).await.unwrap();
        assert_eq!(line, "notes.txt|12\n");
        incoming.get_mut().write_all(b"OK\n").await.unwrap();
        let mut body = Vec::new();
        incoming.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"shared bytes");

        match next_event(&mut fx.events).await {
            ReceiverEvent::UploadStarted { file_name, peer, .. } => {
                assert_eq!(file_name, "notes.txt");
                assert_eq!(peer.port(), reply_port);
            }
            other => panic!("expected upload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_request_outside_shared_is_ignored() {
        let mut fx = fixture().await;
        let requester = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reply_port = requester.local_addr().unwrap().port();

        let mut client = connect(fx.receiver.port()).await;
        let line = format!("DOWNLOAD_REQUEST|../received/x|x|{}\n", reply_port);
        client.get_mut().write_all(line.as_bytes()).await.unwrap();

        assert!(timeout(Duration::from_millis(300), requester.accept()).await.is_err());
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_port_in_use_falls_back() {
        let blocker = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let temp = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp.path().join("r"), temp.path().join("s")));
        let (tx, _rx) = mpsc::unbounded_channel();
        let receiver = Receiver::bind(taken, storage, SenderOptions::default(), tx)
            .await
            .unwrap();

        assert_ne!(receiver.port(), taken);
        assert_ne!(receiver.port(), 0);
    }
}
