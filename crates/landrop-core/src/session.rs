//! Session bookkeeping for every transfer this instance takes part in.
//!
//! `SessionManager` is a handle to an actor task that owns the session table,
//! the listening [`Receiver`], and the inbound batch collector. All state
//! changes happen on that task, so observers see events in the order they
//! were applied.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use storage::Storage;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::batch::{BatchCollector, BatchId};
use crate::config::TransferConfig;
use crate::error::{SessionError, TransferError};
use crate::model::{ConnectionId, Direction, SessionId, TransferStatus};
use crate::receiver::{IncomingOffer, PendingConnection, Receiver, ReceiverEvent};
use crate::sender::{Sender, SenderEvent, SenderHandle, SenderOptions};
use crate::wire::DownloadRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub peer: SocketAddr,
    pub direction: Direction,
    pub status: TransferStatus,
    pub progress: u8,
}

impl Session {
    fn new(name: String, peer: SocketAddr, direction: Direction) -> Self {
        Self {
            id: SessionId::next(),
            name,
            peer,
            direction,
            status: TransferStatus::Waiting,
            progress: 0,
        }
    }

    /// Terminal statuses are sticky. Returns whether anything changed.
    pub fn set_status(&mut self, status: TransferStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    /// Progress only moves forward, and only while streaming.
    pub fn set_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if self.status != TransferStatus::InProgress || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        true
    }
}

/// One file of an inbound batch as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFile {
    pub session: SessionId,
    pub file_name: String,
    pub file_size: u64,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct OfferedBatch {
    pub id: BatchId,
    pub files: Vec<BatchFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    RejectAll,
    /// Accept the named files; every other file in the batch is refused.
    Accept(HashSet<String>),
}

impl BatchDecision {
    pub fn accept_all(batch: &OfferedBatch) -> Self {
        BatchDecision::Accept(batch.files.iter().map(|f| f.file_name.clone()).collect())
    }

    fn accepts(&self, file_name: &str) -> bool {
        match self {
            BatchDecision::RejectAll => false,
            BatchDecision::Accept(names) => names.contains(file_name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionCreated(Session),
    ProgressUpdated { id: SessionId, progress: u8 },
    StatusChanged { id: SessionId, status: TransferStatus },
    BatchOffered(OfferedBatch),
}

enum Command {
    SendFiles {
        paths: Vec<PathBuf>,
        peers: Vec<SocketAddr>,
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    ResolveBatch {
        batch: BatchId,
        decision: BatchDecision,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Download {
        peer: SocketAddr,
        relative_path: String,
        file_name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RestartReceiver {
        port: u16,
        reply: oneshot::Sender<Result<u16, SessionError>>,
    },
    ReceiverPort {
        reply: oneshot::Sender<u16>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<Session>>,
    },
}

enum Internal {
    Outbound { id: SessionId, event: SenderEvent },
    Reap(SessionId),
}

/// Cloneable handle to the session actor. The actor stops once every handle
/// has been dropped.
#[derive(Debug, Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionManager {
    /// Bind the receiver on `config.transfer_port` and start the actor.
    pub async fn start<S>(
        config: TransferConfig,
        storage: Arc<S>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), TransferError>
    where
        S: Storage + 'static,
    {
        let options = SenderOptions::from(&config);
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        let receiver =
            Receiver::bind(config.transfer_port, storage.clone(), options.clone(), receiver_tx.clone())
                .await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            collector: BatchCollector::new(config.batch_window()),
            config,
            options,
            storage,
            receiver,
            receiver_tx,
            sessions: HashMap::new(),
            inbound: HashMap::new(),
            offered: HashMap::new(),
            events,
            internal_tx,
        };
        tokio::spawn(actor.run(command_rx, internal_rx, receiver_rx));

        Ok((Self { commands }, event_rx))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Start one outbound session per (path, peer) pair.
    pub async fn send_files(
        &self,
        paths: Vec<PathBuf>,
        peers: Vec<SocketAddr>,
    ) -> Result<Vec<SessionId>, SessionError> {
        self.call(|reply| Command::SendFiles { paths, peers, reply }).await
    }

    pub async fn resolve_batch(&self, batch: BatchId, decision: BatchDecision) -> Result<(), SessionError> {
        self.call(|reply| Command::ResolveBatch { batch, decision, reply }).await?
    }

    /// Ask `peer` to push one of its shared files to our receiver.
    pub async fn download_remote_file(
        &self,
        peer: SocketAddr,
        relative_path: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let relative_path = relative_path.into();
        let file_name = file_name.into();
        self.call(|reply| Command::Download { peer, relative_path, file_name, reply })
            .await?
    }

    /// Rebind the receiver on `port`; returns the port actually bound.
    pub async fn restart_receiver(&self, port: u16) -> Result<u16, SessionError> {
        self.call(|reply| Command::RestartReceiver { port, reply }).await?
    }

    pub async fn receiver_port(&self) -> Result<u16, SessionError> {
        self.call(|reply| Command::ReceiverPort { reply }).await
    }

    /// Snapshot of the session table, ordered by id.
    pub async fn sessions(&self) -> Result<Vec<Session>, SessionError> {
        self.call(|reply| Command::Sessions { reply }).await
    }
}

struct PendingOffer {
    session: SessionId,
    file_name: String,
    file_size: u64,
    peer: SocketAddr,
    connection: PendingConnection,
}

struct Actor<S> {
    config: TransferConfig,
    options: SenderOptions,
    storage: Arc<S>,
    receiver: Receiver,
    receiver_tx: mpsc::UnboundedSender<ReceiverEvent>,
    sessions: HashMap<SessionId, Session>,
    /// Live inbound connections; entries go away on the first terminal event.
    inbound: HashMap<ConnectionId, SessionId>,
    collector: BatchCollector<PendingOffer>,
    offered: HashMap<BatchId, Vec<PendingOffer>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl<S> Actor<S>
where
    S: Storage + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut receiver_events: mpsc::UnboundedReceiver<ReceiverEvent>,
    ) {
        loop {
            let deadline = self.collector.deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(msg) = internal.recv() => self.handle_internal(msg),
                Some(event) = receiver_events.recv() => self.handle_receiver_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_batch(Instant::now());
                }
            }
        }

        // Refuse whatever is still waiting so no peer hangs on a decision.
        for offer in self.collector.remove_where(|_| true) {
            offer.connection.reject();
        }
        for (_, batch) in self.offered.drain() {
            for offer in batch {
                offer.connection.reject();
            }
        }
        tracing::debug!("Session manager stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn create(&mut self, session: Session) -> SessionId {
        let id = session.id;
        tracing::debug!("Session {} created: {} ({:?})", id, session.name, session.direction);
        self.emit(SessionEvent::SessionCreated(session.clone()));
        self.sessions.insert(id, session);
        id
    }

    fn set_status(&mut self, id: SessionId, status: TransferStatus) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.set_status(status) {
            return;
        }
        tracing::info!("Session {} ({}) is {}", id, session.name, status);
        self.emit(SessionEvent::StatusChanged { id, status });
    }

    fn set_progress(&mut self, id: SessionId, progress: u8) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.set_progress(progress) {
            return;
        }
        let progress = session.progress;
        self.emit(SessionEvent::ProgressUpdated { id, progress });
    }

    /// Move a session to its final status and reclaim it after `delay`.
    fn finish(&mut self, id: SessionId, status: TransferStatus, delay: Duration) {
        self.set_status(id, status);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = internal.send(Internal::Reap(id));
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendFiles { paths, peers, reply } => {
                let ids = self.send_files(&paths, &peers);
                let _ = reply.send(ids);
            }
            Command::ResolveBatch { batch, decision, reply } => {
                let _ = reply.send(self.resolve_batch(batch, decision).await);
            }
            Command::Download { peer, relative_path, file_name, reply } => {
                let request = DownloadRequest {
                    relative_path,
                    file_name,
                    reply_port: self.receiver.port(),
                };
                let connect_timeout = self.config.connect_timeout();
                tokio::spawn(async move {
                    let _ = reply.send(request_download(peer, request, connect_timeout).await);
                });
            }
            Command::RestartReceiver { port, reply } => {
                let _ = reply.send(self.restart_receiver(port).await);
            }
            Command::ReceiverPort { reply } => {
                let _ = reply.send(self.receiver.port());
            }
            Command::Sessions { reply } => {
                let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
                sessions.sort_by_key(|s| s.id);
                let _ = reply.send(sessions);
            }
        }
    }

    fn send_files(&mut self, paths: &[PathBuf], peers: &[SocketAddr]) -> Vec<SessionId> {
        let mut ids = Vec::with_capacity(paths.len() * peers.len());
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            for peer in peers {
                let name = format!("{} @{}", file_name, peer.ip());
                let id = self.create(Session::new(name, *peer, Direction::Send));
                ids.push(id);

                match Sender::send(path, *peer, self.options.clone()) {
                    Ok(handle) => self.track_outbound(id, handle),
                    Err(e) => {
                        tracing::warn!("Cannot send {} to {}: {}", path.display(), peer, e);
                        self.finish(id, TransferStatus::Error, self.config.reap_delay());
                    }
                }
            }
        }
        ids
    }

    fn track_outbound(&self, id: SessionId, handle: SenderHandle) {
        let (mut events, _abort) = handle.into_events();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                if internal.send(Internal::Outbound { id, event }).is_err() || terminal {
                    break;
                }
            }
        });
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Outbound { id, event } => match event {
                SenderEvent::Accepted => self.set_status(id, TransferStatus::InProgress),
                SenderEvent::Progress(p) => {
                    self.set_status(id, TransferStatus::InProgress);
                    self.set_progress(id, p);
                }
                SenderEvent::Finished => {
                    self.finish(id, TransferStatus::Finished, self.config.reap_delay())
                }
                SenderEvent::Refused => {
                    self.finish(id, TransferStatus::Cancelled, self.config.refused_reap_delay())
                }
                SenderEvent::Error(e) => {
                    tracing::warn!("Session {} failed: {}", id, e);
                    self.finish(id, TransferStatus::Error, self.config.reap_delay());
                }
            },
            Internal::Reap(id) => {
                if self.sessions.remove(&id).is_some() {
                    tracing::debug!("Session {} reclaimed", id);
                }
            }
        }
    }

    fn handle_receiver_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::TransferRequested(offer) => self.queue_offer(offer),
            ReceiverEvent::Progress { id, percent } => {
                if let Some(&session) = self.inbound.get(&id) {
                    self.set_progress(session, percent);
                }
            }
            ReceiverEvent::Finished { id, .. } => {
                self.end_inbound(id, TransferStatus::Finished);
            }
            ReceiverEvent::Cancelled { id, received, expected } => {
                let reason = TransferError::PeerDisconnectedEarly { received, expected };
                tracing::info!("Inbound transfer {} cancelled: {}", id, reason);
                self.end_inbound(id, TransferStatus::Cancelled);
            }
            ReceiverEvent::Error { id, error } => {
                tracing::warn!("Inbound transfer {} failed: {}", id, error);
                self.end_inbound(id, TransferStatus::Error);
            }
            ReceiverEvent::UploadStarted { file_name, peer, handle } => {
                let name = format!("{} @{}", file_name, peer.ip());
                let id = self.create(Session::new(name, peer, Direction::Send));
                self.track_outbound(id, handle);
            }
        }
    }

    fn end_inbound(&mut self, conn: ConnectionId, status: TransferStatus) {
        if let Some(session) = self.inbound.remove(&conn) {
            self.finish(session, status, self.config.reap_delay());
            self.forget_offered(session);
        }
    }

    /// Drop a finished session from any batch still awaiting a decision, and
    /// the batch itself once nothing in it is alive.
    fn forget_offered(&mut self, session: SessionId) {
        self.offered.retain(|id, offers| {
            offers.retain(|o| o.session != session);
            if offers.is_empty() {
                tracing::debug!("{} has no live offers left", id);
                return false;
            }
            true
        });
    }

    fn is_live(&self, offer: &PendingOffer) -> bool {
        !offer.connection.is_closed()
            && self
                .sessions
                .get(&offer.session)
                .is_some_and(|s| !s.status.is_terminal())
    }

    fn queue_offer(&mut self, offer: IncomingOffer) {
        let IncomingOffer { id: conn, peer, file_name, file_size, connection } = offer;

        let session = self.create(Session::new(file_name.clone(), peer, Direction::Receive));
        self.inbound.insert(conn, session);

        for older in self.collector.remove_where(|p| p.file_name == file_name) {
            tracing::info!("Newer offer for {} replaces the pending one", older.file_name);
            self.refuse(older);
        }

        self.collector.offer(
            PendingOffer { session, file_name, file_size, peer, connection },
            Instant::now(),
        );
    }

    fn refuse(&mut self, offer: PendingOffer) {
        let conn = offer.connection.id();
        offer.connection.reject();
        self.inbound.remove(&conn);
        self.finish(offer.session, TransferStatus::Cancelled, self.config.reap_delay());
    }

    fn flush_batch(&mut self, now: Instant) {
        let Some(items) = self.collector.take_if_due(now) else {
            return;
        };

        // Offers whose peer already went away are not worth asking about.
        let items: Vec<PendingOffer> = items
            .into_iter()
            .filter(|p| self.is_live(p))
            .collect();
        if items.is_empty() {
            return;
        }

        let batch = OfferedBatch {
            id: BatchId::next(),
            files: items
                .iter()
                .map(|p| BatchFile {
                    session: p.session,
                    file_name: p.file_name.clone(),
                    file_size: p.file_size,
                    peer: p.peer,
                })
                .collect(),
        };
        tracing::info!("{} with {} file(s) awaiting decision", batch.id, batch.files.len());
        self.offered.insert(batch.id, items);
        self.emit(SessionEvent::BatchOffered(batch));
    }

    async fn resolve_batch(&mut self, batch: BatchId, decision: BatchDecision) -> Result<(), SessionError> {
        let items = self.offered.remove(&batch).ok_or(SessionError::UnknownBatch(batch))?;

        for offer in items {
            if !self.is_live(&offer) {
                tracing::debug!("Skipping {}: the peer is gone", offer.file_name);
                self.refuse(offer);
                continue;
            }
            if !decision.accepts(&offer.file_name) {
                self.refuse(offer);
                continue;
            }

            match self.storage.open_destination(&offer.file_name).await {
                Ok((file, path)) => {
                    tracing::info!("Accepted {} into {}", offer.file_name, path.display());
                    if offer.connection.accept(file, path) {
                        self.set_status(offer.session, TransferStatus::InProgress);
                    }
                }
                Err(e) => {
                    tracing::warn!("Cannot open destination for {}: {:#}", offer.file_name, e);
                    self.refuse(offer);
                }
            }
        }
        Ok(())
    }

    async fn restart_receiver(&mut self, port: u16) -> Result<u16, SessionError> {
        if port != 0 && port == self.receiver.port() {
            return Ok(port);
        }
        let receiver = Receiver::bind(
            port,
            self.storage.clone(),
            self.options.clone(),
            self.receiver_tx.clone(),
        )
        .await?;
        self.config.transfer_port = port;
        let old = std::mem::replace(&mut self.receiver, receiver);
        old.close();
        Ok(self.receiver.port())
    }
}

async fn request_download(
    peer: SocketAddr,
    request: DownloadRequest,
    connect_timeout: Duration,
) -> Result<(), SessionError> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| TransferError::ConnectTimeout)?
        .map_err(TransferError::Connect)?;

    tracing::info!("Requesting {} from {}", request.relative_path, peer);
    stream
        .write_all(request.encode().as_bytes())
        .await
        .map_err(TransferError::IoWrite)?;
    stream.shutdown().await.map_err(TransferError::IoWrite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Node {
        temp: TempDir,
        manager: SessionManager,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        port: u16,
    }

    async fn node() -> Node {
        let temp = TempDir::new().unwrap();
        let config = TransferConfig {
            transfer_port: 0,
            ..TransferConfig::default()
        }
        .with_dirs(temp.path().join("received"), temp.path().join("shared"));
        let storage = Arc::new(LocalStorage::new(
            config.received_dir.clone(),
            config.shared_dir.clone(),
        ));
        let (manager, events) = SessionManager::start(config, storage).await.unwrap();
        let port = manager.receiver_port().await.unwrap();
        Node { temp, manager, events, port }
    }

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn wait_for<F, T>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pick: F) -> T
    where
        F: FnMut(&SessionEvent) -> Option<T>,
    {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    async fn wait_batch(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> OfferedBatch {
        wait_for(events, |e| match e {
            SessionEvent::BatchOffered(batch) => Some(batch.clone()),
            _ => None,
        })
        .await
    }

    async fn wait_status(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        id: SessionId,
    ) -> TransferStatus {
        wait_for(events, |e| match e {
            SessionEvent::StatusChanged { id: got, status } if *got == id && status.is_terminal() => {
                Some(*status)
            }
            _ => None,
        })
        .await
    }

    fn write_file(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut session = Session::new("a.txt".into(), local(1), Direction::Receive);
        assert!(session.set_status(TransferStatus::InProgress));
        assert!(session.set_progress(40));
        assert!(!session.set_progress(30));
        assert!(session.set_status(TransferStatus::Cancelled));

        assert!(!session.set_status(TransferStatus::Finished));
        assert!(!session.set_status(TransferStatus::InProgress));
        assert!(!session.set_progress(100));
        assert_eq!(session.status, TransferStatus::Cancelled);
        assert_eq!(session.progress, 40);
    }

    #[test]
    fn test_progress_ignored_while_waiting() {
        let mut session = Session::new("a.txt".into(), local(1), Direction::Send);
        assert!(!session.set_progress(50));
        assert_eq!(session.progress, 0);
    }

    #[tokio::test]
    async fn test_accepted_batch_transfers_file() {
        let mut sender = node().await;
        let mut receiver = node().await;
        let path = write_file(sender.temp.path(), "report.txt", b"quarterly numbers");

        let ids = sender
            .manager
            .send_files(vec![path], vec![local(receiver.port)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let batch = wait_batch(&mut receiver.events).await;
        assert_eq!(batch.files.len(), 1);
        assert_eq!(batch.files[0].file_name, "report.txt");
        assert_eq!(batch.files[0].file_size, 17);

        let inbound = batch.files[0].session;
        receiver
            .manager
            .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
            .await
            .unwrap();

        assert_eq!(wait_status(&mut sender.events, ids[0]).await, TransferStatus::Finished);
        assert_eq!(wait_status(&mut receiver.events, inbound).await, TransferStatus::Finished);

        let written = receiver.temp.path().join("received").join("report.txt");
        assert_eq!(std::fs::read(written).unwrap(), b"quarterly numbers");

        // A batch can only be resolved once.
        let again = receiver.manager.resolve_batch(batch.id, BatchDecision::RejectAll).await;
        assert!(matches!(again, Err(SessionError::UnknownBatch(_))));
    }

    #[tokio::test]
    async fn test_rejected_batch_cancels_both_sides() {
        let mut sender = node().await;
        let mut receiver = node().await;
        let path = write_file(sender.temp.path(), "nope.bin", &[0u8; 1024]);

        let ids = sender
            .manager
            .send_files(vec![path], vec![local(receiver.port)])
            .await
            .unwrap();
        let batch = wait_batch(&mut receiver.events).await;
        receiver
            .manager
            .resolve_batch(batch.id, BatchDecision::RejectAll)
            .await
            .unwrap();

        assert_eq!(wait_status(&mut sender.events, ids[0]).await, TransferStatus::Cancelled);
        assert_eq!(
            wait_status(&mut receiver.events, batch.files[0].session).await,
            TransferStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let mut sender = node().await;
        let mut first = node().await;
        let mut second = node().await;
        let good = write_file(sender.temp.path(), "good.txt", b"ok");
        let missing = sender.temp.path().join("missing.txt");

        let ids = sender
            .manager
            .send_files(vec![good, missing], vec![local(first.port), local(second.port)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 4);

        let sessions = sender.manager.sessions().await.unwrap();
        assert_eq!(sessions[0].name, "good.txt @127.0.0.1");
        assert_eq!(sessions[0].direction, Direction::Send);

        for peer in [&mut first, &mut second] {
            let batch = wait_batch(&mut peer.events).await;
            assert_eq!(batch.files.len(), 1);
            peer.manager
                .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
                .await
                .unwrap();
        }

        let mut finals = HashMap::new();
        while finals.len() < ids.len() {
            let (id, status) = wait_for(&mut sender.events, |e| match e {
                SessionEvent::StatusChanged { id, status } if status.is_terminal() => Some((*id, *status)),
                _ => None,
            })
            .await;
            finals.insert(id, status);
        }
        let statuses: Vec<TransferStatus> = ids.iter().map(|id| finals[id]).collect();
        assert_eq!(
            statuses,
            vec![
                TransferStatus::Finished,
                TransferStatus::Finished,
                TransferStatus::Error,
                TransferStatus::Error,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_in_window_refuses_older() {
        let mut receiver = node().await;

        let mut older = BufReader::new(TcpStream::connect(local(receiver.port)).await.unwrap());
        older.get_mut().write_all(b"same.txt|3\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut newer = BufReader::new(TcpStream::connect(local(receiver.port)).await.unwrap());
        newer.get_mut().write_all(b"same.txt|4\n").await.unwrap();

        let mut reply = String::new();
        timeout(Duration::from_secs(5), older.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "NO\n");

        let batch = wait_batch(&mut receiver.events).await;
        assert_eq!(batch.files.len(), 1);
        assert_eq!(batch.files[0].file_size, 4);
        receiver
            .manager
            .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
            .await
            .unwrap();

        reply.clear();
        newer.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "OK\n");
    }

    #[tokio::test]
    async fn test_resolving_abandoned_offer_leaves_existing_file() {
        let mut receiver = node().await;
        let existing = write_file(&receiver.temp.path().join("received"), "a.txt", b"precious");

        let mut client = TcpStream::connect(local(receiver.port)).await.unwrap();
        client.write_all(b"a.txt|5\n").await.unwrap();
        let batch = wait_batch(&mut receiver.events).await;

        drop(client);
        assert_eq!(
            wait_status(&mut receiver.events, batch.files[0].session).await,
            TransferStatus::Cancelled
        );

        let result = receiver
            .manager
            .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
            .await;
        assert!(matches!(result, Err(SessionError::UnknownBatch(_))));
        assert_eq!(std::fs::read(existing).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_batch_keeps_live_offers_after_one_leaves() {
        let mut receiver = node().await;

        let mut gone = TcpStream::connect(local(receiver.port)).await.unwrap();
        gone.write_all(b"gone.txt|3\n").await.unwrap();
        let mut staying = BufReader::new(TcpStream::connect(local(receiver.port)).await.unwrap());
        staying.get_mut().write_all(b"stay.txt|3\n").await.unwrap();

        let batch = wait_batch(&mut receiver.events).await;
        assert_eq!(batch.files.len(), 2);
        let gone_session = batch
            .files
            .iter()
            .find(|f| f.file_name == "gone.txt")
            .map(|f| f.session)
            .unwrap();

        drop(gone);
        assert_eq!(
            wait_status(&mut receiver.events, gone_session).await,
            TransferStatus::Cancelled
        );

        receiver
            .manager
            .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
            .await
            .unwrap();

        let mut reply = String::new();
        timeout(Duration::from_secs(5), staying.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "OK\n");
        assert!(!receiver.temp.path().join("received").join("gone.txt").exists());
    }

    #[tokio::test]
    async fn test_download_remote_file() {
        let mut requester = node().await;
        let owner = node().await;
        write_file(&owner.temp.path().join("shared"), "slides.pdf", b"%PDF-1.4");

        requester
            .manager
            .download_remote_file(local(owner.port), "slides.pdf", "slides.pdf")
            .await
            .unwrap();

        let batch = wait_batch(&mut requester.events).await;
        assert_eq!(batch.files[0].file_name, "slides.pdf");
        requester
            .manager
            .resolve_batch(batch.id, BatchDecision::accept_all(&batch))
            .await
            .unwrap();
        assert_eq!(
            wait_status(&mut requester.events, batch.files[0].session).await,
            TransferStatus::Finished
        );

        let written = requester.temp.path().join("received").join("slides.pdf");
        assert_eq!(std::fs::read(written).unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_sessions_are_reaped() {
        let mut sender = node().await;
        let missing = sender.temp.path().join("ghost.txt");

        let ids = sender
            .manager
            .send_files(vec![missing], vec![local(9)])
            .await
            .unwrap();
        assert_eq!(wait_status(&mut sender.events, ids[0]).await, TransferStatus::Error);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sender.manager.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_receiver_changes_port() {
        let node = node().await;
        let new_port = node.manager.restart_receiver(0).await.unwrap();
        assert_ne!(new_port, 0);
        assert_eq!(node.manager.receiver_port().await.unwrap(), new_port);
        TcpStream::connect(local(new_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_receiver_onto_busy_port_keeps_receiving() {
        let mut node = node().await;
        let blocker = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let busy = blocker.local_addr().unwrap().port();

        let port = node.manager.restart_receiver(busy).await.unwrap();
        assert_ne!(port, busy);
        assert_eq!(node.manager.receiver_port().await.unwrap(), port);

        let mut client = TcpStream::connect(local(port)).await.unwrap();
        client.write_all(b"after.txt|1\n").await.unwrap();
        let batch = wait_batch(&mut node.events).await;
        assert_eq!(batch.files[0].file_name, "after.txt");
    }
}
