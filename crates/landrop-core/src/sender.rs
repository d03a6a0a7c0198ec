//! Outbound side of a transfer.
//!
//! One `Sender::send` call owns one TCP connection and walks
//! `Idle → Connecting → AwaitingDecision → Streaming → Finished`, leaving
//! through `Refused` or `Error` when the peer says no or anything fails.
//! The socket and the file live inside the spawned task, so they are released
//! exactly once whichever way it ends.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::lines::read_line;
use crate::wire::{Decision, Offer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Connecting,
    AwaitingDecision,
    Streaming,
    Finished,
    Refused,
    Error,
}

#[derive(Debug)]
pub enum SenderEvent {
    /// The peer answered `OK`; streaming starts.
    Accepted,
    /// Percentage of the file written to the socket so far.
    Progress(u8),
    Refused,
    Finished,
    Error(TransferError),
}

impl SenderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SenderEvent::Refused | SenderEvent::Finished | SenderEvent::Error(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for SenderOptions {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size.max(1),
            connect_timeout: cfg.connect_timeout(),
            response_timeout: cfg.response_timeout(),
        }
    }
}

/// Handle to a running outbound transfer.
#[derive(Debug)]
pub struct SenderHandle {
    file_name: String,
    peer: SocketAddr,
    events: mpsc::UnboundedReceiver<SenderEvent>,
    state: watch::Receiver<SenderState>,
    task: JoinHandle<()>,
}

impl SenderHandle {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SenderState {
        *self.state.borrow()
    }

    /// Next lifecycle event; `None` once the transfer task has ended.
    pub async fn next_event(&mut self) -> Option<SenderEvent> {
        self.events.recv().await
    }

    /// Close the connection immediately.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    pub fn into_events(self) -> (mpsc::UnboundedReceiver<SenderEvent>, AbortHandle) {
        let abort = self.task.abort_handle();
        (self.events, abort)
    }
}

pub struct Sender;

impl Sender {
    /// Offer `path` to the receiver listening at `peer`.
    ///
    /// Fails only when the file is missing; every later failure is reported
    /// through the handle's events. Must be called inside a tokio runtime.
    pub fn send(
        path: impl AsRef<Path>,
        peer: SocketAddr,
        options: SenderOptions,
    ) -> Result<SenderHandle, TransferError> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path).map_err(|_| TransferError::NotFound(path.clone()))?;
        if !meta.is_file() {
            return Err(TransferError::NotFound(path));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| TransferError::NotFound(path.clone()))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SenderState::Idle);
        let reporter = Reporter { events: event_tx, state: state_tx };
        let offer = Offer::new(file_name.clone(), meta.len());

        let task = tokio::spawn(run(path, offer, peer, options, reporter));

        Ok(SenderHandle { file_name, peer, events, state, task })
    }
}

struct Reporter {
    events: mpsc::UnboundedSender<SenderEvent>,
    state: watch::Sender<SenderState>,
}

impl Reporter {
    fn state(&self, state: SenderState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SenderEvent) {
        // Nobody listening is fine; the transfer still runs to completion.
        let _ = self.events.send(event);
    }
}

async fn run(path: PathBuf, offer: Offer, peer: SocketAddr, options: SenderOptions, reporter: Reporter) {
    tracing::info!("Starting send: {} ({} bytes) to {}", offer.file_name, offer.file_size, peer);

    match drive(&path, &offer, peer, &options, &reporter).await {
        Ok(()) => {
            tracing::info!("Transfer complete: {} to {}", offer.file_name, peer);
            reporter.state(SenderState::Finished);
            reporter.emit(SenderEvent::Finished);
        }
        Err(TransferError::PeerRefused) => {
            tracing::info!("{} refused {}", peer, offer.file_name);
            reporter.state(SenderState::Refused);
            reporter.emit(SenderEvent::Refused);
        }
        Err(e) => {
            tracing::warn!("Sending {} to {} failed: {}", offer.file_name, peer, e);
            reporter.state(SenderState::Error);
            reporter.emit(SenderEvent::Error(e));
        }
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

async fn drive(
    path: &Path,
    offer: &Offer,
    peer: SocketAddr,
    options: &SenderOptions,
    reporter: &Reporter,
) -> Result<(), TransferError> {
    reporter.state(SenderState::Connecting);
    let stream = timeout(options.connect_timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| TransferError::ConnectTimeout)?
        .map_err(TransferError::Connect)?;
    tracing::debug!("Connected to {}", peer);

    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(offer.encode().as_bytes())
        .await
        .map_err(TransferError::IoWrite)?;
    stream.get_mut().flush().await.map_err(TransferError::IoWrite)?;

    reporter.state(SenderState::AwaitingDecision);
    let line = timeout(options.response_timeout, read_line(&mut stream))
        .await
        .map_err(|_| TransferError::ResponseTimeout)?
        .map_err(TransferError::IoRead)?
        .ok_or_else(|| {
            TransferError::ProtocolViolation("connection closed before a decision".into())
        })?;

    let mut stream = stream.into_inner();
    if Decision::decode(&line)? == Decision::Reject {
        let _ = stream.shutdown().await;
        return Err(TransferError::PeerRefused);
    }
    reporter.emit(SenderEvent::Accepted);

    let mut file = File::open(path).await.map_err(TransferError::IoRead)?;
    reporter.state(SenderState::Streaming);

    // Each chunk is read only after the previous write completed, so a slow
    // receiver throttles the sender through TCP backpressure.
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut sent: u64 = 0;
    if offer.file_size == 0 {
        reporter.emit(SenderEvent::Progress(100));
    }
    loop {
        let n = file.read(&mut buf).await.map_err(TransferError::IoRead)?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await.map_err(TransferError::IoWrite)?;
        sent += n as u64;
        reporter.emit(SenderEvent::Progress(percent(sent, offer.file_size)));
    }
    stream.flush().await.map_err(TransferError::IoWrite)?;
    drop(file);

    if let Err(e) = stream.shutdown().await {
        tracing::debug!("Shutdown after sending to {} failed: {}", peer, e);
    }
    Ok(())
}
