//! TCP session with a goniometer.
//!
//! A [`Session`] owns one connection at a time. `start` connects and spawns a
//! single receive task that turns socket bytes into [`TelemetrySample`]s and
//! hands them to an [`EventSink`]. Commands go out through `send`, which
//! serializes writers so frames from concurrent callers never interleave.
//!
//! ```text
//! Idle ──start──▶ Connecting ──▶ Connected ──stop / write error──▶ Closing ──▶ Closed
//!                     │  │               │                                       ▲
//!                     │  └──stop─────────┼──▶ Closing ───────────────────────────┤
//!                     └── connect err ───┴── EOF / read error / anomaly ─────────┘
//! ```
//!
//! Every `start` opens a new epoch. Cleanup paths carry the epoch they belong
//! to and leave a newer connection alone.
//!
//! [`TelemetrySample`]: crate::telemetry::TelemetrySample

use crate::command::Command;
use crate::config::SessionConfig;
use crate::error::GonioError;
use crate::sink::{CloseReason, EventSink};
use crate::telemetry::{FrameDecoder, TELEMETRY_FRAME_LEN};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use strum_macros::Display;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct ReceiveTask {
    epoch: u64,
    shutdown: oneshot::Sender<CloseReason>,
    handle: JoinHandle<()>,
}

struct Writer {
    epoch: u64,
    half: OwnedWriteHalf,
}

/// What a shutdown request found to tear down.
enum Teardown {
    Nothing,
    Connect(u64),
    Connection(u64, Option<ReceiveTask>),
}

struct Inner {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Only changed inside a `state` update, so epoch and state move together.
    epoch: AtomicU64,
    writer: Mutex<Option<Writer>>,
    receiver: StdMutex<Option<ReceiveTask>>,
}

impl Inner {
    fn receiver_slot(&self) -> MutexGuard<'_, Option<ReceiveTask>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Move to `Closed`, unless a newer connection has started since.
    fn mark_closed(&self, epoch: u64) {
        self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch || *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
            true
        });
    }

    /// Undo a failed connect: back to where `start` came from, or `Closed`
    /// if a `stop` arrived meanwhile.
    fn abandon_connect(&self, epoch: u64, previous: SessionState) {
        self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch {
                return false;
            }
            match state {
                SessionState::Connecting => *state = previous,
                SessionState::Closing => *state = SessionState::Closed,
                _ => return false,
            }
            true
        });
    }

    async fn close_writer(&self, epoch: u64) {
        let mut slot = self.writer.lock().await;
        if let Some(mut writer) = slot.take_if(|w| w.epoch == epoch) {
            if let Err(e) = writer.half.shutdown().await {
                debug!(error = %e, "Socket shutdown failed");
            }
        }
    }
}

/// Handle to a goniometer connection. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                epoch: AtomicU64::new(0),
                writer: Mutex::new(None),
                receiver: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to connection-state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Connect to the host and port from the session config.
    pub async fn start_default<S: EventSink>(&self, sink: S) -> Result<(), GonioError> {
        let host = self.inner.config.host.clone();
        let port = self.inner.config.port;
        self.start(&host, port, sink).await
    }

    /// Connect and spawn the receive task.
    ///
    /// Only valid from `Idle` or `Closed`; a second `start` on a live session
    /// fails with [`GonioError::InvalidState`]. On connect failure the state
    /// reverts to what it was. A `stop` while the connect is in flight
    /// cancels it, leaves the session `Closed` and fails with
    /// `InvalidState(Closing)`.
    pub async fn start<S: EventSink>(&self, host: &str, port: u16, sink: S) -> Result<(), GonioError> {
        let mut previous = SessionState::Idle;
        let mut epoch = 0;
        let claimed = self.inner.state.send_if_modified(|state| match state {
            SessionState::Idle | SessionState::Closed => {
                previous = *state;
                epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                *state = SessionState::Connecting;
                true
            }
            _ => false,
        });
        if !claimed {
            return Err(GonioError::InvalidState(self.state()));
        }

        let addr = format!("{host}:{port}");
        info!(%addr, epoch, "Connecting to goniometer...");
        let mut state_rx = self.inner.state.subscribe();
        let cancelled = async move {
            let _ = state_rx.wait_for(|s| *s == SessionState::Closing).await;
        };
        let stream = tokio::select! {
            connected = timeout(self.inner.config.connect_timeout(), TcpStream::connect(&addr)) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    self.inner.abandon_connect(epoch, previous);
                    return Err(GonioError::Connect { addr, source });
                }
                Err(_) => {
                    self.inner.abandon_connect(epoch, previous);
                    return Err(GonioError::ConnectTimeout { addr });
                }
            },
            _ = cancelled => {
                info!(%addr, "Connect cancelled");
                self.inner.mark_closed(epoch);
                return Err(GonioError::InvalidState(SessionState::Closing));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }

        let (read_half, write_half) = stream.into_split();
        // New connection, new reassembly buffer.
        let decoder = FrameDecoder::new(self.inner.config.decode_mode);
        debug!(mode = ?decoder.mode(), "Telemetry decoder ready");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // Held until the socket is installed so no send sees Connected without it.
        let mut writer = self.inner.writer.lock().await;
        {
            // State change and task registration happen under one lock so
            // `stop` never sees a Connected session without its receive task.
            let mut slot = self.inner.receiver_slot();
            let live = self.inner.state.send_if_modified(|state| {
                if *state == SessionState::Connecting && self.inner.current_epoch() == epoch {
                    *state = SessionState::Connected;
                    true
                } else {
                    false
                }
            });
            if !live {
                info!(%addr, "Stopped while connecting, dropping socket");
                self.inner.mark_closed(epoch);
                return Err(GonioError::InvalidState(SessionState::Closing));
            }
            let handle = tokio::spawn(receive_loop(
                Arc::clone(&self.inner),
                epoch,
                read_half,
                decoder,
                sink,
                shutdown_rx,
            ));
            *slot = Some(ReceiveTask {
                epoch,
                shutdown: shutdown_tx,
                handle,
            });
        }
        *writer = Some(Writer {
            epoch,
            half: write_half,
        });
        drop(writer);

        info!(%addr, epoch, "Connected");
        Ok(())
    }

    /// Write one complete frame.
    ///
    /// Concurrent callers are serialized; a frame is always written whole
    /// before the next one starts. A failed or timed-out write may have left
    /// a partial frame on the wire, so the connection is torn down: the
    /// sink sees `CloseReason::WriteError` and the session ends `Closed`.
    pub async fn send(&self, frame: &[u8]) -> Result<(), GonioError> {
        if !self.is_connected() {
            return Err(GonioError::NotConnected);
        }
        let mut writer = self.inner.writer.lock().await;
        let conn = writer.as_mut().ok_or(GonioError::NotConnected)?;
        let epoch = conn.epoch;

        debug!(len = frame.len(), opcode = ?frame.first(), "Sending frame");
        trace!(data = %hex::encode(frame), "tx");

        let result = match timeout(self.inner.config.write_timeout(), conn.half.write_all(frame)).await {
            Ok(result) => result.map_err(GonioError::from),
            Err(elapsed) => Err(GonioError::from(elapsed)),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Write failed, closing connection");
            let kind = match e {
                GonioError::Io(err) => err.kind(),
                _ => io::ErrorKind::TimedOut,
            };
            if let Some(mut conn) = writer.take() {
                let _ = conn.half.shutdown().await;
            }
            drop(writer);
            self.shutdown(Some(epoch), CloseReason::WriteError(kind)).await;
        }
        result
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), GonioError> {
        debug!(?command, "Sending command");
        self.send(&command.encode()).await
    }

    /// Close the connection, or cancel one still being established.
    /// Safe to call any number of times from any task.
    ///
    /// Waits at most `stop_timeout_ms` for the receive task, then aborts it.
    pub async fn stop(&self) {
        self.shutdown(None, CloseReason::LocalStop).await;
    }

    /// Tear down the live connection, or only epoch `only` when given.
    async fn shutdown(&self, only: Option<u64>, reason: CloseReason) {
        let teardown = {
            let mut slot = self.inner.receiver_slot();
            let mut teardown = Teardown::Nothing;
            self.inner.state.send_if_modified(|state| {
                let epoch = self.inner.current_epoch();
                if only.is_some_and(|e| e != epoch) {
                    return false;
                }
                match state {
                    SessionState::Connecting => teardown = Teardown::Connect(epoch),
                    SessionState::Connected => {
                        teardown = Teardown::Connection(epoch, None);
                    }
                    _ => return false,
                }
                *state = SessionState::Closing;
                true
            });
            if let Teardown::Connection(epoch, task) = &mut teardown {
                *task = slot.take().filter(|t| t.epoch == *epoch);
            }
            teardown
        };

        match teardown {
            Teardown::Nothing => debug!(state = %self.state(), "Nothing to stop"),
            Teardown::Connect(epoch) => {
                info!(epoch, "Cancelling connect in progress");
                let mut state_rx = self.inner.state.subscribe();
                let settled = async move {
                    let _ = state_rx.wait_for(|s| *s != SessionState::Closing).await;
                };
                if timeout(self.inner.config.stop_timeout(), settled).await.is_err() {
                    warn!("Connect did not settle in time, forcing Closed");
                    self.inner.mark_closed(epoch);
                }
            }
            Teardown::Connection(epoch, task) => {
                info!(epoch, ?reason, "Stopping session");
                if let Some(ReceiveTask { shutdown, mut handle, .. }) = task {
                    let _ = shutdown.send(reason);
                    if timeout(self.inner.config.stop_timeout(), &mut handle).await.is_err() {
                        warn!("Receive task did not finish in time, aborting it");
                        handle.abort();
                    }
                }
                self.inner.close_writer(epoch).await;
                self.inner.mark_closed(epoch);
                info!(epoch, "Session closed");
            }
        }
    }
}

async fn receive_loop<S: EventSink>(
    inner: Arc<Inner>,
    epoch: u64,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    mut sink: S,
    mut shutdown: oneshot::Receiver<CloseReason>,
) {
    let mut buf = vec![0u8; inner.config.read_chunk_size.max(TELEMETRY_FRAME_LEN)];
    let reason = loop {
        let read = tokio::select! {
            requested = &mut shutdown => break requested.unwrap_or(CloseReason::LocalStop),
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!("Device closed the connection");
                break CloseReason::RemoteClosed;
            }
            Ok(n) => {
                debug!(bytes = n, "Telemetry read");
                decoder.extend(&buf[..n]);
                if let Err(e) = drain_samples(&mut decoder, &mut sink) {
                    warn!(error = %e, "Dropping connection after malformed telemetry");
                    break CloseReason::Anomaly(e.to_string());
                }
            }
            Err(e) => {
                warn!(error = %e, "Telemetry read failed");
                break CloseReason::ReadError(e.kind());
            }
        }
    };

    drop(reader);
    if decoder.buffered_len() > 0 {
        debug!(pending = %hex::encode(decoder.pending()), "Discarding partial telemetry frame");
    }
    inner.close_writer(epoch).await;
    inner.mark_closed(epoch);
    debug!(epoch, ?reason, frames = decoder.frames_decoded(), "Receive loop finished");
    sink.on_closed(reason);
}

/// Publish every complete frame, stopping at the first strict-mode anomaly.
fn drain_samples<S: EventSink>(decoder: &mut FrameDecoder, sink: &mut S) -> Result<(), GonioError> {
    while let Some(sample) = decoder.next_sample()? {
        sink.on_sample(sample);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SessionEvent;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn session() -> Session {
        Session::new(SessionConfig::default())
    }

    #[tokio::test]
    async fn send_before_start_is_not_connected() {
        let session = session();
        assert!(matches!(
            session.send_command(&Command::Stop).await,
            Err(GonioError::NotConnected)
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let session = session();
        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn refused_connect_reverts_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = session();
        let (tx, _rx) = mpsc::unbounded_channel::<SessionEvent>();
        let err = session.start("127.0.0.1", port, tx).await.unwrap_err();
        assert!(matches!(err, GonioError::Connect { .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn double_start_is_invalid_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = session();
        let (tx, _rx) = mpsc::unbounded_channel::<SessionEvent>();
        session.start("127.0.0.1", port, tx.clone()).await.unwrap();
        let _peer = listener.accept().await.unwrap();

        assert!(matches!(
            session.start("127.0.0.1", port, tx).await,
            Err(GonioError::InvalidState(SessionState::Connected))
        ));
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn late_cleanup_of_old_epoch_spares_restarted_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        session.start("127.0.0.1", port, tx.clone()).await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        let first_epoch = session.inner.current_epoch();

        drop(first);
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed(CloseReason::RemoteClosed)));
        session
            .watch_state()
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .unwrap();

        session.start("127.0.0.1", port, tx).await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        assert_ne!(session.inner.current_epoch(), first_epoch);

        // What a `stop` that raced the first close does once it resumes.
        session.inner.close_writer(first_epoch).await;
        session.inner.mark_closed(first_epoch);

        assert_eq!(session.state(), SessionState::Connected);
        session.send_command(&Command::Stop).await.unwrap();
        let mut opcode = [0u8; 1];
        second.read_exact(&mut opcode).await.unwrap();
        assert_eq!(opcode, [1]);

        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
