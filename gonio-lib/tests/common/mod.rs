//! Loopback helpers shared by the integration tests.

#![allow(dead_code)]

pub use gonio_lib::{
    CloseReason, Command, DecodeMode, GonioError, Opcode, Session, SessionConfig, SessionEvent, SessionState,
    TelemetrySample,
};

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;

/// Route library logs to the test harness; `RUST_LOG=debug` shows frame traffic.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener on an ephemeral loopback port.
pub async fn loopback() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

/// Listener with a zero backlog whose accept queue is already full, so a
/// further connect stays in SYN-SENT until it times out. Keep the returned
/// streams alive for as long as the queue must stay full.
pub async fn saturated_listener() -> (TcpListener, u16, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().expect("socket");
    socket.bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
    let listener = socket.listen(0).expect("listen");
    let port = listener.local_addr().expect("local addr").port();

    let mut fillers = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(stream)) => fillers.push(stream),
            _ => break,
        }
    }
    (listener, port, fillers)
}

pub fn config_for(port: u16) -> SessionConfig {
    SessionConfig {
        port,
        ..SessionConfig::default()
    }
}

/// Start a session against `listener` and return the accepted device side.
pub async fn connect(
    session: &Session,
    listener: &TcpListener,
) -> (TcpStream, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let port = listener.local_addr().expect("local addr").port();
    session.start("127.0.0.1", port, tx).await.expect("session start");
    let (device, _) = listener.accept().await.expect("accept");
    (device, rx)
}

pub fn telemetry_bytes(samples: &[(u32, u32)]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&(x, y)| TelemetrySample::new(x, y).to_bytes())
        .collect()
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Read one command frame the way the device does: opcode first, then the
/// fixed number of bytes that opcode implies.
pub async fn read_command(device: &mut TcpStream) -> Option<Command> {
    let mut opcode = [0u8; 1];
    if device.read_exact(&mut opcode).await.is_err() {
        return None;
    }
    let op = Opcode::try_from(opcode[0]).expect("known opcode");
    let mut frame = vec![0u8; op.frame_len()];
    frame[0] = opcode[0];
    device.read_exact(&mut frame[1..]).await.expect("frame body");
    Some(Command::decode(&frame).expect("well-formed frame"))
}

/// Tiny deterministic generator so chunking tests are reproducible without extra crates.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    pub fn below(&mut self, n: u32) -> u32 {
        self.next_u32() % n
    }
}
