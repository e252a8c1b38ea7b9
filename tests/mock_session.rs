//! End-to-end: a console session driving the simulated goniometer.

use gonio_lib::{Command, JogDirection, Session, SessionConfig, SessionEvent, SessionState, TelemetrySample};
use gonio_rs::mock::{MockGoniometer, serve, simulate};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

const TICK: Duration = Duration::from_millis(10);

async fn spawn_mock() -> (u16, Arc<Mutex<MockGoniometer>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = Arc::new(Mutex::new(MockGoniometer::default()));
    tokio::spawn(simulate(Arc::clone(&device), TICK));
    let served = Arc::clone(&device);
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let device = Arc::clone(&served);
            tokio::spawn(async move {
                let _ = serve(stream, peer, device, TICK).await;
            });
        }
    });
    (port, device)
}

async fn wait_for_sample(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: TelemetrySample,
) -> bool {
    let wait = async {
        while let Some(event) = rx.recv().await {
            if event == SessionEvent::Sample(wanted) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or(false)
}

#[tokio::test]
async fn goto_reaches_target() {
    let (port, _device) = spawn_mock().await;
    let session = Session::new(SessionConfig {
        port,
        ..SessionConfig::default()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.start_default(tx).await.unwrap();

    session.send_command(&Command::Goto { x: 12.0, y: 3.0 }).await.unwrap();
    assert!(wait_for_sample(&mut rx, TelemetrySample::new(12, 3)).await);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn jog_then_stop_holds_position() {
    let (port, device) = spawn_mock().await;
    let session = Session::new(SessionConfig {
        port,
        ..SessionConfig::default()
    });
    let (tx, _rx) = mpsc::unbounded_channel();
    session.start_default(tx).await.unwrap();

    session.send_command(&Command::Jog(JogDirection::Right)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.send_command(&Command::Stop).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped_at = device.lock().await.x;
    assert!(stopped_at > 0.0);
    assert!(!device.lock().await.is_moving());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.lock().await.x, stopped_at);

    session.stop().await;
}
