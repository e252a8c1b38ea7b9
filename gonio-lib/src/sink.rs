use crate::telemetry::TelemetrySample;
use std::io;
use tokio::sync::mpsc;

/// Why a session's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The device closed the connection (zero-length read).
    RemoteClosed,
    ReadError(io::ErrorKind),
    /// A command write failed or timed out; the frame may be partial.
    WriteError(io::ErrorKind),
    /// Strict decoding rejected a frame.
    Anomaly(String),
    /// `Session::stop` was called.
    LocalStop,
}

/// Receives everything a session produces, in arrival order, from the
/// receive task. Implementations must not block for long: the next socket
/// read waits until the callback returns.
pub trait EventSink: Send + 'static {
    fn on_sample(&mut self, sample: TelemetrySample);

    /// Called at most once per connection, after the session is `Closed`.
    /// The only connection that ends without it is one whose receive task
    /// `Session::stop` had to abort, still busy after `stop_timeout_ms`
    /// (a blocking `on_sample`, or a stalled write holding the socket).
    fn on_closed(&mut self, reason: CloseReason);
}

/// Event form of the [`EventSink`] callbacks, for channel-based consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Sample(TelemetrySample),
    Closed(CloseReason),
}

/// Forward events to a channel so a UI can drain them on its own thread.
/// A dropped receiver is not an error; events are discarded.
impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn on_sample(&mut self, sample: TelemetrySample) {
        let _ = self.send(SessionEvent::Sample(sample));
    }

    fn on_closed(&mut self, reason: CloseReason) {
        let _ = self.send(SessionEvent::Closed(reason));
    }
}

/// Closure-based sink.
pub struct FnSink<S, C> {
    on_sample: S,
    on_closed: Option<C>,
}

impl<S, C> FnSink<S, C>
where
    S: FnMut(TelemetrySample) + Send + 'static,
    C: FnOnce(CloseReason) + Send + 'static,
{
    pub fn new(on_sample: S, on_closed: C) -> Self {
        Self {
            on_sample,
            on_closed: Some(on_closed),
        }
    }
}

impl<S, C> EventSink for FnSink<S, C>
where
    S: FnMut(TelemetrySample) + Send + 'static,
    C: FnOnce(CloseReason) + Send + 'static,
{
    fn on_sample(&mut self, sample: TelemetrySample) {
        (self.on_sample)(sample);
    }

    fn on_closed(&mut self, reason: CloseReason) {
        if let Some(on_closed) = self.on_closed.take() {
            on_closed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_preserves_order() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        tx.on_sample(TelemetrySample::new(1, 1));
        tx.on_sample(TelemetrySample::new(2, 2));
        tx.on_closed(CloseReason::RemoteClosed);

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Sample(TelemetrySample::new(1, 1)));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Sample(TelemetrySample::new(2, 2)));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Closed(CloseReason::RemoteClosed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_sink_ignores_dropped_receiver() {
        let (mut tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        drop(rx);
        tx.on_sample(TelemetrySample::new(1, 1));
        tx.on_closed(CloseReason::LocalStop);
    }

    #[test]
    fn fn_sink_closes_once() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(0));
        let (seen_cb, closes_cb) = (seen.clone(), closes.clone());
        let mut sink = FnSink::new(
            move |s| seen_cb.lock().unwrap().push(s),
            move |_| *closes_cb.lock().unwrap() += 1,
        );
        sink.on_sample(TelemetrySample::new(3, 4));
        sink.on_closed(CloseReason::RemoteClosed);
        sink.on_closed(CloseReason::RemoteClosed);
        assert_eq!(*seen.lock().unwrap(), vec![TelemetrySample::new(3, 4)]);
        assert_eq!(*closes.lock().unwrap(), 1);
    }
}
