/// Connection liveness state machine
///
/// One monitor per process. It is the single writer of the shared
/// `ConnectionState`; every other component reads it through a
/// `ConnectionWatch`.
use crate::model::ConnectionState;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LIVENESS_UNKNOWN: u8 = 0;
const LIVENESS_DOWN: u8 = 1;
const LIVENESS_UP: u8 = 2;

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    Liveness(bool),
    /// Explicit adapter-level cancellation (e.g. authorization revoked)
    Cancelled,
    /// Consumer asked to leave `Error`
    Resubscribe,
}

/// Pure transition function
pub fn next_state(current: ConnectionState, input: ConnectionInput) -> ConnectionState {
    use ConnectionInput::*;
    use ConnectionState::*;

    match (current, input) {
        (_, Cancelled) => Error,
        (Error, Resubscribe) => Connecting,
        (state, Resubscribe) => state,
        // Error is only left through Resubscribe
        (Error, Liveness(_)) => Error,
        (_, Liveness(true)) => Connected,
        (Connecting, Liveness(false)) => Connecting,
        (Connected, Liveness(false)) | (Disconnected, Liveness(false)) => Disconnected,
    }
}

pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
    last_liveness: AtomicU8,
}

impl ConnectionMonitor {
    /// Create a monitor in `Connecting`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Connecting);
        Self {
            tx,
            last_liveness: AtomicU8::new(LIVENESS_UNKNOWN),
        }
    }

    /// Read-only handle for other components
    pub fn watch(&self) -> ConnectionWatch {
        ConnectionWatch {
            rx: self.tx.subscribe(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Feed one liveness sample into the state machine
    pub fn report_liveness(&self, alive: bool) -> ConnectionState {
        self.last_liveness.store(
            if alive { LIVENESS_UP } else { LIVENESS_DOWN },
            Ordering::SeqCst,
        );
        self.apply(ConnectionInput::Liveness(alive))
    }

    /// Move to the terminal `Error` state
    pub fn cancel(&self, reason: &str) -> ConnectionState {
        warn!("Connection cancelled: {}", reason);
        self.apply(ConnectionInput::Cancelled)
    }

    /// Leave `Error`. The last known liveness sample is re-applied so a
    /// channel that is already up does not wait for the next sample.
    pub fn resubscribe(&self) -> ConnectionState {
        let state = self.apply(ConnectionInput::Resubscribe);
        match self.last_liveness.load(Ordering::SeqCst) {
            LIVENESS_UP => self.apply(ConnectionInput::Liveness(true)),
            LIVENESS_DOWN => self.apply(ConnectionInput::Liveness(false)),
            _ => state,
        }
    }

    fn apply(&self, input: ConnectionInput) -> ConnectionState {
        let mut next = ConnectionState::Connecting;
        self.tx.send_if_modified(|current| {
            next = next_state(*current, input);
            if next == *current {
                debug!("Connection input {:?} leaves state {:?}", input, next);
                return false;
            }
            info!("Connection {:?} -> {:?}", current, next);
            *current = next;
            true
        });
        next
    }

    /// Drive the monitor from a liveness source until it ends
    pub fn spawn_liveness<S>(self: &Arc<Self>, liveness: S) -> JoinHandle<()>
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut liveness = Box::pin(liveness);
            while let Some(alive) = liveness.next().await {
                monitor.report_liveness(alive);
            }
            debug!("Liveness source ended");
        })
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the connection state
#[derive(Clone)]
pub struct ConnectionWatch {
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionWatch {
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Wait for the next transition. `None` once the monitor is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Current state followed by every transition
    pub fn stream(&self) -> BoxStream<'static, ConnectionState> {
        let mut rx = self.rx.clone();
        let first = *rx.borrow_and_update();
        stream::once(async move { first })
            .chain(stream::unfold(rx, |mut rx| async move {
                rx.changed().await.ok()?;
                let state = *rx.borrow_and_update();
                Some((state, rx))
            }))
            .boxed()
    }
}
