//! Observable tunnel lifecycle

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Registering,
    Active { tunnel_url: String },
}

impl TunnelState {
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Active { .. })
    }

    pub fn tunnel_url(&self) -> Option<&str> {
        match self {
            TunnelState::Active { tunnel_url } => Some(tunnel_url),
            _ => None,
        }
    }
}

/// Publishes state transitions to any number of observers
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<TunnelState>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TunnelState::Disconnected);
        Self { tx }
    }

    pub fn set(&self, state: TunnelState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TunnelState {
        self.tx.borrow().clone()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the tunnel is active and return its public URL.
pub async fn wait_active(rx: &mut watch::Receiver<TunnelState>) -> Option<String> {
    let state = rx.wait_for(TunnelState::is_active).await.ok()?;
    state.tunnel_url().map(str::to_string)
}
