use fieldsync_engine::LinkState;
use tokio::sync::watch;

/// Stand-in for the platform's network reachability callback.
pub struct NetworkSwitch {
    tx: watch::Sender<LinkState>,
}

impl NetworkSwitch {
    /// Starts with the link down.
    pub fn new() -> (Self, watch::Receiver<LinkState>) {
        let (tx, rx) = watch::channel(LinkState::Down);
        (Self { tx }, rx)
    }

    pub fn connect(&self) {
        self.tx.send_replace(LinkState::Up);
    }

    pub fn disconnect(&self) {
        self.tx.send_replace(LinkState::Down);
    }

    pub fn state(&self) -> LinkState {
        *self.tx.borrow()
    }
}
