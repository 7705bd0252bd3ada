use tokio::sync::watch;

/// Source of the server-advertised upload budget in bytes per second.
///
/// Zero means unlimited.
pub trait BandwidthSource: Send + Sync {
    fn upload_budget(&self) -> u64;
    fn set_upload_budget(&self, bytes_per_sec: u64);
}

/// In-process budget that notifies subscribers on change.
#[derive(Debug)]
pub struct SharedBandwidth {
    tx: watch::Sender<u64>,
}

impl SharedBandwidth {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            tx: watch::Sender::new(bytes_per_sec),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for SharedBandwidth {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BandwidthSource for SharedBandwidth {
    fn upload_budget(&self) -> u64 {
        *self.tx.borrow()
    }

    fn set_upload_budget(&self, bytes_per_sec: u64) {
        self.tx.send_replace(bytes_per_sec);
    }
}
