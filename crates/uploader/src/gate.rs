use std::sync::{Arc, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::UploadError;

/// Admits one streamed transfer at a time.
///
/// [`TransferGate::global`] is shared by every uploader in the process.
#[derive(Debug, Clone)]
pub struct TransferGate {
    permits: Arc<Semaphore>,
}

/// Held for the duration of a transfer; dropping it reopens the gate.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
}

impl TransferGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn global() -> &'static TransferGate {
        static GATE: OnceLock<TransferGate> = OnceLock::new();
        GATE.get_or_init(TransferGate::new)
    }

    /// Fails with [`UploadError::TransferBusy`] while another permit is alive.
    pub fn try_acquire(&self) -> Result<TransferPermit, UploadError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| UploadError::TransferBusy)?;
        Ok(TransferPermit { _permit: permit })
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for TransferGate {
    fn default() -> Self {
        Self::new()
    }
}
