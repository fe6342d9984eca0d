use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative stop signal shared by every background loop
///
/// Cloning is cheap; all clones observe the same trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Ask every loop to stop after its current iteration
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once `trigger` has been called
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Err means the sender is gone, which also means stop
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
