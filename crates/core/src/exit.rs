use crate::error::{Error, Result};
use tokio::sync::oneshot;

/// How a VM process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failed(String),
}

impl ExitStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Clean => Ok(()),
            Self::Failed(reason) => Err(Error::Exited(reason)),
        }
    }
}

/// Creates the write-once pair used to report a VM's exit.
///
/// The notifier is consumed by its single use, so a booted VM resolves its
/// signal at most once.
pub fn exit_channel() -> (ExitNotifier, ExitSignal) {
    let (tx, rx) = oneshot::channel();
    (ExitNotifier(tx), ExitSignal(rx))
}

#[derive(Debug)]
pub struct ExitNotifier(oneshot::Sender<ExitStatus>);

impl ExitNotifier {
    pub fn notify(self, status: ExitStatus) {
        // The receiving side may have been dropped by a caller that no longer
        // cares about the exit.
        let _ = self.0.send(status);
    }
}

/// Resolves once when the VM exits.
#[derive(Debug)]
pub struct ExitSignal(oneshot::Receiver<ExitStatus>);

impl ExitSignal {
    pub async fn wait(self) -> ExitStatus {
        match self.0.await {
            Ok(status) => status,
            Err(_) => ExitStatus::Failed("exit watcher went away without reporting".to_string()),
        }
    }
}
