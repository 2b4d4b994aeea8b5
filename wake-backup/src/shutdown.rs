//! SIGINT / SIGTERM handling.
//!
//! [`Signals::install`] runs before anything else in `main`, so a signal
//! that arrives while settings are still being validated is queued instead
//! of killing the process. The controller races its stages against
//! [`Signals::wait`]; whichever finishes first wins and cleanup runs either way.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

/// Installed SIGINT and SIGTERM streams.
///
/// A handler that cannot be installed never fires.
pub struct Signals {
    interrupt: Option<Signal>,
    terminate: Option<Signal>,
}

impl Signals {
    /// Register both handlers now.
    pub fn install() -> Self {
        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    /// Resolve with the signal name once SIGINT or SIGTERM arrives.
    pub async fn wait(mut self) -> String {
        let name = tokio::select! {
            _ = next(&mut self.interrupt) => "SIGINT",
            _ = next(&mut self.terminate) => "SIGTERM",
        };
        info!("Received {}, cleaning up before exit", name);
        name.to_string()
    }
}

fn listen(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to install {} handler: {}", name, e);
            None
        }
    }
}

async fn next(stream: &mut Option<Signal>) {
    if let Some(stream) = stream {
        if stream.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal as Sig};
    use nix::unistd::Pid;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let signals = Signals::install();

        // delivered before anything polls the handlers
        kill(Pid::from_raw(std::process::id() as i32), Sig::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let name = tokio::time::timeout(Duration::from_secs(5), signals.wait())
            .await
            .unwrap();
        assert_eq!(name, "SIGTERM");
    }
}
