use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// A subprocess owned by a node, with a monitor task whose only job is to
/// await its exit and invoke the termination callback.
pub struct SupervisedChild {
    id: Option<u32>,
    alive: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    kill_tx: mpsc::Sender<()>,
}

impl SupervisedChild {
    pub fn spawn(
        mut child: tokio::process::Child,
        on_exit: impl FnOnce(Option<i32>) + Send + 'static,
    ) -> Self {
        let id = child.id();
        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        let flag = alive.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            flag.store(false, Ordering::Relaxed);
            let code = status.ok().and_then(|s| s.code());
            on_exit(code);
            let _ = exit_tx.send(Some(code));
        });

        Self {
            id,
            alive,
            exit_rx,
            kill_tx,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Asks the process to exit (SIGTERM on unix), waits up to `grace`, then
    /// kills it outright.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        #[cfg(unix)]
        if let Some(id) = self.id {
            let pid = nix::unistd::Pid::from_raw(id as i32);
            // The process may have exited since the last check.
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.kill_tx.send(()).await;
        }

        let timed_out = {
            tokio::time::timeout(grace, self.exit_rx.wait_for(|status| status.is_some()))
                .await
                .is_err()
        };
        if timed_out {
            tracing::warn!(pid = ?self.id, "process did not exit in time, killing it");
            self.kill().await;
        }
    }

    pub async fn kill(&mut self) {
        if !self.is_running() {
            return;
        }
        let _ = self.kill_tx.send(()).await;
        let _ = self.exit_rx.wait_for(|status| status.is_some()).await;
    }

    /// Exit code, once the process has terminated.
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }
}
