use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot cooperative shutdown signal shared by the dispatcher, workers and
/// background threads.
///
/// Observers either poll [`Shutdown::is_set`] at checkpoints or block on
/// [`Shutdown::channel`] inside a `select!`. Triggering drops the channel's
/// only sender, which wakes every blocked receiver at once.
pub struct Shutdown {
    flag: AtomicBool,
    sender: parking_lot::Mutex<Option<crossbeam_channel::Sender<()>>>,
    receiver: crossbeam_channel::Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            flag: AtomicBool::new(false),
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Signals shutdown. Safe to call more than once.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.sender.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Channel that becomes ready (disconnected) once shutdown is triggered.
    pub fn channel(&self) -> &crossbeam_channel::Receiver<()> {
        &self.receiver
    }
}

/// Waits for a child process to exit, polling up to `timeout`. Returns `None`
/// if the process is still running when the timeout expires.
pub fn wait_for_process_timeout(
    handle: &mut std::process::Child,
    timeout: std::time::Duration,
) -> anyhow::Result<Option<std::process::ExitStatus>> {
    let mut remaining_time = timeout;
    loop {
        const SLEEP_TIME: std::time::Duration = std::time::Duration::from_millis(10);
        match handle.try_wait()? {
            Some(exit) => return Ok(Some(exit)),
            None => std::thread::sleep(SLEEP_TIME),
        }
        remaining_time = match remaining_time.checked_sub(SLEEP_TIME) {
            Some(timeout) => timeout,
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_starts_clear() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_set());
        assert!(shutdown.channel().try_recv().is_err());
    }

    #[test]
    fn trigger_sets_flag_and_disconnects_channel() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_set());
        // A disconnected channel wakes blocked receivers immediately.
        assert_eq!(
            shutdown.channel().recv(),
            Err(crossbeam_channel::RecvError)
        );
    }

    #[test]
    fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_set());
    }

    #[test]
    fn wait_returns_exit_status_for_fast_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let status = wait_for_process_timeout(&mut child, std::time::Duration::from_secs(5))
            .unwrap()
            .expect("process should have exited");
        assert!(status.success());
    }

    #[test]
    fn wait_times_out_on_long_process() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let status =
            wait_for_process_timeout(&mut child, std::time::Duration::from_millis(50)).unwrap();
        assert!(status.is_none());
        let _ = child.kill();
        let _ = child.wait();
    }
}
