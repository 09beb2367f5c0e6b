// rust/rv-core/src/segment/signals.rs

//! Scheduler signal delivery.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RvError};

use super::controller::{SegmentController, SegmentSignal};

/// Background thread that turns SIGUSR1/SIGTERM into segment interruption.
///
/// The handler work happens on an ordinary thread, not in signal context:
/// it interrupts the controller and then waits for the main loop to call
/// `finish`. If that does not happen within the grace period the report is
/// written and the process exits with the resume code.
pub struct SignalWatcher {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Registers the handlers and starts watching.
    ///
    /// Returns only once both handlers are registered, so a signal sent after
    /// this call is never lost to the default disposition.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher thread or its runtime cannot start, or
    /// a handler cannot be registered.
    pub fn install(controller: SegmentController, grace: Duration) -> Result<Self> {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let handle = thread::Builder::new()
            .name("rv-signals".to_string())
            .spawn({
                let stop = stop.clone();
                move || watch(controller, grace, stop, ready_tx)
            })
            .map_err(|e| RvError::signal_with_source("failed to spawn signal watcher", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(RvError::signal("signal watcher exited during start-up"))
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watch(
    controller: SegmentController,
    grace: Duration,
    stop: CancellationToken,
    ready: mpsc::SyncSender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(RvError::signal_with_source(
                "failed to build signal runtime",
                e,
            )));
            return;
        }
    };

    runtime.block_on(async move {
        let registered = signal(SignalKind::user_defined1())
            .and_then(|usr1| signal(SignalKind::terminate()).map(|term| (usr1, term)));
        let (mut preempt, mut terminate) = match registered {
            Ok(streams) => streams,
            Err(e) => {
                let _ = ready.send(Err(RvError::signal_with_source(
                    "failed to register SIGUSR1/SIGTERM handlers",
                    e,
                )));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        tracing::debug!("signal watcher ready");

        let finished = controller.finished_token();
        let received = tokio::select! {
            _ = preempt.recv() => SegmentSignal::Preempt,
            _ = terminate.recv() => SegmentSignal::Terminate,
            _ = finished.cancelled() => return,
            _ = stop.cancelled() => return,
        };

        if !controller.interrupt(received) {
            return;
        }

        tokio::select! {
            _ = finished.cancelled() => {}
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(grace) => {
                tracing::error!(
                    grace_secs = grace.as_secs(),
                    "main loop did not stop within the grace period, forcing resume exit"
                );
                controller.emit_report();
                std::process::exit(i32::from(controller.resume_code()));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::io;
    use std::process::Command;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Instant;

    // signals are process-wide: every installed watcher sees every delivery
    static SIGNALS: Mutex<()> = Mutex::new(());

    fn exclusive_signals() -> MutexGuard<'static, ()> {
        SIGNALS.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_to_self(signal: &str) {
        let status = Command::new("kill")
            .args([signal, &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn wait_cancelled(token: &CancellationToken) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_sigusr1_interrupts_segment() {
        let _signals = exclusive_signals();
        let controller = SegmentController::new(
            Arc::new(SystemClock),
            Duration::from_secs(300),
            Duration::from_secs(600),
            1,
            Box::new(io::sink()),
        );
        let token = controller.cancellation_token();
        let watcher = SignalWatcher::install(controller.clone(), Duration::from_secs(60)).unwrap();

        send_to_self("-USR1");
        wait_cancelled(&token);

        assert!(controller.is_interrupted());
        let exit = controller.finish();
        assert_eq!(exit.code, 1);
        let report = exit.report.unwrap();
        assert_eq!(report.signal, SegmentSignal::Preempt);
        assert!(report.total_elapsed >= Duration::from_secs(300));
        assert!(report.segment_elapsed < Duration::from_secs(10));

        drop(watcher);
    }

    #[test]
    fn test_sigterm_reports_elapsed_at_delivery() {
        let _signals = exclusive_signals();
        let controller = SegmentController::new(
            Arc::new(SystemClock),
            Duration::from_secs(300),
            Duration::from_secs(600),
            1,
            Box::new(io::sink()),
        );
        let token = controller.cancellation_token();
        let watcher = SignalWatcher::install(controller.clone(), Duration::from_secs(60)).unwrap();

        thread::sleep(Duration::from_secs(1));
        send_to_self("-TERM");
        wait_cancelled(&token);

        let exit = controller.finish();
        assert_eq!(exit.code, 1);
        let report = exit.report.unwrap();
        assert_eq!(report.signal, SegmentSignal::Terminate);
        assert!(report.segment_elapsed >= Duration::from_millis(500));
        assert!(report.segment_elapsed <= Duration::from_millis(1500));
        assert_eq!(report.total_elapsed, Duration::from_secs(300) + report.segment_elapsed);

        drop(watcher);
    }

    #[test]
    fn test_drop_stops_idle_watcher() {
        let _signals = exclusive_signals();
        let controller = SegmentController::new(
            Arc::new(SystemClock),
            Duration::ZERO,
            Duration::from_secs(1),
            1,
            Box::new(io::sink()),
        );

        let watcher = SignalWatcher::install(controller, Duration::from_secs(60)).unwrap();
        let started = Instant::now();
        drop(watcher);

        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
