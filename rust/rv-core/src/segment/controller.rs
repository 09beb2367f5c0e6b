// rust/rv-core/src/segment/controller.rs

//! Segment state machine and resume report.

use std::fmt;
use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::RvConfig;

const RUNNING: u8 = 0;
const TERMINATING: u8 = 1;
const FINISHED: u8 = 2;

/// What ended the segment early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSignal {
    /// Scheduler warning that the allocation is about to be reclaimed (SIGUSR1).
    Preempt,
    /// Scheduler asking the job to stop now (SIGTERM).
    Terminate,
    /// The workload itself exited with the resume code.
    Requested,
}

impl SegmentSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Preempt => "SIGUSR1",
            Self::Terminate => "SIGTERM",
            Self::Requested => "workload",
        }
    }
}

impl fmt::Display for SegmentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Completed,
    /// Stopped early; the job should be resubmitted with the carried-forward
    /// elapsed time.
    Interrupted,
}

/// Elapsed-time record written when a segment is interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    pub signal: SegmentSignal,
    pub segment_elapsed: Duration,
    pub prior_elapsed: Duration,
    pub total_elapsed: Duration,
    pub total_requested: Duration,
    pub exit_code: u8,
    pub interrupted_at: DateTime<Utc>,
}

fn whole_secs(d: Duration) -> String {
    format!("{:.0}s", d.as_secs_f64())
}

impl fmt::Display for SegmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment_interrupted signal={} segment_elapsed={} prior_elapsed={} total_elapsed={} total_requested={} exit_code={} interrupted_at={}",
            self.signal,
            whole_secs(self.segment_elapsed),
            whole_secs(self.prior_elapsed),
            whole_secs(self.total_elapsed),
            whole_secs(self.total_requested),
            self.exit_code,
            self.interrupted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

/// How the process should exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentExit {
    pub code: u8,
    /// Present only for interrupted segments.
    pub report: Option<SegmentReport>,
}

impl SegmentExit {
    pub fn outcome(&self) -> SegmentOutcome {
        if self.report.is_some() {
            SegmentOutcome::Interrupted
        } else {
            SegmentOutcome::Completed
        }
    }
}

impl From<SegmentExit> for ExitCode {
    fn from(exit: SegmentExit) -> Self {
        ExitCode::from(exit.code)
    }
}

struct Interruption {
    signal: SegmentSignal,
    segment_elapsed: Duration,
    at: DateTime<Utc>,
}

struct Shared {
    state: AtomicU8,
    interruption: Mutex<Option<Interruption>>,
    reported: AtomicBool,
    sink: Mutex<Box<dyn Write + Send>>,
    finished: CancellationToken,
}

/// Tracks one segment of a long job that may be preempted and resumed.
///
/// The segment moves from running to terminating at most once; the first
/// signal wins. Interruption only sets state and cancels the token; the main
/// loop observes it and calls [`SegmentController::finish`], which writes the
/// report and picks the exit code.
///
/// Cloning yields another handle to the same segment.
#[derive(Clone)]
pub struct SegmentController {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    segment_start: Instant,
    prior_elapsed: Duration,
    total_requested: Duration,
    resume_code: u8,
    token: CancellationToken,
}

impl SegmentController {
    /// Starts a segment now. `sink` receives the resume report.
    pub fn new(
        clock: Arc<dyn Clock>,
        prior_elapsed: Duration,
        total_requested: Duration,
        resume_code: u8,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        let segment_start = clock.now();
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(RUNNING),
                interruption: Mutex::new(None),
                reported: AtomicBool::new(false),
                sink: Mutex::new(sink),
                finished: CancellationToken::new(),
            }),
            clock,
            segment_start,
            prior_elapsed,
            total_requested,
            resume_code,
            token: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &RvConfig, clock: Arc<dyn Clock>, sink: Box<dyn Write + Send>) -> Self {
        Self::new(
            clock,
            config.job.prior_elapsed(),
            config.job.total_requested(),
            config.segment.resume_exit_code,
            sink,
        )
    }

    pub fn resume_code(&self) -> u8 {
        self.resume_code
    }

    pub fn prior_elapsed(&self) -> Duration {
        self.prior_elapsed
    }

    pub fn total_requested(&self) -> Duration {
        self.total_requested
    }

    pub fn segment_elapsed(&self) -> Duration {
        self.clock.since(self.segment_start)
    }

    pub fn total_elapsed(&self) -> Duration {
        self.prior_elapsed + self.segment_elapsed()
    }

    /// Run time still owed to the job, as of now.
    pub fn remaining(&self) -> Duration {
        self.total_requested.saturating_sub(self.total_elapsed())
    }

    /// Token cancelled when the segment is interrupted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == TERMINATING
    }

    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.shared.finished.clone()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Moves the segment to terminating.
    ///
    /// Safe to call from any thread at any time. Returns `false` if the
    /// segment was already interrupted or finished.
    pub fn interrupt(&self, signal: SegmentSignal) -> bool {
        // held across the transition so `finish` never sees the terminating
        // state without the interruption details
        let mut slot = self
            .shared
            .interruption
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if self
            .shared
            .state
            .compare_exchange(RUNNING, TERMINATING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(%signal, "segment already stopping, ignoring signal");
            return false;
        }

        let segment_elapsed = self.segment_elapsed();
        *slot = Some(Interruption {
            signal,
            segment_elapsed,
            at: Utc::now(),
        });
        drop(slot);

        tracing::warn!(
            %signal,
            segment_elapsed_secs = segment_elapsed.as_secs(),
            total_elapsed_secs = (self.prior_elapsed + segment_elapsed).as_secs(),
            "segment interrupted"
        );
        self.token.cancel();
        true
    }

    /// The resume report, if the segment was interrupted.
    pub fn report(&self) -> Option<SegmentReport> {
        let slot = self
            .shared
            .interruption
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        slot.as_ref().map(|i| SegmentReport {
            signal: i.signal,
            segment_elapsed: i.segment_elapsed,
            prior_elapsed: self.prior_elapsed,
            total_elapsed: self.prior_elapsed + i.segment_elapsed,
            total_requested: self.total_requested,
            exit_code: self.resume_code,
            interrupted_at: i.at,
        })
    }

    /// Writes the resume report to the sink, at most once per segment.
    ///
    /// Write failures are logged and otherwise ignored.
    pub fn emit_report(&self) -> Option<SegmentReport> {
        let report = self.report()?;
        if self.shared.reported.swap(true, Ordering::AcqRel) {
            return Some(report);
        }

        let mut sink = self.shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(sink, "{report}").and_then(|()| sink.flush()) {
            tracing::warn!(error = %e, "failed to write segment report");
        }
        Some(report)
    }

    /// Ends the segment and decides the exit code.
    ///
    /// Completion yields 0 and no report. An interrupted segment yields the
    /// resume code whether or not the report could be written.
    pub fn finish(&self) -> SegmentExit {
        let completed = self
            .shared
            .state
            .compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let exit = if completed {
            tracing::info!(
                segment_elapsed_secs = self.segment_elapsed().as_secs(),
                total_elapsed_secs = self.total_elapsed().as_secs(),
                "segment completed"
            );
            SegmentExit {
                code: 0,
                report: None,
            }
        } else {
            SegmentExit {
                code: self.resume_code,
                report: self.emit_report(),
            }
        };

        self.shared.finished.cancel();
        exit
    }
}
