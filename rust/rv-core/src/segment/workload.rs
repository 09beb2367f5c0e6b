// rust/rv-core/src/segment/workload.rs

//! Work run inside a segment.

use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use crate::config::SegmentConfig;
use crate::error::{Result, RvError};

use super::controller::{SegmentController, SegmentExit, SegmentSignal};

/// Built-in workload: stays busy until the job's requested run time is used
/// up, logging progress as it goes.
#[derive(Debug, Clone)]
pub struct IdleWorkload {
    progress_interval: Duration,
    check_interval: Duration,
}

impl IdleWorkload {
    pub fn new(progress_interval: Duration, check_interval: Duration) -> Self {
        Self {
            progress_interval,
            check_interval,
        }
    }

    pub fn from_config(config: &SegmentConfig) -> Self {
        Self::new(config.progress_interval(), config.check_interval())
    }

    /// Runs until `total_requested - prior_elapsed` has passed in this
    /// segment or the segment is interrupted.
    pub fn run(&self, segment: &SegmentController) -> SegmentExit {
        let token = segment.cancellation_token();
        let target = segment
            .total_requested()
            .saturating_sub(segment.prior_elapsed());
        let mut next_progress = Duration::ZERO;

        tracing::info!(
            prior_elapsed_secs = segment.prior_elapsed().as_secs(),
            total_requested_secs = segment.total_requested().as_secs(),
            "starting segment"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let elapsed = segment.segment_elapsed();
            if elapsed >= target {
                break;
            }

            if !self.progress_interval.is_zero() && elapsed >= next_progress {
                tracing::info!(
                    segment_elapsed_secs = elapsed.as_secs(),
                    total_elapsed_secs = (segment.prior_elapsed() + elapsed).as_secs(),
                    "working"
                );
                next_progress = elapsed + self.progress_interval;
            }

            let step = self
                .check_interval
                .min(target - elapsed)
                .max(Duration::from_millis(1));
            segment.clock().sleep(step);
        }

        segment.finish()
    }
}

/// A command run as a child process for the duration of the segment.
#[derive(Debug, Clone)]
pub struct ChildWorkload {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    check_interval: Duration,
    kill_after: Duration,
    resume_status: Option<u8>,
}

impl ChildWorkload {
    /// # Errors
    ///
    /// Returns an error if `command` is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RvError::workload("no command given"))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
            check_interval: Duration::from_millis(250),
            kill_after: Duration::from_secs(10),
            resume_status: None,
        })
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// How long an interrupted child may keep running before it is killed.
    #[must_use]
    pub fn kill_after(mut self, after: Duration) -> Self {
        self.kill_after = after;
        self
    }

    /// Exit status with which the child itself asks for resubmission.
    /// Unset by default, so every non-zero exit is a failure.
    #[must_use]
    pub fn resume_status(mut self, status: Option<u8>) -> Self {
        self.resume_status = status;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the child under `segment`.
    ///
    /// The child sees `RV_TOTAL_ELAPSED` and `RV_TOTAL_REQUESTED` for this
    /// segment. Exiting with the opted-in resume status counts as an
    /// interrupted segment; any other non-zero exit is a failure unless the
    /// segment was already interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned or polled, or exits
    /// with a failure status.
    pub fn run(&self, segment: &SegmentController) -> Result<SegmentExit> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("RV_TOTAL_ELAPSED", segment.prior_elapsed().as_secs().to_string())
            .env("RV_TOTAL_REQUESTED", segment.total_requested().as_secs().to_string());
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            RvError::workload_with_source(format!("failed to spawn '{}'", self.program), e)
        })?;
        tracing::info!(program = %self.program, pid = child.id(), "workload started");

        let token = segment.cancellation_token();
        loop {
            let polled = child
                .try_wait()
                .map_err(|e| RvError::workload_with_source("failed to poll workload", e))?;
            if let Some(status) = polled {
                return self.on_exit(segment, status);
            }

            if token.is_cancelled() {
                return self.stop(segment, child);
            }

            segment.clock().sleep(self.check_interval);
        }
    }

    fn on_exit(&self, segment: &SegmentController, status: ExitStatus) -> Result<SegmentExit> {
        tracing::info!(program = %self.program, %status, "workload exited");

        if status.success() {
            return Ok(segment.finish());
        }
        if self
            .resume_status
            .is_some_and(|code| status.code() == Some(i32::from(code)))
        {
            segment.interrupt(SegmentSignal::Requested);
            return Ok(segment.finish());
        }
        if segment.is_interrupted() {
            // the scheduler signal usually reaches the child as well
            return Ok(segment.finish());
        }

        Err(RvError::workload(format!(
            "'{}' failed with {status}",
            self.program
        )))
    }

    fn stop(&self, segment: &SegmentController, mut child: Child) -> Result<SegmentExit> {
        let clock = segment.clock();
        let start = clock.now();

        while clock.since(start) < self.kill_after {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(program = %self.program, %status, "workload stopped");
                    return Ok(segment.finish());
                }
                Ok(None) => clock.sleep(self.check_interval.min(self.kill_after)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll interrupted workload");
                    break;
                }
            }
        }

        tracing::warn!(
            program = %self.program,
            kill_after_secs = self.kill_after.as_secs_f64(),
            "workload still running after interruption, killing"
        );
        if let Err(e) = child.kill() {
            tracing::warn!(error = %e, "failed to kill workload");
        }
        if let Err(e) = child.wait() {
            tracing::warn!(error = %e, "failed to reap workload");
        }
        Ok(segment.finish())
    }
}
