// rust/rv-core/src/segment/mod.rs

//! Segmented execution for jobs longer than one scheduler allocation.
//!
//! A segment runs until its work completes (exit 0) or the scheduler signals
//! that the allocation is ending. On a signal the controller records how far
//! the job got, writes a `total_elapsed=...` report and exits with the resume
//! code, which tells the resubmission layer to requeue the job with the
//! carried-forward elapsed time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rv_core::clock::SystemClock;
//! use rv_core::segment::{IdleWorkload, SegmentController, SignalWatcher};
//!
//! let segment = SegmentController::new(
//!     Arc::new(SystemClock),
//!     Duration::from_secs(300),
//!     Duration::from_secs(600),
//!     1,
//!     Box::new(std::io::stdout()),
//! );
//! let _watcher = SignalWatcher::install(segment.clone(), Duration::from_secs(30)).unwrap();
//!
//! let exit = IdleWorkload::new(Duration::from_secs(60), Duration::from_millis(250)).run(&segment);
//! std::process::exit(i32::from(exit.code));
//! ```

mod controller;
mod signals;
mod workload;

pub use controller::{SegmentController, SegmentExit, SegmentOutcome, SegmentReport, SegmentSignal};
pub use signals::SignalWatcher;
pub use workload::{ChildWorkload, IdleWorkload};
