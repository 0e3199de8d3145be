//! Result envelope: the one record every execution path returns.
//!
//! All classification and truncation happens here, so a caller sees the
//! same shape whether a submission was rejected up front, failed to compile,
//! crashed, blew its budget, or died inside the container runtime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::Captured;

/// Appended to a stream that was cut at its byte cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Exit code reported when the program did not exit on its own.
pub const ABNORMAL_EXIT: i32 = -1;

/// Stage in which an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    None,
    Compile,
    Run,
    Sandbox,
}

/// Short machine-readable failure tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Timeout,
    MemoryExceeded,
    CompileError,
    RuntimeError,
    ImageMissing,
    Internal,
    Cancelled,
    UnknownLanguage,
    EmptySource,
    InputTooLarge,
    QueueFull,
    DuplicateExecutionId,
}

impl Reason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::CompileError => "compile_error",
            Self::RuntimeError => "runtime_error",
            Self::ImageMissing => "image_missing",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
            Self::UnknownLanguage => "unknown_language",
            Self::EmptySource => "empty_source",
            Self::InputTooLarge => "input_too_large",
            Self::QueueFull => "queue_full",
            Self::DuplicateExecutionId => "duplicate_execution_id",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical response record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub execution_id: String,
    pub language_id: String,
    /// True iff the program completed with exit code 0.
    pub ok: bool,
    pub phase_at_failure: FailurePhase,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub wall_time_millis: u64,
    /// Best effort; 0 when the runtime reported nothing.
    pub peak_memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<Reason>,
}

impl ResultEnvelope {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.reason, Some(Reason::Cancelled))
    }
}

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// Raw observations from one sandbox run, before classification.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    pub oom_killed: bool,
    /// The toolchain has a compile step.
    pub has_compile_step: bool,
    /// The compile step finished successfully.
    pub compiled: bool,
    pub stdout: Captured,
    pub stderr: Captured,
    pub wall_time: Duration,
    pub peak_memory_bytes: u64,
}

impl RunOutcome {
    const fn failing_phase(&self) -> FailurePhase {
        if self.has_compile_step && !self.compiled {
            FailurePhase::Compile
        } else {
            FailurePhase::Run
        }
    }

    /// `(ok, phase_at_failure, reason, exit_code)`.
    fn classify(&self) -> (bool, FailurePhase, Option<Reason>, i32) {
        match self.termination {
            Termination::Cancelled => {
                (false, FailurePhase::Run, Some(Reason::Cancelled), ABNORMAL_EXIT)
            }
            Termination::TimedOut => (false, FailurePhase::Run, Some(Reason::Timeout), ABNORMAL_EXIT),
            Termination::Exited(0) => (true, FailurePhase::None, None, 0),
            Termination::Exited(_) if self.oom_killed => (
                false,
                self.failing_phase(),
                Some(Reason::MemoryExceeded),
                ABNORMAL_EXIT,
            ),
            Termination::Exited(code) => match self.failing_phase() {
                FailurePhase::Compile => (false, FailurePhase::Compile, Some(Reason::CompileError), code),
                _ => (false, FailurePhase::Run, Some(Reason::RuntimeError), code),
            },
        }
    }
}

/// Per-stream truncation ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputCaps {
    pub stdout: usize,
    pub stderr: usize,
}

/// Builds envelopes for one execution.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    execution_id: String,
    language_id: String,
    caps: OutputCaps,
}

impl EnvelopeBuilder {
    pub fn new(execution_id: impl Into<String>, language_id: impl Into<String>, caps: OutputCaps) -> Self {
        Self {
            execution_id: execution_id.into(),
            language_id: language_id.into(),
            caps,
        }
    }

    /// Submission refused before any sandbox existed.
    pub fn rejected(&self, reason: Reason, message: &str) -> ResultEnvelope {
        self.sandbox_failure(reason, message, Duration::ZERO)
    }

    /// Failure inside the engine or the container runtime.
    pub fn sandbox_failure(&self, reason: Reason, message: &str, wall_time: Duration) -> ResultEnvelope {
        self.envelope(
            false,
            FailurePhase::Sandbox,
            Some(reason),
            ABNORMAL_EXIT,
            String::new(),
            cap_output(message.as_bytes(), false, self.caps.stderr),
            wall_time,
            0,
        )
    }

    /// Compile failure detected before launch (no compiler ran).
    pub fn compile_rejected(&self, message: &str, wall_time: Duration) -> ResultEnvelope {
        self.envelope(
            false,
            FailurePhase::Compile,
            Some(Reason::CompileError),
            ABNORMAL_EXIT,
            String::new(),
            cap_output(message.as_bytes(), false, self.caps.stderr),
            wall_time,
            0,
        )
    }

    /// Cancelled before the sandbox was launched.
    pub fn cancelled(&self, wall_time: Duration) -> ResultEnvelope {
        self.envelope(
            false,
            FailurePhase::Run,
            Some(Reason::Cancelled),
            ABNORMAL_EXIT,
            String::new(),
            String::new(),
            wall_time,
            0,
        )
    }

    /// Classify a finished run.
    pub fn from_run(&self, outcome: &RunOutcome) -> ResultEnvelope {
        let (ok, phase, reason, exit_code) = outcome.classify();
        self.envelope(
            ok,
            phase,
            reason,
            exit_code,
            cap_output(&outcome.stdout.bytes, outcome.stdout.overflowed, self.caps.stdout),
            cap_output(&outcome.stderr.bytes, outcome.stderr.overflowed, self.caps.stderr),
            outcome.wall_time,
            outcome.peak_memory_bytes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn envelope(
        &self,
        ok: bool,
        phase_at_failure: FailurePhase,
        reason: Option<Reason>,
        exit_code: i32,
        stdout: String,
        stderr: String,
        wall_time: Duration,
        peak_memory_bytes: u64,
    ) -> ResultEnvelope {
        ResultEnvelope {
            execution_id: self.execution_id.clone(),
            language_id: self.language_id.clone(),
            ok,
            phase_at_failure,
            stdout,
            stderr,
            exit_code,
            wall_time_millis: u64::try_from(wall_time.as_millis()).unwrap_or(u64::MAX),
            peak_memory_bytes,
            reason,
        }
    }
}

/// Decode captured bytes and fit them into `cap` bytes.
///
/// When the stream overflowed (or lossy decoding grew it past the cap) the
/// text is cut on a char boundary and [`TRUNCATION_MARKER`] appended; the
/// marker counts against the cap.
pub fn cap_output(raw: &[u8], overflowed: bool, cap: usize) -> String {
    let mut text = String::from_utf8_lossy(raw).into_owned();
    if !overflowed && text.len() <= cap {
        return text;
    }
    if cap < TRUNCATION_MARKER.len() {
        text.truncate(floor_char_boundary(&text, cap));
        return text;
    }
    text.truncate(floor_char_boundary(&text, cap - TRUNCATION_MARKER.len()));
    text.push_str(TRUNCATION_MARKER);
    text
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}
