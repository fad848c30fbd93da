//! Test Anything Protocol result reporting.
//!
//! Output is written line by line as outcomes arrive so a consumer can
//! follow progress. Program output captured during a test is held back and
//! replayed as `#` comments after the result line, never interleaved with
//! protocol lines.

use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, error};

use crate::error::{ErrorCategory, HarnessError, HarnessResult};
use crate::process::ProcessResult;

/// Final state of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    /// An assertion or expectation did not hold.
    Fail { kind: String, message: String },
    /// The test aborted on an unexpected error.
    Error { kind: String, message: String },
    Skip { reason: String },
}

impl Outcome {
    /// Classify a test's error.
    pub fn from_error(err: &HarnessError) -> Self {
        let kind = err.kind().to_string();
        let message = err.to_string();
        match err.category() {
            ErrorCategory::Failure => Self::Fail { kind, message },
            ErrorCategory::Error => Self::Error { kind, message },
            ErrorCategory::Skip => Self::Skip {
                reason: match err {
                    HarnessError::Skipped(reason) => reason.clone(),
                    other => other.to_string(),
                },
            },
        }
    }

    fn status(&self) -> Option<&'static str> {
        match self {
            Self::Pass => None,
            Self::Fail { .. } => Some("FAIL"),
            Self::Error { .. } => Some("ERROR"),
            Self::Skip { .. } => Some("SKIP"),
        }
    }
}

/// Tallies for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub planned: usize,
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn percent_passed(&self) -> f64 {
        if self.planned == 0 {
            return 0.0;
        }
        let denominator = self.planned.max(self.passed + self.failed + self.errored + self.skipped);
        100.0 * self.passed as f64 / denominator as f64
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.executed >= self.planned
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped. {:.2}% passed.",
            self.passed,
            self.failed + self.errored,
            self.skipped,
            self.percent_passed()
        )
    }
}

/// Writes the protocol stream to `out`.
pub struct TapReporter<W: Write> {
    out: W,
    summary: Summary,
}

impl<W: Write> TapReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            summary: Summary::default(),
        }
    }

    /// Emit the plan line.
    pub fn plan(&mut self, count: usize) -> io::Result<()> {
        self.summary.planned = count;
        writeln!(self.out, "1..{count}")?;
        self.out.flush()
    }

    /// Emit the result line for the next test, its diagnostic block, and
    /// any output captured while it ran.
    pub fn report(
        &mut self,
        description: &str,
        outcome: &Outcome,
        captured: &TestContext,
    ) -> io::Result<()> {
        self.summary.executed += 1;
        let n = self.summary.executed;

        match outcome {
            Outcome::Pass => {
                self.summary.passed += 1;
                writeln!(self.out, "ok {n} - {description}")?;
            }
            Outcome::Skip { reason } => {
                self.summary.skipped += 1;
                writeln!(self.out, "ok {n} - {description} # skip")?;
                self.diagnostic("SKIP", None, reason)?;
            }
            Outcome::Fail { kind, message } | Outcome::Error { kind, message } => {
                if matches!(outcome, Outcome::Fail { .. }) {
                    self.summary.failed += 1;
                } else {
                    self.summary.errored += 1;
                }
                writeln!(self.out, "not ok {n} - {description}")?;
                let status = outcome.status().unwrap_or("FAIL");
                self.diagnostic(status, Some(kind), message)?;
            }
        }

        self.comment_block(&captured.stdout)?;
        self.comment_block(&captured.stderr)?;
        self.out.flush()
    }

    fn diagnostic(&mut self, status: &str, kind: Option<&str>, message: &str) -> io::Result<()> {
        match kind {
            Some(kind) => writeln!(self.out, "# {status}: {kind}:")?,
            None => writeln!(self.out, "# {status}:")?,
        }
        let padding = " ".repeat(status.len() + 3);
        for line in message.lines() {
            writeln!(self.out, "#{padding}{}", line.replace("\\n", "\n# "))?;
        }
        Ok(())
    }

    fn comment_block(&mut self, text: &str) -> io::Result<()> {
        if !text.is_empty() {
            self.out.write_all(commentify(text).as_bytes())?;
        }
        Ok(())
    }

    /// Free-form diagnostic lines.
    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        for line in text.trim().lines() {
            writeln!(self.out, "# {}", line.trim())?;
        }
        Ok(())
    }

    /// Report plan mismatches and the summary line.
    pub fn finish(&mut self) -> io::Result<Summary> {
        let summary = &mut self.summary;
        if summary.executed < summary.planned {
            writeln!(
                self.out,
                "# Only {} tests, out of a planned {} were run.",
                summary.executed, summary.planned
            )?;
            summary.skipped += summary.planned - summary.executed;
        } else if summary.executed > summary.planned {
            writeln!(
                self.out,
                "# {} tests were run, but only {} were planned.",
                summary.executed, summary.planned
            )?;
        }
        writeln!(self.out, "# {summary}")?;
        self.out.flush()?;
        Ok(*summary)
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Prefix every line with `# ` (unless it already is a comment), expand
/// literal `\n` escapes into further comment lines and terminate the block
/// with a newline.
pub fn commentify(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.split_inclusive('\n') {
        let line = line.replace("\\n", "\n# ");
        if !line.starts_with('#') {
            out.push_str("# ");
        }
        out.push_str(&line);
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Output buffered on behalf of a running test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestContext {
    stdout: String,
    stderr: String,
}

impl TestContext {
    pub fn out(&mut self, text: impl AsRef<str>) {
        self.stdout.push_str(text.as_ref());
    }

    pub fn err(&mut self, text: impl AsRef<str>) {
        self.stderr.push_str(text.as_ref());
    }

    /// Keep a command's streams for the report.
    pub fn record(&mut self, result: &ProcessResult) {
        self.out(&result.stdout);
        if let Some(stderr) = &result.stderr {
            self.err(stderr);
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

type TestFn<'a> = Box<dyn FnOnce(&mut TestContext) -> HarnessResult<()> + 'a>;

/// Runs named test closures and reports each one.
#[derive(Default)]
pub struct TapRunner<'a> {
    tests: Vec<(String, TestFn<'a>)>,
}

impl<'a> TapRunner<'a> {
    pub fn new() -> Self {
        Self { tests: Vec::new() }
    }

    pub fn add(
        &mut self,
        name: impl Into<String>,
        test: impl FnOnce(&mut TestContext) -> HarnessResult<()> + 'a,
    ) -> &mut Self {
        self.tests.push((name.into(), Box::new(test)));
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Run every test in order. A panic is reported as an error; an
    /// unkillable process stops the run after its result line.
    pub fn run<W: Write>(self, out: W) -> io::Result<Summary> {
        let mut reporter = TapReporter::new(out);
        reporter.plan(self.tests.len())?;

        for (name, test) in self.tests {
            let mut ctx = TestContext::default();
            let result = panic::catch_unwind(AssertUnwindSafe(|| test(&mut ctx)));
            let (outcome, fatal) = match result {
                Ok(Ok(())) => (Outcome::Pass, false),
                Ok(Err(e)) => {
                    if let Some((stdout, stderr)) = e.partial_output() {
                        ctx.out(stdout);
                        ctx.err(stderr);
                    }
                    (Outcome::from_error(&e), e.is_fatal())
                }
                Err(payload) => (
                    Outcome::Error {
                        kind: "Panic".to_string(),
                        message: panic_message(payload.as_ref()),
                    },
                    false,
                ),
            };
            debug!(test = %name, ?outcome, "test finished");
            reporter.report(&name, &outcome, &ctx)?;
            if fatal {
                error!(test = %name, "aborting run after fatal supervision failure");
                break;
            }
        }

        reporter.finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}
