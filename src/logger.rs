//! Per-call diagnostic logger (spec §6, §9 "Global optimization log buffer").
//!
//! The source this system was distilled from kept a process-wide mutable log
//! buffer. Here the logger is owned by a single [`crate::pipeline::optimize`]
//! call and reset at its start, per the redesign note in spec §9. Every
//! module also emits ordinary `tracing` events; the [`Logger`] is the stable,
//! tag-oriented surface a caller is meant to read back out of
//! [`crate::pipeline::OptimizeResult`]-adjacent plumbing, while `tracing` is
//! the free-form operator stream.

/// Tags used to categorize logger lines, matching spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Init,
    Stage1,
    Solve,
    Outliers,
    Rerun,
    Scale,
    Warn,
}

impl Tag {
    fn as_str(self) -> &'static str {
        match self {
            Tag::Init => "Init",
            Tag::Stage1 => "Stage1",
            Tag::Solve => "Solve",
            Tag::Outliers => "Outliers",
            Tag::Rerun => "Rerun",
            Tag::Scale => "Scale",
            Tag::Warn => "WARN",
        }
    }
}

/// A sequence of tagged diagnostic lines collected during one `optimize()` call.
///
/// Content beyond the tag is unspecified and must not be parsed by callers
/// (spec §6); it exists for human-facing diagnostics.
#[derive(Debug, Default, Clone)]
pub struct Logger {
    verbose: bool,
    lines: Vec<(Tag, String)>,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            lines: Vec::new(),
        }
    }

    pub fn log(&mut self, tag: Tag, msg: impl Into<String>) {
        let msg = msg.into();
        match tag {
            Tag::Warn => tracing::warn!("{}", msg),
            _ => tracing::debug!(tag = tag.as_str(), "{}", msg),
        }
        if self.verbose || matches!(tag, Tag::Warn) {
            self.lines.push((tag, msg));
        }
    }

    /// Drain the collected lines as `"[Tag] message"` strings.
    pub fn drain(&mut self) -> Vec<String> {
        self.lines
            .drain(..)
            .map(|(tag, msg)| format!("[{}] {}", tag.as_str(), msg))
            .collect()
    }

    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.lines
            .iter()
            .map(|(tag, msg)| format!("[{}] {}", tag.as_str(), msg))
    }
}
