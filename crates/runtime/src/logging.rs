//! logging

use std::fmt;

/// Severity levels, ordered least to most severe, mirroring the levels named
/// in the external log sink contract. Mapped onto [`tracing::Level`] at the
/// call site since tracing only has five levels against our seven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Finest,
    Finer,
    Fine,
    Config,
    Info,
    Warning,
    Severe,
}

impl Severity {
    fn tracing_level(self) -> tracing::Level {
        match self {
            Severity::Finest | Severity::Finer => tracing::Level::TRACE,
            Severity::Fine => tracing::Level::DEBUG,
            Severity::Config | Severity::Info => tracing::Level::INFO,
            Severity::Warning => tracing::Level::WARN,
            Severity::Severe => tracing::Level::ERROR,
        }
    }
}

/// A named logger bound to a `tracing` target, the way `getLogger(id)`
/// resolves a named sink against the external logging contract.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    target: &'static str,
}

impl Logger {
    pub const fn new(target: &'static str) -> Self {
        Self { target }
    }

    pub fn log(&self, severity: Severity, message: impl fmt::Display) {
        match severity.tracing_level() {
            tracing::Level::TRACE => tracing::trace!(target: "reactor", logger = self.target, "{message}"),
            tracing::Level::DEBUG => tracing::debug!(target: "reactor", logger = self.target, "{message}"),
            tracing::Level::INFO => tracing::info!(target: "reactor", logger = self.target, "{message}"),
            tracing::Level::WARN => tracing::warn!(target: "reactor", logger = self.target, "{message}"),
            tracing::Level::ERROR => tracing::error!(target: "reactor", logger = self.target, "{message}"),
        }
    }
}

pub fn get_logger(id: &'static str) -> Logger {
    Logger::new(id)
}
