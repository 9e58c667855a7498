// diag.rs — Non-fatal diagnostics
//
// Warnings and notes produced by import and tracing travel back to the caller
// in result structs instead of aborting the operation. Fatal conditions are
// `error::Error` values; both share the `DiagCode` numbering.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0301`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Serialized graph above the warning threshold.
    pub const W0301: DiagCode = DiagCode("W0301");
    /// Imported node omitted because `input_map` covers every use of it.
    pub const W0302: DiagCode = DiagCode("W0302");
    /// Import into a graph whose version bounds were narrowed.
    pub const W0303: DiagCode = DiagCode("W0303");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Warning,
    Note,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// Node, tensor or variable the diagnostic is about.
    pub subject: Option<String>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Note, message)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Warning => "warning",
            DiagLevel::Note => "note",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: ", level, code)?;
        } else {
            write!(f, "{}: ", level)?;
        }
        if let Some(subject) = &self.subject {
            write!(f, "{}: ", subject)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::warning("something odd");
        assert_eq!(format!("{d}"), "warning: something odd");
    }

    #[test]
    fn display_with_code_and_subject() {
        let d = Diagnostic::note("omitted; every use is remapped")
            .with_code(codes::W0302)
            .with_subject("A");
        assert_eq!(
            format!("{d}"),
            "note[W0302]: A: omitted; every use is remapped"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::warning("large graph")
            .with_code(codes::W0301)
            .with_hint("split the graph");
        assert_eq!(d.code, Some(codes::W0301));
        assert_eq!(d.hint.as_deref(), Some("split the graph"));
        assert!(format!("{d}").ends_with("\n  hint: split the graph"));
    }
}
