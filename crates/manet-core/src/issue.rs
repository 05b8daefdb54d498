//! Faults surfaced to the status listener
//!
//! Components never abort on hardware, configuration or application faults.
//! They raise a [`ManetIssue`] instead, tagged with its [`IssueKind`] and a
//! blocker flag. A blocker must be cleared before the transport may
//! `connect()`; a non-blocker means the mesh keeps running degraded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Category of a reported fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// Radio, socket or permission problem on this device
    Hardware,
    /// SDR configuration problem (frequency, firmware, port settings)
    SdrConfig,
    /// Fault in application or protocol code
    AppCode,
}

impl IssueKind {
    fn label(&self) -> &'static str {
        match self {
            IssueKind::Hardware => "Hardware",
            IssueKind::SdrConfig => "SDR config",
            IssueKind::AppCode => "App code",
        }
    }
}

/// A fault detected by some component. Immutable once raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManetIssue {
    kind: IssueKind,
    message: String,
    blocker: bool,
    raised_at_ms: i64,
}

impl ManetIssue {
    /// Create a new issue stamped with the current wall-clock time
    pub fn new(kind: IssueKind, blocker: bool, message: impl Into<String>) -> Self {
        let raised_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            kind,
            message: message.into(),
            blocker,
            raised_at_ms,
        }
    }

    /// Hardware or permission fault
    pub fn hardware(blocker: bool, message: impl Into<String>) -> Self {
        Self::new(IssueKind::Hardware, blocker, message)
    }

    /// SDR configuration fault
    pub fn sdr_config(blocker: bool, message: impl Into<String>) -> Self {
        Self::new(IssueKind::SdrConfig, blocker, message)
    }

    /// Application code fault
    pub fn app_code(blocker: bool, message: impl Into<String>) -> Self {
        Self::new(IssueKind::AppCode, blocker, message)
    }

    pub fn kind(&self) -> IssueKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the transport cannot proceed until this is resolved
    pub fn is_blocker(&self) -> bool {
        self.blocker
    }

    /// Wall-clock time the issue was raised (ms since the Unix epoch)
    pub fn raised_at_ms(&self) -> i64 {
        self.raised_at_ms
    }
}

impl fmt::Display for ManetIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.label())?;
        } else {
            write!(f, "{}", self.message)?;
        }
        if self.blocker {
            write!(f, " (blocking)")?;
        }
        Ok(())
    }
}

/// Currently active issues for one transport
#[derive(Debug, Default)]
pub struct IssueBoard {
    issues: Vec<ManetIssue>,
}

impl IssueBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue
    pub fn raise(&mut self, issue: ManetIssue) {
        self.issues.push(issue);
    }

    /// The first blocking issue, if any
    pub fn first_blocker(&self) -> Option<&ManetIssue> {
        self.issues.iter().find(|i| i.is_blocker())
    }

    /// All active issues, oldest first
    pub fn all(&self) -> &[ManetIssue] {
        &self.issues
    }

    pub fn clear(&mut self) {
        self.issues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display() {
        let issue = ManetIssue::hardware(true, "WiFi absent");
        assert_eq!(issue.to_string(), "WiFi absent (blocking)");

        let issue = ManetIssue::sdr_config(false, "");
        assert_eq!(issue.to_string(), "SDR config");
        assert!(!issue.is_blocker());
    }

    #[test]
    fn test_issue_board_blockers() {
        let mut board = IssueBoard::new();
        board.raise(ManetIssue::app_code(false, "degraded"));
        assert!(board.first_blocker().is_none());

        board.raise(ManetIssue::hardware(true, "no radio"));
        board.raise(ManetIssue::sdr_config(true, "bad gain"));
        assert_eq!(board.first_blocker().map(|i| i.kind()), Some(IssueKind::Hardware));
        assert_eq!(board.all().len(), 3);

        board.clear();
        assert!(board.all().is_empty());
    }

    #[test]
    fn test_issue_serializes_with_kind() {
        let issue = ManetIssue::sdr_config(true, "bad frequency");
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("SdrConfig"));
        let back: ManetIssue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, issue);
    }
}
