//! Builds and inspects the `resultHistory` line format from spec.md §6:
//! `<emoji> <kind> (<lang>) <outcome> | <short timestamp> | <workerId> [| <detail>]`

use chrono::NaiveDateTime;
use subcycle_model::TransitionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    NewSuccess,
    Already,
    Failure,
    Pending,
}

impl HistoryOutcome {
    fn as_str(self) -> &'static str {
        match self {
            HistoryOutcome::NewSuccess => "new-success",
            HistoryOutcome::Already => "already",
            HistoryOutcome::Failure => "failure",
            HistoryOutcome::Pending => "pending",
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            HistoryOutcome::NewSuccess => "✅",
            HistoryOutcome::Already => "✅",
            HistoryOutcome::Failure => "❌",
            HistoryOutcome::Pending => "⏳",
        }
    }
}

pub struct HistoryLine<'a> {
    pub kind: TransitionKind,
    pub lang: &'a str,
    pub outcome: HistoryOutcome,
    pub timestamp: NaiveDateTime,
    pub worker_id: &'a str,
    pub detail: Option<&'a str>,
}

impl<'a> HistoryLine<'a> {
    pub fn render(&self) -> String {
        let mut line = format!(
            "{} {} ({}) {} | {} | {}",
            self.outcome.emoji(),
            self.kind.as_str(),
            self.lang,
            self.outcome.as_str(),
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.worker_id,
        );
        if let Some(detail) = self.detail {
            line.push_str(" | ");
            line.push_str(detail);
        }
        line
    }
}

/// Counts case-insensitive occurrences of the kind-specific success marker
/// ("new-success" or "already" for that kind) in the history text, per
/// spec.md §4.10.
pub fn count_same_kind_successes(history: &str, kind: TransitionKind) -> usize {
    let needle = format!(" {} (", kind.as_str()).to_lowercase();
    let lower = history.to_lowercase();
    lower
        .lines()
        .filter(|line| {
            line.contains(&needle) && (line.contains("new-success") || line.contains("already"))
        })
        .count()
}
