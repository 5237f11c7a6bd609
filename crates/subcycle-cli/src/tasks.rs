//! Loads the `--tasks=<file>` task list for `batch pause|resume` (spec.md
//! §6, §4.9). The file is a JSON array of account emails; the transition
//! kind comes from which subcommand was invoked, not from the file.

use std::path::Path;

use anyhow::{Context, Result};
use subcycle_batch::Task;
use subcycle_model::TransitionKind;

pub fn load_tasks(path: &Path, kind: TransitionKind) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tasks file {}", path.display()))?;
    let emails: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("tasks file {} is not a JSON array of emails", path.display()))?;
    Ok(emails
        .into_iter()
        .map(|email| Task { email, kind })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_json_array_of_emails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["a@example.com", "b@example.com"]"#).unwrap();

        let tasks = load_tasks(file.path(), TransitionKind::Pause).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].email, "a@example.com");
        assert_eq!(tasks[0].kind, TransitionKind::Pause);
    }

    #[test]
    fn rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_tasks(file.path(), TransitionKind::Resume).is_err());
    }
}
