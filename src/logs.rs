//! Per-team append-only cycle logs with bounded tail reads.

use std::fs;
use std::io::Write;

use crate::paths::ClambanPaths;

/// Hard cap on how many lines a tail read returns.
pub const MAX_TAIL_LINES: usize = 2000;

#[derive(Debug, Clone)]
pub struct LogStore {
    paths: ClambanPaths,
}

impl LogStore {
    pub fn new(paths: ClambanPaths) -> Self {
        Self { paths }
    }

    /// Append one line to the team's log.
    pub fn append(&self, team: &str, line: &str) -> std::io::Result<()> {
        let path = self.paths.log_path(team);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    }

    /// Truncate the team's log. Used at the start of a fresh session.
    pub fn clear(&self, team: &str) -> std::io::Result<()> {
        let path = self.paths.log_path(team);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"")
    }

    /// Last `n` lines of the team's log, capped at [`MAX_TAIL_LINES`].
    /// A missing log reads as empty.
    pub fn read_tail(&self, team: &str, n: usize) -> std::io::Result<Vec<String>> {
        let n = n.min(MAX_TAIL_LINES);
        let content = match fs::read_to_string(self.paths.log_path(team)) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logs_in(dir: &std::path::Path) -> LogStore {
        LogStore::new(ClambanPaths::with_roots(dir, dir.join("teams")))
    }

    #[test]
    fn append_and_tail() {
        let dir = tempdir().unwrap();
        let logs = logs_in(dir.path());
        for i in 0..5 {
            logs.append("alpha", &format!("line {i}")).unwrap();
        }
        assert_eq!(logs.read_tail("alpha", 2).unwrap(), vec!["line 3", "line 4"]);
        assert_eq!(logs.read_tail("alpha", 100).unwrap().len(), 5);
    }

    #[test]
    fn tail_of_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let logs = logs_in(dir.path());
        assert!(logs.read_tail("ghost", 10).unwrap().is_empty());
    }

    #[test]
    fn tail_is_capped() {
        let dir = tempdir().unwrap();
        let logs = logs_in(dir.path());
        for i in 0..(MAX_TAIL_LINES + 50) {
            logs.append("alpha", &format!("line {i}")).unwrap();
        }
        let tail = logs.read_tail("alpha", usize::MAX).unwrap();
        assert_eq!(tail.len(), MAX_TAIL_LINES);
        assert_eq!(tail.last().unwrap(), &format!("line {}", MAX_TAIL_LINES + 49));
    }

    #[test]
    fn clear_truncates() {
        let dir = tempdir().unwrap();
        let logs = logs_in(dir.path());
        logs.append("alpha", "old").unwrap();
        logs.clear("alpha").unwrap();
        assert!(logs.read_tail("alpha", 10).unwrap().is_empty());
    }

    #[test]
    fn teams_get_separate_logs() {
        let dir = tempdir().unwrap();
        let logs = logs_in(dir.path());
        logs.append("alpha", "a").unwrap();
        logs.append("beta", "b").unwrap();
        assert_eq!(logs.read_tail("alpha", 10).unwrap(), vec!["a"]);
        assert_eq!(logs.read_tail("beta", 10).unwrap(), vec!["b"]);
    }
}
