//! Filesystem layout for the clamban data directory.
//!
//! Everything the server persists lives under `~/.clamban`:
//!
//! | Path | Contents |
//! |------|----------|
//! | `board.json` | fallback board when no team is connected |
//! | `boards/<team>.json` | per-team board document |
//! | `active-team.json` | marker recording the connected team |
//! | `state/<team>.json` | persisted team state (lead PID, timestamps) |
//! | `logs/<team>.log` | append-only cycle log |
//!
//! The external teams root (`~/.claude/teams`) is read and watched but never
//! written. Both roots are overridable for tests and via environment.

use std::path::{Component, Path, PathBuf};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "CLAMBAN_DATA_DIR";

/// Environment variable overriding the external teams root.
pub const TEAMS_DIR_ENV: &str = "CLAMBAN_TEAMS_DIR";

#[derive(Debug, Clone)]
pub struct ClambanPaths {
    root: PathBuf,
    teams_root: PathBuf,
}

impl ClambanPaths {
    /// Resolve the default layout from the home directory, honoring the
    /// `CLAMBAN_DATA_DIR` / `CLAMBAN_TEAMS_DIR` overrides.
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".clamban"));
        let teams_root = std::env::var_os(TEAMS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".claude").join("teams"));
        Self { root, teams_root }
    }

    /// Explicit roots, used by tests and the `--data-dir` / `--teams-dir` flags.
    pub fn with_roots(root: impl Into<PathBuf>, teams_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            teams_root: teams_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn teams_root(&self) -> &Path {
        &self.teams_root
    }

    /// Board document for the given team, or the fallback board for `None`.
    pub fn board_path(&self, team: Option<&str>) -> PathBuf {
        match team {
            Some(name) => self.root.join("boards").join(format!("{name}.json")),
            None => self.root.join("board.json"),
        }
    }

    pub fn active_team_path(&self) -> PathBuf {
        self.root.join("active-team.json")
    }

    pub fn state_path(&self, team: &str) -> PathBuf {
        self.root.join("state").join(format!("{team}.json"))
    }

    pub fn log_path(&self, team: &str) -> PathBuf {
        self.root.join("logs").join(format!("{team}.log"))
    }

    /// Directory of one external team (`config.json` plus per-worker inboxes).
    pub fn team_dir(&self, team: &str) -> PathBuf {
        self.teams_root.join(team)
    }
}

impl Default for ClambanPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// Unlike `canonicalize` this works for paths that do not exist yet, which is
/// what the context endpoint needs: the referenced file may not have been
/// created by the agent at the time it is attached to a task.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                } else {
                    components.push(Component::ParentDir);
                }
            }
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve `relative` under `root` and reject anything that escapes it.
///
/// Returns the normalized absolute path, or `None` when the result lands
/// outside `root`. The comparison is component-wise, so `/tmp/p` does not
/// accidentally admit `/tmp/pwned`.
pub fn resolve_under(root: &Path, relative: &Path) -> Option<PathBuf> {
    let root = normalize_lexically(root);
    let joined = normalize_lexically(&root.join(relative));
    if joined.starts_with(&root) {
        Some(joined)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_path_switches_with_team() {
        let paths = ClambanPaths::with_roots("/data", "/teams");
        assert_eq!(paths.board_path(None), PathBuf::from("/data/board.json"));
        assert_eq!(
            paths.board_path(Some("alpha")),
            PathBuf::from("/data/boards/alpha.json")
        );
    }

    #[test]
    fn per_team_files_are_namespaced() {
        let paths = ClambanPaths::with_roots("/data", "/teams");
        assert_eq!(
            paths.state_path("alpha"),
            PathBuf::from("/data/state/alpha.json")
        );
        assert_eq!(paths.log_path("alpha"), PathBuf::from("/data/logs/alpha.log"));
        assert_eq!(paths.team_dir("alpha"), PathBuf::from("/teams/alpha"));
    }

    #[test]
    fn normalize_resolves_dot_components() {
        let normalized = normalize_lexically(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn resolve_under_accepts_inside_paths() {
        let resolved = resolve_under(Path::new("/tmp/p"), Path::new("src/a.ts")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/p/src/a.ts"));
    }

    #[test]
    fn resolve_under_rejects_escapes() {
        assert!(resolve_under(Path::new("/tmp/p"), Path::new("../etc/passwd")).is_none());
        assert!(resolve_under(Path::new("/tmp/p"), Path::new("a/../../..")).is_none());
    }

    #[test]
    fn resolve_under_rejects_sibling_prefix() {
        // "/tmp/p" must not admit "/tmp/pwned" via "..".
        assert!(resolve_under(Path::new("/tmp/p"), Path::new("../pwned/x")).is_none());
    }
}
