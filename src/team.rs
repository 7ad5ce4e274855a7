//! Team binding, persisted team state, and discovery of external teams.
//!
//! A team couples the board to a project checkout and an agent configuration.
//! The config lives inside the board document (`meta.team`); runtime state
//! (lead PID, start/stop timestamps) is persisted separately so it survives
//! server restarts and hot reloads.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::board::store::write_atomic;
use crate::paths::ClambanPaths;

/// Default per-session turn budget when a team does not specify one.
pub const DEFAULT_MAX_TURNS: u32 = 100;

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub name: String,
    pub project_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

/// Runtime state persisted at `state/<team>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamState {
    #[serde(default)]
    pub lead_pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl TeamState {
    /// Missing or unreadable state reads as default; the file is advisory.
    pub fn load(paths: &ClambanPaths, team: &str) -> Self {
        let path = paths.state_path(team);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &ClambanPaths, team: &str) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&paths.state_path(team), &bytes)
    }
}

/// Team names discovered under the external teams root.
///
/// A directory counts as a team only when it contains a `config.json`.
pub fn discover_teams(paths: &ClambanPaths) -> Vec<String> {
    let mut teams = Vec::new();
    let Ok(entries) = std::fs::read_dir(paths.teams_root()) else {
        return teams;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("config.json").is_file() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                teams.push(name.to_string());
            }
        }
    }
    teams.sort();
    teams
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn team_config_defaults_max_turns() {
        let config: TeamConfig =
            serde_json::from_str(r#"{"name":"alpha","projectDir":"/tmp/p"}"#).unwrap();
        assert_eq!(config.max_turns, DEFAULT_MAX_TURNS);
        assert!(config.model.is_none());
    }

    #[test]
    fn team_state_round_trips() {
        let dir = tempdir().unwrap();
        let paths = ClambanPaths::with_roots(dir.path(), dir.path().join("teams"));

        let state = TeamState {
            lead_pid: Some(4321),
            started_at: Some(Utc::now()),
            stopped_at: None,
        };
        state.save(&paths, "alpha").unwrap();

        let loaded = TeamState::load(&paths, "alpha");
        assert_eq!(loaded.lead_pid, Some(4321));
        assert!(loaded.stopped_at.is_none());
    }

    #[test]
    fn team_state_missing_file_reads_default() {
        let dir = tempdir().unwrap();
        let paths = ClambanPaths::with_roots(dir.path(), dir.path().join("teams"));
        assert_eq!(TeamState::load(&paths, "ghost"), TeamState::default());
    }

    #[test]
    fn discover_teams_filters_to_config_dirs() {
        let dir = tempdir().unwrap();
        let teams_root = dir.path().join("teams");
        std::fs::create_dir_all(teams_root.join("alpha")).unwrap();
        std::fs::write(teams_root.join("alpha/config.json"), "{}").unwrap();
        std::fs::create_dir_all(teams_root.join("no-config")).unwrap();
        std::fs::write(teams_root.join("stray-file"), "x").unwrap();
        std::fs::create_dir_all(teams_root.join("beta")).unwrap();
        std::fs::write(teams_root.join("beta/config.json"), "{}").unwrap();

        let paths = ClambanPaths::with_roots(dir.path().join("data"), &teams_root);
        assert_eq!(discover_teams(&paths), vec!["alpha", "beta"]);
    }

    #[test]
    fn discover_teams_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let paths = ClambanPaths::with_roots(dir.path(), dir.path().join("nope"));
        assert!(discover_teams(&paths).is_empty());
    }
}
