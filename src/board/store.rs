//! Atomic board persistence and the active-team marker.
//!
//! Every write lands in a sibling `<target>.tmp`, is fsynced, then renamed
//! over the target. Readers concurrent with a writer see either the previous
//! document or the new one, never a torn file; this replaces any locking
//! between the human-driven handlers and the agent-driven ones.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::errors::StoreError;
use crate::paths::ClambanPaths;

/// Write `bytes` to `path` atomically: temp sibling, fsync, rename.
///
/// Parent directories are created first; creation is idempotent.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

// ── Active-team registry ──────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveTeamMarker {
    team_name: Option<String>,
}

/// The single small marker file recording which team's board is current.
#[derive(Debug)]
pub struct ActiveTeamRegistry {
    path: PathBuf,
    current: Option<String>,
}

impl ActiveTeamRegistry {
    /// Rehydrate from the marker file; missing or unreadable means no team.
    pub fn load(path: PathBuf) -> Self {
        let current = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ActiveTeamMarker>(&bytes).ok())
            .and_then(|marker| marker.team_name);
        Self { path, current }
    }

    pub fn get(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set(&mut self, team: Option<&str>) -> Result<(), StoreError> {
        let marker = ActiveTeamMarker {
            team_name: team.map(str::to_string),
        };
        let bytes = serde_json::to_vec_pretty(&marker)?;
        write_atomic(&self.path, &bytes)?;
        self.current = team.map(str::to_string);
        Ok(())
    }
}

// ── Board store ───────────────────────────────────────────────────────

/// Reads and writes the board document addressed by the active team.
#[derive(Debug)]
pub struct BoardStore {
    paths: ClambanPaths,
    registry: ActiveTeamRegistry,
}

impl BoardStore {
    pub fn open(paths: ClambanPaths) -> Self {
        let registry = ActiveTeamRegistry::load(paths.active_team_path());
        Self { paths, registry }
    }

    pub fn paths(&self) -> &ClambanPaths {
        &self.paths
    }

    pub fn active_team(&self) -> Option<&str> {
        self.registry.get()
    }

    /// Switch which board file `read`/`write` address. Persisted in the
    /// marker so the binding survives a restart.
    pub fn set_active_team(&mut self, team: Option<&str>) -> Result<(), StoreError> {
        self.registry.set(team)
    }

    pub fn board_path(&self) -> PathBuf {
        self.paths.board_path(self.registry.get())
    }

    /// Read the current board, materializing the default document on disk
    /// when the file does not exist yet.
    pub fn read(&self) -> Result<Board, StoreError> {
        let path = self.board_path();
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed { path, source })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let name = self
                    .registry
                    .get()
                    .map(str::to_string)
                    .unwrap_or_else(|| "Board".to_string());
                let board = Board::new(name);
                self.write(&board)?;
                Ok(board)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn write(&self, board: &Board) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(board)?;
        write_atomic(&self.board_path(), &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Task, TaskColumn};
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> BoardStore {
        BoardStore::open(ClambanPaths::with_roots(dir, dir.join("teams")))
    }

    #[test]
    fn read_materializes_default_board() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(!store.board_path().exists());
        let board = store.read().unwrap();
        assert!(store.board_path().exists());
        assert_eq!(board.columns.len(), 5);
        assert!(board.tasks.is_empty());

        // Second read returns the persisted document.
        let again = store.read().unwrap();
        assert_eq!(again.meta.name, board.meta.name);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let mut board = store.read().unwrap();
        let order = board.next_order(TaskColumn::Ready);
        board
            .tasks
            .insert("t1".into(), Task::new("t1", "first", TaskColumn::Ready, order));
        store.write(&board).unwrap();

        let loaded = store.read().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks["t1"].title, "first");
    }

    #[test]
    fn malformed_board_is_an_error_not_a_reset() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        write_atomic(&store.board_path(), b"{ not json").unwrap();

        let err = store.read().unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        // The broken file must be left in place for inspection.
        assert_eq!(fs::read(store.board_path()).unwrap(), b"{ not json");
    }

    #[test]
    fn active_team_switches_board_path() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());

        assert!(store.board_path().ends_with("board.json"));
        store.set_active_team(Some("alpha")).unwrap();
        assert!(store.board_path().ends_with("boards/alpha.json"));
        store.set_active_team(None).unwrap();
        assert!(store.board_path().ends_with("board.json"));
    }

    #[test]
    fn active_team_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = store_in(dir.path());
            store.set_active_team(Some("alpha")).unwrap();
        }
        let store = store_in(dir.path());
        assert_eq!(store.active_team(), Some("alpha"));
    }

    #[test]
    fn corrupt_marker_reads_as_no_team() {
        let dir = tempdir().unwrap();
        let paths = ClambanPaths::with_roots(dir.path(), dir.path().join("teams"));
        write_atomic(&paths.active_team_path(), b"garbage").unwrap();

        let store = BoardStore::open(paths);
        assert_eq!(store.active_team(), None);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_writes() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut board = store.read().unwrap();
        board.meta.version = 0;
        store.write(&board).unwrap();

        let path = store.board_path();
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let bytes = fs::read(&path).unwrap();
                        let parsed: Board = serde_json::from_slice(&bytes)
                            .expect("reader observed a torn board document");
                        assert!(parsed.meta.version < 50);
                    }
                })
            })
            .collect();

        for version in 0..50 {
            board.meta.version = version;
            store.write(&board).unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
