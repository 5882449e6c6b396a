use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::TaskId;
use crate::error::PatpatError;

pub const DEFAULT_ROOT: &str = "patpat_env";

const SUBDIRS: [&str; 4] = ["logs", "tmp", "result", "proteome"];
const LOCK_FILE: &str = ".lock";
const TASK_FILE: &str = "task.json";

/// Runtime environment: `logs/`, `tmp/`, `result/` and `proteome/` under one root.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_current_dir() -> Result<Self, PatpatError> {
        let cwd = std::env::current_dir().map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(DEFAULT_ROOT))
            .map_err(|_| PatpatError::Filesystem("invalid environment path".to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root.join("logs")
    }

    pub fn tmp_dir(&self) -> Utf8PathBuf {
        self.root.join("tmp")
    }

    pub fn result_root(&self) -> Utf8PathBuf {
        self.root.join("result")
    }

    pub fn result_dir(&self, task: &TaskId) -> Utf8PathBuf {
        self.result_root().join(task.to_string())
    }

    pub fn proteome_dir(&self) -> Utf8PathBuf {
        self.root.join("proteome")
    }

    pub fn catalog_path(&self, date: &str) -> Utf8PathBuf {
        self.proteome_dir().join(format!("UP_README_{date}"))
    }

    /// Creates the environment layout. Existing directories are left untouched.
    pub fn init(&self) -> Result<(), PatpatError> {
        for dir in SUBDIRS {
            fs::create_dir_all(self.root.join(dir).as_std_path())
                .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        SUBDIRS
            .iter()
            .all(|dir| self.root.join(dir).as_std_path().is_dir())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PatpatError> {
        let parent = path
            .parent()
            .ok_or_else(|| PatpatError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".patpat-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), PatpatError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, PatpatError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PatpatError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| PatpatError::Filesystem(format!("parse {path}: {err}")))
    }

    /// Claims exclusive ownership of a task's result directory for the
    /// lifetime of the returned guard.
    pub fn claim_task(&self, task: &TaskId) -> Result<TaskLock, PatpatError> {
        let dir = self.result_dir(task);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path());
        match file {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(TaskLock { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(PatpatError::TaskInUse(*task))
            }
            Err(err) => Err(PatpatError::Filesystem(err.to_string())),
        }
    }

    pub fn task_record_path(&self, task: &TaskId) -> Utf8PathBuf {
        self.result_dir(task).join(TASK_FILE)
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, PatpatError> {
        let result_root = self.result_root();
        if !result_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(result_root.as_std_path())
            .map_err(|err| PatpatError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PatpatError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().join(TASK_FILE)) else {
                continue;
            };
            if path.as_std_path().is_file() {
                records.push(Self::read_json::<TaskRecord>(&path)?);
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}

/// Held while a hub owns `result/<task>/`; removes the lock file on drop.
#[derive(Debug)]
pub struct TaskLock {
    path: Utf8PathBuf,
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            tracing::warn!(path = %self.path, "failed to release task lock: {err}");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskId,
    pub identifier: String,
    pub state: String,
    pub mappers: Vec<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("/tmp/env"));
        let task: TaskId = "1b4e28ba-2fa1-11d2-883f-0016d3cca427".parse().unwrap();
        assert!(store
            .result_dir(&task)
            .ends_with("result/1b4e28ba-2fa1-11d2-883f-0016d3cca427"));
        assert!(store
            .catalog_path("2024-01-01")
            .ends_with("proteome/UP_README_2024-01-01"));
    }
}
