//! Mock durability implementations for testing Thoth.
//!
//! `MockDurability` keeps every record it is handed in memory and can be told
//! to veto commits. `FileDurability` appends committed changes to a file so
//! tests can check what reached "disk".
#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thoth::prelude::*;

#[derive(Default)]
pub struct MockDurability {
    written_through: Mutex<Vec<ChangeRecord>>,
    written_behind: Mutex<Vec<Vec<ChangeRecord>>>,
    veto: AtomicBool,
}

impl MockDurability {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that refuses every write-through.
    pub fn vetoing() -> Self {
        let durability = Self::default();
        durability.veto.store(true, Ordering::SeqCst);
        durability
    }

    pub fn set_veto(&self, veto: bool) {
        self.veto.store(veto, Ordering::SeqCst);
    }

    pub fn written_through(&self) -> Vec<ChangeRecord> {
        self.written_through.lock().unwrap().clone()
    }

    pub fn written_behind(&self) -> Vec<Vec<ChangeRecord>> {
        self.written_behind.lock().unwrap().clone()
    }
}

impl Durability for MockDurability {
    fn write_through(&self, changes: &[ChangeRecord]) -> Result<()> {
        if self.veto.load(Ordering::SeqCst) {
            return Err(ThothError::User("disk full".to_string()));
        }
        self.written_through
            .lock()
            .unwrap()
            .extend(changes.iter().cloned());
        Ok(())
    }

    fn write_behind(&self, changes: Vec<ChangeRecord>) {
        self.written_behind.lock().unwrap().push(changes);
    }
}

/// Appends `ref_id version value` lines for every committed change.
pub struct FileDurability {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDurability {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Durability for FileDurability {
    fn write_through(&self, _changes: &[ChangeRecord]) -> Result<()> {
        Ok(())
    }

    fn write_behind(&self, changes: Vec<ChangeRecord>) {
        let mut file = self.file.lock().unwrap();
        for change in changes {
            writeln!(file, "{} {} {:?}", change.ref_id, change.version, change.value)
                .expect("append to log file");
        }
        file.flush().expect("flush log file");
    }
}
