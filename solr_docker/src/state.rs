use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{fingerprint::Fingerprint, temp_path, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub fingerprint: Fingerprint,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    steps: BTreeMap<String, StepRecord>,
}

/// Remembers the input fingerprint of the last successful run of every step.
pub struct StateStore {
    path: PathBuf,
    file: StateFile,
}

impl StateStore {
    /// Loads the state at `path`. A missing or unreadable state file means nothing is up to date.
    pub fn load(path: PathBuf) -> Result<Self> {
        let file = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(file) => file,
                Err(error) => {
                    warn!("ignoring corrupt step state at {path:?}: {error}");
                    StateFile::default()
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => StateFile::default(),
            Err(error) => return Err(error.into()),
        };
        Ok(Self { path, file })
    }

    pub fn get(&self, step: &str) -> Option<&StepRecord> {
        self.file.steps.get(step)
    }

    /// A step is up to date if its last successful run saw the same inputs and all of its
    /// outputs still exist.
    pub fn is_up_to_date(&self, step: &str, fingerprint: &Fingerprint, outputs: &[&Path]) -> bool {
        let Some(record) = self.get(step) else {
            debug!("{step}: no previous successful run");
            return false;
        };
        if &record.fingerprint != fingerprint {
            debug!("{step}: inputs changed since {}", record.completed_at);
            return false;
        }
        if let Some(missing) = outputs.iter().find(|output| !output.exists()) {
            debug!("{step}: output {missing:?} no longer exists");
            return false;
        }
        true
    }

    /// Records a successful run and persists the state immediately, so that a later failure does
    /// not lose it.
    pub fn record(&mut self, step: &str, fingerprint: Fingerprint) -> Result<()> {
        self.file.steps.insert(
            step.to_owned(),
            StepRecord {
                fingerprint,
                completed_at: OffsetDateTime::now_utc(),
            },
        );
        self.save()
    }

    /// Drops the record of a step, so that it will run again.
    pub fn invalidate(&mut self, step: &str) -> Result<()> {
        if self.file.steps.remove(step).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        temp_path::write_atomic(&self.path, &serde_json::to_vec_pretty(&self.file)?)?;
        Ok(())
    }
}
