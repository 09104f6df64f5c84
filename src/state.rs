use crate::storage::{DocumentBackend, PersistedDocument, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStatus {
    Ok,
    Alert,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckState {
    pub status: StateStatus,
    #[serde(default)]
    pub consecutive: u32,
    #[serde(default)]
    pub last_value: Option<f64>,
    #[serde(default)]
    pub last_ts: Option<i64>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub checks: BTreeMap<String, CheckState>,
    #[serde(default)]
    pub last_update_cursor: Option<i64>,
}

pub struct CheckStateStore {
    doc: PersistedDocument<StateDocument>,
}

impl CheckStateStore {
    pub fn open(backend: Box<dyn DocumentBackend>) -> Result<Self, StorageError> {
        Ok(Self {
            doc: PersistedDocument::load(backend)?,
        })
    }

    pub fn describe(&self) -> String {
        self.doc.describe()
    }

    pub fn get(&self, check_id: &str) -> Option<CheckState> {
        self.doc.read(|d| d.checks.get(check_id).cloned())
    }

    pub fn set(&self, check_id: &str, state: CheckState) {
        self.doc.update(|d| {
            d.checks.insert(check_id.to_string(), state);
        });
    }

    pub fn iterate(&self) -> Vec<(String, CheckState)> {
        self.doc.read(|d| {
            d.checks
                .iter()
                .map(|(id, state)| (id.clone(), state.clone()))
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.doc.read(|d| d.checks.len())
    }

    pub fn save(&self) -> Result<(), StorageError> {
        self.doc.save()
    }

    /// Сохраняет пачку новых состояний одной записью. Если запись не удалась,
    /// состояние в памяти не меняется и следующий тик считает от прежнего.
    pub fn commit(&self, batch: &[(String, CheckState)]) -> Result<(), StorageError> {
        self.doc.commit_staged(|d| {
            for (id, state) in batch {
                d.checks.insert(id.clone(), state.clone());
            }
        })
    }

    pub fn last_update_cursor(&self) -> Option<i64> {
        self.doc.read(|d| d.last_update_cursor)
    }

    pub fn set_last_update_cursor(&self, cursor: i64) {
        self.doc.update(|d| d.last_update_cursor = Some(cursor));
    }
}
