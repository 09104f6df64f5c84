use crate::config::{StorageBackendKind, StorageConfig};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

const DOCUMENTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    name TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ошибка ввода-вывода для {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("ошибка SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ошибка сериализации JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Хранилище одного именованного документа. `commit` обязан быть атомарным:
/// читатель видит либо прежнее содержимое, либо новое целиком.
pub trait DocumentBackend: Send + Sync {
    fn load(&self) -> Result<Option<String>, StorageError>;
    fn commit(&self, body: &str) -> Result<(), StorageError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    CheckState,
    Feeds,
}

impl DocumentKind {
    fn name(self) -> &'static str {
        match self {
            DocumentKind::CheckState => "check_state",
            DocumentKind::Feeds => "feeds",
        }
    }
}

pub fn open_backend(
    cfg: &StorageConfig,
    kind: DocumentKind,
) -> Result<Box<dyn DocumentBackend>, StorageError> {
    match cfg.backend {
        StorageBackendKind::Json => {
            let path = match kind {
                DocumentKind::CheckState => &cfg.state_file,
                DocumentKind::Feeds => &cfg.feeds_file,
            };
            Ok(Box::new(JsonFileBackend::new(path)))
        }
        StorageBackendKind::Sqlite => Ok(Box::new(SqliteBackend::open(
            &cfg.sqlite_path,
            kind.name(),
        )?)),
    }
}

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl DocumentBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(&self.path, err)),
        }
    }

    fn commit(&self, body: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| Self::io_err(&tmp, e))?;
        file.write_all(body.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Self::io_err(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| Self::io_err(&self.path, e))?;
        sync_parent_dir(&self.path)
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| JsonFileBackend::io_err(parent, e))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: PathBuf,
    name: String,
}

impl SqliteBackend {
    pub fn open(path: impl Into<PathBuf>, name: &str) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(DOCUMENTS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            name: name.to_string(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentBackend for SqliteBackend {
    fn load(&self) -> Result<Option<String>, StorageError> {
        let conn = self.conn();
        let body = conn
            .query_row(
                "SELECT body FROM documents WHERE name = ?1",
                params![self.name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body)
    }

    fn commit(&self, body: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO documents (name, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![self.name, body, crate::now_unix()],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.name)
    }
}

/// `save_lock` упорядочивает записи: старый снимок не перетирает новый.
pub struct PersistedDocument<T> {
    backend: Box<dyn DocumentBackend>,
    doc: Mutex<T>,
    save_lock: Mutex<()>,
}

impl<T> PersistedDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    pub fn load(backend: Box<dyn DocumentBackend>) -> Result<Self, StorageError> {
        let doc = match backend.load()? {
            Some(text) => match serde_json::from_str::<T>(&text) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(
                        "Не удалось разобрать {}, начинаем с пустого состояния: {}",
                        backend.describe(),
                        err
                    );
                    T::default()
                }
            },
            None => T::default(),
        };
        Ok(Self {
            backend,
            doc: Mutex::new(doc),
            save_lock: Mutex::new(()),
        })
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = lock(&self.doc);
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = lock(&self.doc);
        f(&mut guard)
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let _ordering = lock(&self.save_lock);
        let body = {
            let guard = lock(&self.doc);
            serde_json::to_string_pretty(&*guard)?
        };
        self.backend.commit(&body)
    }

    /// Применяет изменение к копии, сохраняет её и только после успешной
    /// записи применяет то же изменение к документу в памяти. При ошибке
    /// записи состояние в памяти остаётся прежним.
    pub fn commit_staged<R>(&self, f: impl Fn(&mut T) -> R) -> Result<R, StorageError> {
        let _ordering = lock(&self.save_lock);
        let mut staged = lock(&self.doc).clone();
        f(&mut staged);
        let body = serde_json::to_string_pretty(&staged)?;
        self.backend.commit(&body)?;
        let mut guard = lock(&self.doc);
        Ok(f(&mut guard))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
