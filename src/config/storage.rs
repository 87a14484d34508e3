//! Preference Storage
//!
//! Config and Command collections are persisted as JSON strings in a
//! string-keyed preference store. The default store is a single JSON object
//! on disk under the per-OS config directory.
//!
//! Config location: `<config_dir>/termhub/` (e.g. ~/.config/termhub on Linux,
//! ~/Library/Application Support/termhub on macOS, %APPDATA%\termhub on Windows)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{Command, Config};

/// Preference key holding the Config collection
pub const SESSIONS_KEY: &str = "sessions";

/// Preference key holding the Command collection
pub const COMMANDS_KEY: &str = "commands";

/// Preference storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the termhub configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|dir| dir.join("termhub"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the vault key file path
pub fn key_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(".encryption_key"))
}

/// Get the preferences file path
pub fn preferences_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("preferences.json"))
}

/// String-keyed preference persistence
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Read a value; `None` when the key was never written
    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferences {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON-object file store
pub struct FilePreferences {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: tokio::sync::Mutex<()>,
}

impl FilePreferences {
    /// Create a store at the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(preferences_file()?))
    }

    /// Create a store with a custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the whole map.
    /// Missing file is an empty map; a corrupted file is backed up and treated as empty.
    async fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(map) => Ok(map),
                Err(e) => {
                    tracing::warn!("Preferences file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted preferences backed up to {:?}, starting empty",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted preferences: {}", backup_err);
                        }
                    }
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write to a temp file, then rename over the target
    async fn save(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(map)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&self.path, &backup_path).await?;
        Ok(backup_path)
    }
}

#[async_trait]
impl PreferenceStore for FilePreferences {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load().await?.remove(key))
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_string(), value.to_string());
        self.save(&map).await
    }
}

/// Load the Config collection. Records with an unknown `type` or that fail
/// to parse are skipped; a missing or malformed array yields an empty list.
pub async fn load_configs(store: &dyn PreferenceStore) -> Result<Vec<Config>, StorageError> {
    let Some(json) = store.get_string(SESSIONS_KEY).await? else {
        return Ok(Vec::new());
    };

    let records: Vec<serde_json::Value> = match serde_json::from_str(&json) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Stored sessions are not a JSON array: {}", e);
            return Ok(Vec::new());
        }
    };

    let mut configs = Vec::with_capacity(records.len());
    for record in records {
        match serde_json::from_value::<Config>(record) {
            Ok(config) => configs.push(config),
            Err(e) => tracing::warn!("Skipping unreadable session record: {}", e),
        }
    }

    tracing::debug!("Loaded {} session configs", configs.len());
    Ok(configs)
}

pub async fn save_configs(
    store: &dyn PreferenceStore,
    configs: &[Config],
) -> Result<(), StorageError> {
    let json = serde_json::to_string(configs)?;
    store.set_string(SESSIONS_KEY, &json).await
}

/// Load the Command collection. Unreadable records are skipped one by one;
/// a malformed array yields an empty list.
pub async fn load_commands(store: &dyn PreferenceStore) -> Result<Vec<Command>, StorageError> {
    let Some(json) = store.get_string(COMMANDS_KEY).await? else {
        return Ok(Vec::new());
    };

    let records: Vec<serde_json::Value> = match serde_json::from_str(&json) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Stored commands are not a JSON array: {}", e);
            return Ok(Vec::new());
        }
    };

    let commands: Vec<Command> = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(command) => Some(command),
            Err(e) => {
                tracing::warn!("Skipping unreadable command record: {}", e);
                None
            }
        })
        .collect();

    tracing::debug!("Loaded {} commands", commands.len());
    Ok(commands)
}

pub async fn save_commands(
    store: &dyn PreferenceStore,
    commands: &[Command],
) -> Result<(), StorageError> {
    let json = serde_json::to_string(commands)?;
    store.set_string(COMMANDS_KEY, &json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{DockerConfig, SshConfig};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let temp = tempdir().unwrap();
        let store = FilePreferences::with_path(temp.path().join("prefs.json"));
        assert!(store.get_string(SESSIONS_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_set_and_get() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("prefs.json");
        let store = FilePreferences::with_path(path.clone());

        store.set_string("a", "1").await.unwrap();
        store.set_string("b", "2").await.unwrap();
        store.set_string("a", "3").await.unwrap();

        let reopened = FilePreferences::with_path(path.clone());
        assert_eq!(reopened.get_string("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(reopened.get_string("b").await.unwrap().as_deref(), Some("2"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupted_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("prefs.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FilePreferences::with_path(path);
        assert!(store.get_string("a").await.unwrap().is_none());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_unknown_types_are_skipped() {
        let store = MemoryPreferences::new();
        store
            .set_string(
                SESSIONS_KEY,
                r#"[
                    {"name":"a","type":"ssh","host":"h","port":22,"user":"u"},
                    {"name":"b","type":"serial","device":"/dev/ttyS0"},
                    {"name":"c","type":"docker","color":"blue"},
                    {"type":"k8s"},
                    "garbage"
                ]"#,
            )
            .await
            .unwrap();

        let configs = load_configs(&store).await.unwrap();
        let names: Vec<_> = configs.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_bad_command_record_keeps_the_rest() {
        let store = MemoryPreferences::new();
        store
            .set_string(
                COMMANDS_KEY,
                r#"[
                    {"Name":"ls","Text":"ls -la","AutoSubmit":true,"Extra":1},
                    {"Text":"no name"},
                    {"name":"top","text":"top"},
                    42
                ]"#,
            )
            .await
            .unwrap();

        let commands = load_commands(&store).await.unwrap();
        assert_eq!(
            commands,
            vec![
                Command::new("ls", "ls -la").with_auto_submit(true),
                Command::new("top", "top"),
            ]
        );

        // Saving back only rewrites what was readable
        save_commands(&store, &commands).await.unwrap();
        assert_eq!(load_commands(&store).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_collections_are_empty() {
        let store = MemoryPreferences::new();
        store.set_string(SESSIONS_KEY, "{}").await.unwrap();
        store.set_string(COMMANDS_KEY, "nope").await.unwrap();

        assert!(load_configs(&store).await.unwrap().is_empty());
        assert!(load_commands(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collections_roundtrip_in_order() {
        let store = MemoryPreferences::new();
        let configs = vec![
            Config::Docker(DockerConfig::new("local", "")),
            Config::Ssh(SshConfig::new("box1", "10.0.0.5", "root")),
        ];
        let commands = vec![Command::new("ls", "ls -la").with_auto_submit(true)];

        save_configs(&store, &configs).await.unwrap();
        save_commands(&store, &commands).await.unwrap();

        assert_eq!(load_configs(&store).await.unwrap(), configs);
        assert_eq!(load_commands(&store).await.unwrap(), commands);
    }
}
