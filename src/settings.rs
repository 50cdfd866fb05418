use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeetingSettings {
    /// Name used when `--name` is not given.
    pub display_name: Option<String>,
    pub celebration_dismiss_ms: u64,
    /// Open sessions untouched this long are ended on startup.
    pub stale_session_hours: u32,
    /// How often to look for changes made by the partner's process.
    pub poll_interval_ms: u64,
}

impl Default for MeetingSettings {
    fn default() -> Self {
        Self {
            display_name: None,
            celebration_dismiss_ms: 2500,
            stale_session_hours: 12,
            poll_interval_ms: 500,
        }
    }
}

impl MeetingSettings {
    pub fn celebration_delay(&self) -> Duration {
        Duration::from_millis(self.celebration_dismiss_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stale_session_hours))
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<MeetingSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable settings at {}: {}", path.display(), e);
                MeetingSettings::default()
            })
        } else {
            MeetingSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, MeetingSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MeetingSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> MeetingSettings {
        self.read().clone()
    }

    pub fn update<F>(&self, change: F) -> Result<MeetingSettings>
    where
        F: FnOnce(&mut MeetingSettings),
    {
        let mut guard = self.write();
        change(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    /// Remember the name used last so the next run can omit `--name`.
    pub fn remember_display_name(&self, name: &str) -> Result<()> {
        if self.read().display_name.as_deref() == Some(name) {
            return Ok(());
        }
        self.update(|settings| settings.display_name = Some(name.to_string()))?;
        Ok(())
    }

    fn persist(&self, data: &MeetingSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
