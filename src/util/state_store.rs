use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// What survives between runs.
///
/// On disk: `{"last_success_iso": "...", "notified": {"<key>": true}}`.
/// Unknown top-level keys are carried through untouched. `save` sorts every
/// object's keys, the top level included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub last_success_iso: Option<String>,

    #[serde(default)]
    pub notified: BTreeMap<String, bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RunState {
    pub fn is_notified(&self, key: &str) -> bool {
        self.notified.get(key).copied().unwrap_or(false)
    }

    pub fn mark_notified(&mut self, key: String) {
        self.notified.insert(key, true);
    }

    /// Last successful fetch. Garbage in the file reads as "never".
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_success_iso.as_deref()?;
        DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_success_iso = Some(now.to_rfc3339_opts(SecondsFormat::AutoSi, false));
    }
}

/// Load the state file. Missing or unreadable files yield an empty state.
pub fn load(path: &Path) -> RunState {
    let text = match fs::read_to_string(path) {
        Ok(t)  => t,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "no state file, starting fresh");
            return RunState::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file is corrupt, starting fresh");
            RunState::default()
        }
    }
}

/// Write `<path>.tmp` then rename it over `path`.
pub fn save(path: &Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = to_sorted_json(state)?;

    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Pretty JSON with every object's keys in order. Going through `Value`
/// merges the flattened extras with the named fields before sorting.
fn to_sorted_json(state: &RunState) -> Result<String> {
    let value = serde_json::to_value(state)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
