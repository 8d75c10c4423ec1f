//! Atomic JSON file persistence: write to a sibling temp file, then rename
//! over the target so a reader never observes a half-written file.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).context("creating data directory")?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).context("serializing persisted state")?;
    std::fs::write(&tmp_path, body).context("writing temp file")?;
    std::fs::rename(&tmp_path, path).context("renaming temp file into place")?;
    Ok(())
}

/// Loads JSON from `path`, returning `T::default()` if the file is missing
/// or unparseable. A corrupt file is logged, not fatal (SPEC_FULL §4.2).
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "corrupt persisted file, starting empty");
            T::default()
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read persisted file, starting empty");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("voicelearn-persist-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        let mut data = HashMap::new();
        data.insert("a".to_string(), 1u32);
        data.insert("b".to_string(), 2u32);

        save_json(&path, &data).unwrap();
        let loaded: HashMap<String, u32> = load_json_or_default(&path);
        assert_eq!(loaded, data);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_yields_default() {
        let path = std::env::temp_dir().join(format!("voicelearn-missing-{}.json", uuid::Uuid::new_v4()));
        let loaded: HashMap<String, u32> = load_json_or_default(&path);
        assert!(loaded.is_empty());
    }

    #[test]
    fn corrupt_file_yields_default_not_panic() {
        let dir = std::env::temp_dir().join(format!("voicelearn-corrupt-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let loaded: HashMap<String, u32> = load_json_or_default(&path);
        assert!(loaded.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_temp_file_left_behind_after_save() {
        let dir = std::env::temp_dir().join(format!("voicelearn-tmp-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        let data: HashMap<String, u32> = HashMap::new();
        save_json(&path, &data).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
