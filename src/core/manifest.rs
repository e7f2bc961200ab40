/// Bundle manifest
///
/// Written at the root of every snapshot bundle. Restore uses it to locate
/// the bundle inside the extracted tree and to sanity-check provenance;
/// operators use it to see what a snapshot contains without downloading
/// the data.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::utils::constants::MANIFEST_FILE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub name: String,
    pub items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub variant: String,
    pub tool_version: String,
    pub components: Vec<ComponentEntry>,
    pub total_bytes: u64,
    pub duration_secs: u64,
}

impl Manifest {
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let manifest = Manifest {
            created_at: Utc::now(),
            hostname: "host-a".into(),
            variant: "engine".into(),
            tool_version: "1.4.2".into(),
            components: vec![
                ComponentEntry {
                    name: "databases".into(),
                    items: 2,
                },
                ComponentEntry {
                    name: "volumes".into(),
                    items: 2,
                },
            ],
            total_bytes: 123_456,
            duration_secs: 42,
        };

        manifest.write_to(dir.path()).unwrap();
        let loaded = Manifest::read_from(dir.path()).unwrap();

        assert_eq!(loaded.hostname, "host-a");
        assert_eq!(loaded.variant, "engine");
        assert_eq!(loaded.components.len(), 2);
        assert_eq!(loaded.total_bytes, 123_456);
    }
}
