/// Runtime environment file access
///
/// Reads the installation's .env (or legacy .env-core) file. Values feed
/// database credentials into the pipelines; the file itself is also copied
/// verbatim into the snapshot bundle.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EnvValue {
    pub value: String,
    pub comment: Option<String>,
}

pub struct EnvFile {
    path: PathBuf,
    values: HashMap<String, EnvValue>,
}

impl EnvFile {
    /// Load an env file, keeping the comment preceding each entry.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow!("env file not found at {}", path.display()));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let mut values = HashMap::new();
        let mut current_comment = None;

        for line in content.lines() {
            let line = line.trim();

            if line.starts_with('#') {
                current_comment = Some(line.trim_start_matches('#').trim().to_string());
                continue;
            }

            if line.is_empty() {
                current_comment = None;
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                values.insert(
                    key.trim().to_string(),
                    EnvValue {
                        value: value.trim().to_string(),
                        comment: current_comment.take(),
                    },
                );
            }
        }

        Ok(Self { path, values })
    }

    /// Load if the file exists, otherwise an empty set. Pipelines treat a
    /// missing env file as "no credentials", a soft condition.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        Self::load(&path).unwrap_or_else(|_| Self {
            path: path.as_ref().to_path_buf(),
            values: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.value.as_str())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parses_keys_and_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Database credentials").unwrap();
        writeln!(file, "DB_USER=hostforge").unwrap();
        writeln!(file, "DB_PASSWORD=s3cret").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "DB_ROOT_PASSWORD = rootpw ").unwrap();

        let env = EnvFile::load(file.path()).unwrap();
        assert_eq!(env.get("DB_USER"), Some("hostforge"));
        assert_eq!(env.get("DB_PASSWORD"), Some("s3cret"));
        assert_eq!(env.get("DB_ROOT_PASSWORD"), Some("rootpw"));
        assert_eq!(env.get("MISSING"), None);
        assert_eq!(env.get_or("MISSING", "fallback"), "fallback");
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(EnvFile::load("/nonexistent/.env").is_err());
    }

    #[test]
    fn test_load_or_empty_tolerates_missing_file() {
        let env = EnvFile::load_or_empty("/nonexistent/.env");
        assert!(env.is_empty());
        assert_eq!(env.get("DB_PASSWORD"), None);
    }
}
