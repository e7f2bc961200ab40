/// Deployment detection
///
/// Figures out which Hostforge variant is installed and resolves every
/// variant-dependent decision (database set, volume set, env file name,
/// tenant/home trees) into one immutable profile. Detection is a pure
/// function of the filesystem so it can run against fixture trees; the
/// result is computed once at startup and passed through the pipelines.

use std::path::{Path, PathBuf};

use crate::utils::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    ControlPanel,
    Engine,
    Unknown,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::ControlPanel => "control-panel",
            Variant::Engine => "engine",
            Variant::Unknown => "unknown",
        }
    }

    /// Unknown installs are handled exactly like the classic control panel.
    /// Backward-compatibility fallback, not an error.
    pub fn effective(&self) -> Variant {
        match self {
            Variant::Unknown => Variant::ControlPanel,
            other => *other,
        }
    }

    pub fn is_engine(&self) -> bool {
        matches!(self.effective(), Variant::Engine)
    }
}

/// How a database entry is dumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpScope {
    /// One named schema.
    Single,
    /// The whole server in one multi-database export (the engine's
    /// per-tenant "users" cluster, arbitrary width).
    AllDatabases,
}

/// Which account runs the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpUser {
    Root,
    /// Application user from the env file (DB_USER, defaulting to
    /// "hostforge").
    App,
}

#[derive(Debug, Clone)]
pub struct DatabaseSpec {
    pub name: &'static str,
    pub service: &'static str,
    pub user: DumpUser,
    pub password_key: &'static str,
    pub scope: DumpScope,
}

#[derive(Debug, Clone)]
pub struct DeploymentProfile {
    pub variant: Variant,
    pub install_root: PathBuf,
    pub env_file: PathBuf,
    pub databases: Vec<DatabaseSpec>,
    pub volumes: Vec<String>,
    home_root: PathBuf,
}

impl DeploymentProfile {
    pub fn detect() -> Self {
        Self::detect_at(Path::new("/"))
    }

    /// Detect against an arbitrary filesystem base. Marker checks run in
    /// fixed priority order; first match wins. Never fails: an
    /// unrecognized tree yields `Unknown`.
    pub fn detect_at(base: &Path) -> Self {
        let engine_root = base.join(ENGINE_ROOT);
        let panel_root = base.join(PANEL_ROOT);

        let variant = if engine_root.join(SHARED_HOSTING_MARKER).exists() {
            Variant::Engine
        } else if engine_root.join(COMPOSE_FILE).exists() {
            Variant::Engine
        } else if panel_root.join(COMPOSE_FILE).exists() {
            Variant::ControlPanel
        } else {
            Variant::Unknown
        };

        let install_root = match variant.effective() {
            Variant::Engine => engine_root,
            _ => panel_root,
        };

        let env_file = resolve_env_file(&install_root);

        let (databases, volumes) = match variant.effective() {
            Variant::Engine => (
                vec![
                    DatabaseSpec {
                        name: "engine",
                        service: DB_SERVICE,
                        user: DumpUser::App,
                        password_key: DB_PASSWORD_KEY,
                        scope: DumpScope::Single,
                    },
                    DatabaseSpec {
                        name: "users",
                        service: DB_SERVICE,
                        user: DumpUser::Root,
                        password_key: DB_ROOT_PASSWORD_KEY,
                        scope: DumpScope::AllDatabases,
                    },
                ],
                ENGINE_VOLUMES.iter().map(|v| v.to_string()).collect(),
            ),
            _ => (
                vec![DatabaseSpec {
                    name: "hostforge",
                    service: DB_SERVICE,
                    user: DumpUser::App,
                    password_key: DB_PASSWORD_KEY,
                    scope: DumpScope::Single,
                }],
                PANEL_VOLUMES.iter().map(|v| v.to_string()).collect(),
            ),
        };

        Self {
            variant,
            install_root,
            env_file,
            databases,
            volumes,
            home_root: base.join(HOME_ROOT),
        }
    }

    pub fn compose_file(&self) -> PathBuf {
        self.install_root.join(COMPOSE_FILE)
    }

    /// Compose project label, used to find this installation's containers.
    pub fn compose_project(&self) -> String {
        self.install_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "hostforge".to_string())
    }

    /// Volumes holding database-engine storage. These are destroyed
    /// unconditionally before a restore so stale on-disk state cannot mix
    /// with a freshly imported logical dump.
    pub fn db_volumes(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter(|v| v.ends_with("_db_data"))
            .map(|v| v.as_str())
            .collect()
    }

    /// Engine per-tenant project tree.
    pub fn tenant_root(&self) -> Option<PathBuf> {
        self.variant
            .is_engine()
            .then(|| self.install_root.join(TENANT_DIR))
    }

    /// Engine shared home tree.
    pub fn home_root(&self) -> Option<PathBuf> {
        self.variant.is_engine().then(|| self.home_root.clone())
    }
}

fn resolve_env_file(install_root: &Path) -> PathBuf {
    let primary = install_root.join(ENV_FILE);
    if primary.exists() {
        return primary;
    }
    let legacy = install_root.join(ENV_FILE_LEGACY);
    if legacy.exists() {
        return legacy;
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_detects_engine_from_shared_hosting_marker() {
        let base = fixture();
        touch(&base.path().join(ENGINE_ROOT).join(SHARED_HOSTING_MARKER));

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.variant, Variant::Engine);
        assert_eq!(profile.install_root, base.path().join(ENGINE_ROOT));
        assert_eq!(profile.databases.len(), 2);
        assert!(profile.tenant_root().is_some());
    }

    #[test]
    fn test_detects_engine_from_compose_file() {
        let base = fixture();
        touch(&base.path().join(ENGINE_ROOT).join(COMPOSE_FILE));

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.variant, Variant::Engine);
    }

    #[test]
    fn test_detects_control_panel() {
        let base = fixture();
        touch(&base.path().join(PANEL_ROOT).join(COMPOSE_FILE));

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.variant, Variant::ControlPanel);
        assert_eq!(profile.databases.len(), 1);
        assert_eq!(profile.databases[0].name, "hostforge");
        assert!(profile.tenant_root().is_none());
        assert!(profile.home_root().is_none());
    }

    #[test]
    fn test_engine_markers_win_over_panel() {
        let base = fixture();
        touch(&base.path().join(ENGINE_ROOT).join(SHARED_HOSTING_MARKER));
        touch(&base.path().join(PANEL_ROOT).join(COMPOSE_FILE));

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.variant, Variant::Engine);
    }

    #[test]
    fn test_unknown_falls_back_to_panel_layout() {
        let base = fixture();

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.variant, Variant::Unknown);
        assert_eq!(profile.variant.effective(), Variant::ControlPanel);
        assert_eq!(profile.install_root, base.path().join(PANEL_ROOT));
        assert_eq!(profile.databases.len(), 1);
    }

    #[test]
    fn test_env_file_resolution() {
        let base = fixture();
        let root = base.path().join(PANEL_ROOT);
        touch(&root.join(COMPOSE_FILE));

        // Neither exists: default to the primary name.
        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.env_file, root.join(ENV_FILE));

        // Only the legacy name exists.
        touch(&root.join(ENV_FILE_LEGACY));
        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.env_file, root.join(ENV_FILE_LEGACY));

        // The primary name wins when both exist.
        touch(&root.join(ENV_FILE));
        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.env_file, root.join(ENV_FILE));
    }

    #[test]
    fn test_db_volumes_subset() {
        let base = fixture();
        touch(&base.path().join(PANEL_ROOT).join(COMPOSE_FILE));

        let profile = DeploymentProfile::detect_at(base.path());
        assert_eq!(profile.db_volumes(), vec!["hostforge_db_data"]);
    }
}
