/// Hostforge deployment layout and orchestration constants
///
/// Paths, timeouts and thresholds shared by the snapshot and restore
/// pipelines. Timeout budgets differ per operation class because the
/// expected data volumes differ by orders of magnitude.

use std::time::Duration;

/// Classic control panel install root, relative to the detection base.
pub const PANEL_ROOT: &str = "opt/hostforge";

/// Engine (multi-tenant) install root, relative to the detection base.
pub const ENGINE_ROOT: &str = "opt/hostforge-engine";

/// Marker file written by the shared-hosting edition of the engine.
pub const SHARED_HOSTING_MARKER: &str = ".shared-hosting";

pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Primary runtime environment file, and the name older installs used.
pub const ENV_FILE: &str = ".env";
pub const ENV_FILE_LEGACY: &str = ".env-core";

/// Directory holding installed panel extensions (optional).
pub const EXTENSIONS_DIR: &str = "extensions";

/// TLS certificate material inside the install root.
pub const SSL_DIR: &str = "ssl";

/// Engine per-tenant compose projects live under the install root.
pub const TENANT_DIR: &str = "projects";

/// Engine shared home tree, relative to the detection base.
pub const HOME_ROOT: &str = "home/hostforge";

/// Compose service running the database engine.
pub const DB_SERVICE: &str = "db";

/// Env-file keys for database credentials.
pub const DB_USER_KEY: &str = "DB_USER";
pub const DB_PASSWORD_KEY: &str = "DB_PASSWORD";
pub const DB_ROOT_PASSWORD_KEY: &str = "DB_ROOT_PASSWORD";

/// Default application database user when DB_USER is not set.
pub const DB_USER_DEFAULT: &str = "hostforge";

/// Runtime volumes archived per variant. The `_db_data` volumes are the
/// ones destroyed and rebuilt during restore.
pub const PANEL_VOLUMES: &[&str] = &[
    "hostforge_db_data",
    "hostforge_redis_data",
    "hostforge_app_data",
];
pub const ENGINE_VOLUMES: &[&str] = &[
    "hostforge-engine_db_data",
    "hostforge-engine_redis_data",
];

/// Image used for short-lived archive/extract helper containers.
pub const HELPER_IMAGE: &str = "alpine:3.19";

/// Repository tag applied to every snapshot regardless of host.
pub const PRODUCT_TAG: &str = "hostforge";

/// Component tags recorded on the snapshot for each bundle section present.
pub const TAG_DATABASES: &str = "databases";
pub const TAG_VOLUMES: &str = "volumes";
pub const TAG_CONFIG: &str = "config";
pub const TAG_USERS: &str = "users";
pub const TAG_HOME: &str = "home";

/// Bundle layout. These names are the wire contract between snapshot and
/// restore; restore locates files by them.
pub const BUNDLE_DATABASES: &str = "databases";
pub const BUNDLE_VOLUMES: &str = "volumes";
pub const BUNDLE_CONFIG: &str = "config";
pub const BUNDLE_USERS: &str = "users";
pub const BUNDLE_HOME: &str = "home";
pub const MANIFEST_FILE: &str = "manifest.json";

pub const STAGING_PREFIX: &str = "hostforge-backup-";
pub const RESTORE_PREFIX: &str = "hostforge-restore-";
pub const LOCK_FILE: &str = "hostforge-backup.lock";

/// Short in-container probe (mysqladmin ping, SELECT 1).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-database logical dump.
pub const DUMP_TIMEOUT: Duration = Duration::from_secs(600);

/// Multi-database ("users" cluster) dump; can be orders of magnitude larger.
pub const BULK_DUMP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Per-volume archive and extract.
pub const VOLUME_TIMEOUT: Duration = Duration::from_secs(7200);

/// Tenant/home tree streaming copy.
pub const TREE_COPY_TIMEOUT: Duration = Duration::from_secs(14_400);

/// docker compose invocations.
pub const COMPOSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Repository engine budgets.
pub const REPO_LIST_TIMEOUT: Duration = Duration::from_secs(120);
pub const REPO_INIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const REPO_TRANSFER_TIMEOUT: Duration = Duration::from_secs(14_400);
pub const REPO_FORGET_TIMEOUT: Duration = Duration::from_secs(600);

/// Connectivity retries apply to init/first-contact only; data-bearing
/// operations are never silently retried.
pub const CONNECT_RETRIES: u32 = 3;
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Database liveness poll after restore.
pub const DB_WAIT_ATTEMPTS: u32 = 120;
pub const DB_WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Settle time before the advisory post-restore service check.
pub const SERVICE_SETTLE: Duration = Duration::from_secs(10);

/// A logical dump smaller than this is certainly truncated.
pub const MIN_DUMP_BYTES: u64 = 1000;

/// A volume archive smaller than this did not capture anything.
pub const MIN_ARCHIVE_BYTES: u64 = 100;

/// Free-space safety margin required beyond the estimated bundle size.
pub const FREE_SPACE_MARGIN_BYTES: u64 = 3000 * 1024 * 1024;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
