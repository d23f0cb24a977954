//! Process configuration.
//!
//! This crate is the single source of truth for environment resolution:
//! callers invoke [`load_settings`] once at startup and pass the resulting
//! [`Settings`] into constructors. Never scatter `std::env::var` calls across
//! the codebase.
//!
//! # Contract
//! - Error messages reference env var NAMES, never values.
//! - `Debug` on [`Settings`] redacts every secret-bearing field.
//! - In `prod`, missing secrets are a hard startup error; in dev they fall
//!   back to documented defaults (and the field-encryption key is generated
//!   and persisted to a key file on first run).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use pxr_crypto::FieldEncryptor;

mod redact;

pub use redact::redact_text;

// Public Pixiv mobile-app OAuth client; real deployments override via env.
const DEFAULT_PIXIV_OAUTH_CLIENT_ID: &str = "MOBrBDS8blbauoSck0ZfDbtuzpyT";
const DEFAULT_PIXIV_OAUTH_CLIENT_SECRET: &str = "lsACyCD94FhDUtGTXi3QzcFE2uU1hqtDaKeqrdwj";
const DEFAULT_PIXIV_OAUTH_HASH_SECRET: &str =
    "28c1fdd170a5204386cb1313c7077b34f83e4aaf4aa829ce78c231e05b0bae2c";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// All env-derived configuration for one process.
#[derive(Clone)]
pub struct Settings {
    pub app_env: String,
    pub database_url: String,
    pub secret_key: String,
    pub field_encryption_key: String,
    pub admin_username: String,
    pub admin_password: String,
    pub pixiv_oauth_client_id: String,
    pub pixiv_oauth_client_secret: String,
    pub pixiv_oauth_hash_secret: String,
    pub imgproxy_base_url: String,
    pub imgproxy_key: String,
    pub imgproxy_salt: String,
    pub imgproxy_max_dim: u32,
    pub imgproxy_default_options: String,
    pub imgproxy_url_chunk_size: u32,
    pub public_api_key_required: bool,
    pub public_api_key_rpm: u32,
    pub public_api_key_burst: u32,
    pub import_max_bytes: usize,
    pub import_inline_max_accepted: usize,
}

impl Settings {
    pub fn is_prod(&self) -> bool {
        matches!(self.app_env.as_str(), "prod" | "production")
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn hint(v: &str) -> &'static str {
            if v.is_empty() {
                "<unset>"
            } else {
                "<REDACTED>"
            }
        }
        f.debug_struct("Settings")
            .field("app_env", &self.app_env)
            .field("database_url", &self.database_url)
            .field("secret_key", &hint(&self.secret_key))
            .field("field_encryption_key", &hint(&self.field_encryption_key))
            .field("admin_username", &self.admin_username)
            .field("admin_password", &hint(&self.admin_password))
            .field("pixiv_oauth_client_id", &self.pixiv_oauth_client_id)
            .field(
                "pixiv_oauth_client_secret",
                &hint(&self.pixiv_oauth_client_secret),
            )
            .field(
                "pixiv_oauth_hash_secret",
                &hint(&self.pixiv_oauth_hash_secret),
            )
            .field("imgproxy_base_url", &self.imgproxy_base_url)
            .field("imgproxy_key", &hint(&self.imgproxy_key))
            .field("imgproxy_salt", &hint(&self.imgproxy_salt))
            .field("public_api_key_required", &self.public_api_key_required)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

/// Environment lookup seam so tests can inject a map instead of mutating the
/// process environment.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, key).cloned()
    }
}

fn get_str(env: &dyn EnvSource, key: &str, default: &str) -> String {
    match env.get(key) {
        Some(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                default.to_string()
            } else {
                v
            }
        }
        None => default.to_string(),
    }
}

fn get_bool(env: &dyn EnvSource, key: &str, default: bool) -> bool {
    let raw = get_str(env, key, if default { "1" } else { "0" }).to_ascii_lowercase();
    match raw.as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => default,
    }
}

fn get_clamped_u32(env: &dyn EnvSource, key: &str, default: u32, min: u32, max: u32) -> u32 {
    let raw = get_str(env, key, "");
    let value = raw.parse::<u32>().unwrap_or(default);
    value.clamp(min, max)
}

// ---------------------------------------------------------------------------
// Field-encryption key bootstrap
// ---------------------------------------------------------------------------

fn read_key_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let value = raw.trim().to_string();
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!("field_encryption_key_read_failed path={:?} err={}", path, err.kind());
            None
        }
    }
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {parent:?}"))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).with_context(|| format!("write {tmp:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
    }
    std::fs::rename(&tmp, path).with_context(|| format!("rename {tmp:?} -> {path:?}"))?;
    Ok(())
}

fn ensure_field_encryption_key(env: &dyn EnvSource, app_env: &str) -> Result<String> {
    let from_env = get_str(env, "FIELD_ENCRYPTION_KEY", "");
    if !from_env.is_empty() {
        FieldEncryptor::from_key(&from_env)
            .context("FIELD_ENCRYPTION_KEY is not a valid key")?;
        return Ok(from_env);
    }

    let file_raw = get_str(env, "FIELD_ENCRYPTION_KEY_FILE", "");
    let key_file = if file_raw.is_empty() {
        PathBuf::from("./data/field_encryption_key")
    } else {
        PathBuf::from(file_raw)
    };

    if let Some(from_file) = read_key_file(&key_file) {
        FieldEncryptor::from_key(&from_file)
            .with_context(|| format!("key file {key_file:?} is not a valid key"))?;
        return Ok(from_file);
    }

    if matches!(app_env, "prod" | "production") {
        // Enforced later by the prod checklist; return empty so the error
        // names the env var rather than failing here with a partial message.
        return Ok(String::new());
    }

    let generated = FieldEncryptor::generate_key();
    match atomic_write(&key_file, &format!("{generated}\n")) {
        Ok(()) => tracing::info!("field_encryption_key_generated path={:?}", key_file),
        Err(err) => tracing::warn!(
            "field_encryption_key_generated_not_persisted path={:?} err={}",
            key_file,
            err
        ),
    }
    Ok(generated)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Resolve [`Settings`] from the process environment.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&ProcessEnv)
}

/// Resolve [`Settings`] from an arbitrary env source (tests).
pub fn load_settings_from(env: &dyn EnvSource) -> Result<Settings> {
    let app_env = get_str(env, "APP_ENV", "dev").to_ascii_lowercase();
    let is_prod = matches!(app_env.as_str(), "prod" | "production");

    let database_url = get_str(env, "DATABASE_URL", "sqlite://./data/app.db");
    let secret_key = get_str(env, "SECRET_KEY", if is_prod { "" } else { "dev-secret-key" });
    let field_encryption_key = ensure_field_encryption_key(env, &app_env)?;

    let admin_username = get_str(env, "ADMIN_USERNAME", "admin");
    let admin_password = get_str(env, "ADMIN_PASSWORD", if is_prod { "" } else { "admin" });

    let (client_id, client_secret, hash_secret) = if is_prod {
        (
            get_str(env, "PIXIV_OAUTH_CLIENT_ID", ""),
            get_str(env, "PIXIV_OAUTH_CLIENT_SECRET", ""),
            get_str(env, "PIXIV_OAUTH_HASH_SECRET", ""),
        )
    } else {
        (
            get_str(env, "PIXIV_OAUTH_CLIENT_ID", DEFAULT_PIXIV_OAUTH_CLIENT_ID),
            get_str(
                env,
                "PIXIV_OAUTH_CLIENT_SECRET",
                DEFAULT_PIXIV_OAUTH_CLIENT_SECRET,
            ),
            get_str(env, "PIXIV_OAUTH_HASH_SECRET", DEFAULT_PIXIV_OAUTH_HASH_SECRET),
        )
    };

    let settings = Settings {
        app_env,
        database_url,
        secret_key,
        field_encryption_key,
        admin_username,
        admin_password,
        pixiv_oauth_client_id: client_id,
        pixiv_oauth_client_secret: client_secret,
        pixiv_oauth_hash_secret: hash_secret,
        imgproxy_base_url: get_str(env, "IMGPROXY_BASE_URL", ""),
        imgproxy_key: get_str(env, "IMGPROXY_KEY", ""),
        imgproxy_salt: get_str(env, "IMGPROXY_SALT", ""),
        imgproxy_max_dim: get_clamped_u32(env, "IMGPROXY_MAX_DIM", 2048, 16, 20_000),
        imgproxy_default_options: get_str(env, "IMGPROXY_DEFAULT_OPTIONS", ""),
        imgproxy_url_chunk_size: get_clamped_u32(env, "IMGPROXY_URL_CHUNK_SIZE", 16, 0, 128),
        public_api_key_required: get_bool(env, "PUBLIC_API_KEY_REQUIRED", false),
        public_api_key_rpm: get_clamped_u32(env, "PUBLIC_API_KEY_RPM", 0, 0, 10_000_000),
        public_api_key_burst: get_clamped_u32(env, "PUBLIC_API_KEY_BURST", 0, 0, 10_000_000),
        import_max_bytes: get_clamped_u32(env, "IMPORT_MAX_BYTES", 5_000_000, 1024, 100_000_000)
            as usize,
        import_inline_max_accepted: get_clamped_u32(
            env,
            "IMPORT_INLINE_MAX_ACCEPTED",
            50_000,
            1,
            1_000_000,
        ) as usize,
    };

    if settings.is_prod() {
        let mut missing: Vec<&str> = Vec::new();
        if settings.secret_key.is_empty() {
            missing.push("SECRET_KEY");
        }
        if settings.field_encryption_key.is_empty() {
            missing.push("FIELD_ENCRYPTION_KEY");
        }
        if settings.admin_password.is_empty() {
            missing.push("ADMIN_PASSWORD");
        }
        if !settings.imgproxy_base_url.is_empty()
            && (settings.imgproxy_key.is_empty() || settings.imgproxy_salt.is_empty())
        {
            missing.push("IMGPROXY_KEY/IMGPROXY_SALT");
        }
        if !missing.is_empty() {
            bail!("missing required env vars for prod: {}", missing.join(", "));
        }
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn dev_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("fek");
        let e = env(&[(
            "FIELD_ENCRYPTION_KEY_FILE",
            key_file.to_str().unwrap(),
        )]);
        let s = load_settings_from(&e).unwrap();
        assert_eq!(s.app_env, "dev");
        assert!(!s.is_prod());
        assert_eq!(s.admin_username, "admin");
        assert_eq!(s.admin_password, "admin");
        assert!(!s.field_encryption_key.is_empty());
        // Generated key was persisted for the next boot.
        assert!(key_file.exists());
    }

    #[test]
    fn prod_requires_secrets() {
        let e = env(&[("APP_ENV", "prod")]);
        let err = load_settings_from(&e).unwrap_err().to_string();
        assert!(err.contains("SECRET_KEY"));
        assert!(err.contains("FIELD_ENCRYPTION_KEY"));
        assert!(err.contains("ADMIN_PASSWORD"));
    }

    #[test]
    fn explicit_key_must_be_valid() {
        let e = env(&[("FIELD_ENCRYPTION_KEY", "definitely-not-a-key")]);
        assert!(load_settings_from(&e).is_err());
    }

    #[test]
    fn numeric_knobs_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let e = env(&[
            ("FIELD_ENCRYPTION_KEY_FILE", dir.path().join("k").to_str().unwrap()),
            ("IMGPROXY_MAX_DIM", "999999"),
            ("PUBLIC_API_KEY_RPM", "nonsense"),
        ]);
        let s = load_settings_from(&e).unwrap();
        assert_eq!(s.imgproxy_max_dim, 20_000);
        assert_eq!(s.public_api_key_rpm, 0);
    }
}
