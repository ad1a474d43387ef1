// projectbackup/src/backup/credentials.rs
//! Database credential resolution.
//!
//! A [`CredentialSource`] stored on a backup configuration is turned into plain
//! [`DbCredentials`] only when a dump or a replay is about to happen. Custom
//! credentials stay sealed (AES-256-GCM) everywhere else.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{EngineError, Result};
use crate::records::CredentialSource;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// File read for the `env` credential source, relative to the project directory.
pub const PROJECT_ENV_FILE: &str = ".env";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbDriver {
    Postgres,
    MySql,
}

impl DbDriver {
    /// Maps a `DB_CONNECTION` value to a driver.
    pub fn from_connection_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pgsql" | "postgres" | "postgresql" => Some(DbDriver::Postgres),
            "mysql" | "mariadb" => Some(DbDriver::MySql),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DbDriver::Postgres => 5432,
            DbDriver::MySql => 3306,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            DbDriver::Postgres => "postgres",
            DbDriver::MySql => "mysql",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCredentials {
    pub driver: DbDriver,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
}

// Never print the password.
impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl DbCredentials {
    pub fn connection_url(&self) -> Result<Url> {
        let invalid = |what: &str| {
            EngineError::Credentials(format!("Invalid {} for database {}", what, self.database))
        };

        let mut url = Url::parse(&format!("{}://localhost", self.driver.scheme()))
            .map_err(|e| EngineError::Credentials(e.to_string()))?;
        url.set_host(Some(&self.host)).map_err(|_| invalid("host"))?;
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        if !self.username.is_empty() {
            url.set_username(&self.username).map_err(|_| invalid("username"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password)).map_err(|_| invalid("password"))?;
        }
        url.set_path(&self.database);
        Ok(url)
    }

    /// `host:port/database`, safe for logs.
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Custom credentials as stored at rest: base64 of `nonce || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedCredentials(pub String);

/// Seals and opens custom credentials with the application key.
#[derive(Clone)]
pub struct CredentialCipher {
    key: Key<Aes256Gcm>,
}

impl CredentialCipher {
    /// Accepts `base64:<32 bytes>` or a raw 32 byte key.
    pub fn from_app_key(app_key: &str) -> Result<Self> {
        let bytes = match app_key.strip_prefix("base64:") {
            Some(encoded) => BASE64
                .decode(encoded.trim())
                .map_err(|e| EngineError::Credentials(format!("APP_KEY is not valid base64: {}", e)))?,
            None => app_key.as_bytes().to_vec(),
        };
        if bytes.len() != KEY_SIZE {
            return Err(EngineError::Credentials(format!(
                "APP_KEY must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    pub fn seal(&self, credentials: &DbCredentials) -> Result<SealedCredentials> {
        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| EngineError::Credentials(e.to_string()))?;
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| EngineError::Credentials(format!("Encryption failed: {}", e)))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(SealedCredentials(BASE64.encode(blob)))
    }

    pub fn open(&self, sealed: &SealedCredentials) -> Result<DbCredentials> {
        let blob = BASE64
            .decode(sealed.0.trim())
            .map_err(|e| EngineError::Credentials(format!("Sealed credentials are not base64: {}", e)))?;
        if blob.len() <= NONCE_SIZE {
            return Err(EngineError::Credentials("Sealed credentials are truncated".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let plaintext = Aes256Gcm::new(&self.key)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EngineError::Credentials("Unable to decrypt custom credentials".to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| EngineError::Credentials(e.to_string()))
    }
}

/// Resolves `source` into usable credentials.
///
/// `Ok(None)` means "no database to dump": the env file or its `DB_DATABASE`
/// key is missing, the driver is unsupported, or the source is reserved.
pub fn resolve(
    source: &CredentialSource,
    project_dir: &Path,
    cipher: Option<&CredentialCipher>,
) -> Result<Option<DbCredentials>> {
    match source {
        CredentialSource::Env => Ok(read_env_credentials(&project_dir.join(PROJECT_ENV_FILE))),
        CredentialSource::Custom { sealed } => {
            let cipher = cipher.ok_or_else(|| {
                EngineError::Credentials("APP_KEY is not configured; cannot open custom credentials".to_string())
            })?;
            cipher.open(sealed).map(Some)
        }
        CredentialSource::ProjectConfig => {
            tracing::debug!("project_config credential source yields no credentials");
            Ok(None)
        }
    }
}

fn read_env_credentials(env_path: &Path) -> Option<DbCredentials> {
    let iter = match dotenv::from_path_iter(env_path) {
        Ok(iter) => iter,
        Err(e) => {
            tracing::info!(path = %env_path.display(), error = %e, "project env file unavailable, skipping database dump");
            return None;
        }
    };

    let mut vars = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(e) => {
                tracing::warn!(path = %env_path.display(), error = %e, "skipping unparsable env line");
            }
        }
    }

    let credentials = credentials_from_env(&vars);
    if credentials.is_none() {
        tracing::info!(path = %env_path.display(), "no usable database settings in project env file");
    }
    credentials
}

/// Builds credentials from Laravel-style `DB_*` keys.
pub fn credentials_from_env(vars: &HashMap<String, String>) -> Option<DbCredentials> {
    let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let database = get("DB_DATABASE")?;
    let driver = match get("DB_CONNECTION") {
        Some(name) => match DbDriver::from_connection_name(name) {
            Some(driver) => driver,
            None => {
                tracing::warn!(connection = name, "unsupported DB_CONNECTION, skipping database dump");
                return None;
            }
        },
        None => DbDriver::MySql,
    };

    let port = match get("DB_PORT") {
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(port = raw, "invalid DB_PORT, using driver default");
                driver.default_port()
            }
        },
        None => driver.default_port(),
    };

    Some(DbCredentials {
        driver,
        host: get("DB_HOST").unwrap_or("127.0.0.1").to_string(),
        port,
        database: database.to_string(),
        username: get("DB_USERNAME").unwrap_or("").to_string(),
        password: vars.get("DB_PASSWORD").filter(|v| !v.is_empty()).cloned(),
    })
}
