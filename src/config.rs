//! Runtime configuration, read from the environment once at startup and then
//! passed around by reference. Nothing reads `std::env` after boot.

use anyhow::{bail, Context, Result};
use std::{env, net::SocketAddr};

/// Page size for the note listing when `limit` is absent.
pub const DEFAULT_PAGE_SIZE: i64 = 12;
/// Larger pages are clamped to this.
pub const MAX_PAGE_SIZE: i64 = 100;
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Sessions are valid for 30 days.
pub const SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
/// Postgres default max connections is 100, and we'll take most of 'em
/// https://www.postgresql.org/docs/current/runtime-config-connection.html
pub const MAX_DB_CONNECTIONS: u32 = 80;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub session_secret: Vec<u8>,
    pub allowed_origins: Vec<String>,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug)]
pub enum StorageConfig {
    Cloudinary(CloudinaryConfig),
    S3(S3Config),
}

#[derive(Clone, Debug, Default)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_base: String,
}

#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
    /// For S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub public_url: Option<String>,
}

impl CloudinaryConfig {
    pub const DEFAULT_API_BASE: &'static str = "https://api.cloudinary.com";

    pub fn has_credentials(&self) -> bool {
        !(self.cloud_name.is_empty()
            || self.api_key.is_empty()
            || self.api_secret.is_empty())
    }
}

impl S3Config {
    pub fn has_credentials(&self) -> bool {
        !(self.access_key_id.is_empty() || self.secret_access_key.is_empty())
    }
}

impl StorageConfig {
    pub fn has_credentials(&self) -> bool {
        match self {
            Self::Cloudinary(c) => c.has_credentials(),
            Self::S3(c) => c.has_credentials(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Cloudinary(_) => "cloudinary",
            Self::S3(_) => "s3",
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key/value source; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or_empty = |key: &str| get(key).unwrap_or_default();

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5001".to_owned())
            .parse::<SocketAddr>()
            .context("BIND_ADDR must be a socket address")?;

        let database_url = match get("DATABASE_URL") {
            Some(url) => url,
            None => {
                let pg_usr = get("POSTGRES_USER")
                    .context("postgres user to be defined in environment")?;
                let pg_pw = get("POSTGRES_PASSWORD").context(
                    "postgres password to be defined in environment",
                )?;
                let pg_db = get("POSTGRES_DB")
                    .context("postgres db name to be defined in environment")?;
                let pg_host = get("POSTGRES_HOST")
                    .unwrap_or_else(|| "localhost:5432".to_owned());
                format!("postgres://{pg_usr}:{pg_pw}@{pg_host}/{pg_db}")
            }
        };

        let session_secret: Vec<u8> = get("SESSION_SECRET")
            .context("session secret to be defined in the environment")?
            .into();

        let allowed_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_owned())
            .split(',')
            .map(|o| o.trim().to_owned())
            .filter(|o| !o.is_empty())
            .collect();

        let provider =
            get("STORAGE_PROVIDER").unwrap_or_else(|| "cloudinary".to_owned());
        let storage = match provider.to_lowercase().as_str() {
            "cloudinary" => StorageConfig::Cloudinary(CloudinaryConfig {
                cloud_name: or_empty("CLOUDINARY_CLOUD_NAME"),
                api_key: or_empty("CLOUDINARY_API_KEY"),
                api_secret: or_empty("CLOUDINARY_API_SECRET"),
                api_base: get("CLOUDINARY_API_BASE").unwrap_or_else(|| {
                    CloudinaryConfig::DEFAULT_API_BASE.to_owned()
                }),
            }),
            "s3" => StorageConfig::S3(S3Config {
                access_key_id: or_empty("AWS_ACCESS_KEY_ID"),
                secret_access_key: or_empty("AWS_SECRET_ACCESS_KEY"),
                region: get("AWS_REGION")
                    .unwrap_or_else(|| "us-east-1".to_owned()),
                bucket: get("S3_BUCKET")
                    .context("S3_BUCKET is required for the s3 provider")?,
                endpoint: get("S3_ENDPOINT"),
                public_url: get("S3_PUBLIC_URL"),
            }),
            other => bail!("unknown STORAGE_PROVIDER {other:?}"),
        };

        Ok(Config {
            bind_addr,
            database_url,
            session_secret,
            allowed_origins,
            storage,
        })
    }
}
