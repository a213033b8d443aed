use std::path::PathBuf;

use clap::Parser;
use common::types::UserId;

/// Process configuration for a self-hosted deployment.
#[derive(Parser, Clone, Debug)]
#[clap(name = "cumulus-backend")]
pub struct LocalConfig {
    #[clap(long, default_value = "127.0.0.1")]
    pub interface: String,

    #[clap(long, default_value_t = 3210)]
    pub port: u16,

    /// Path of the SQLite metadata database.
    #[clap(long, default_value = "cumulus.sqlite3")]
    pub db_path: PathBuf,

    /// Root directory for the local storage backend. Ignored when an S3
    /// bucket is configured.
    #[clap(long, default_value = "cumulus_storage")]
    pub storage_dir: PathBuf,

    /// Store bytes in this S3-compatible bucket instead of the local
    /// filesystem. Credentials come from the usual AWS environment.
    #[clap(long)]
    pub s3_bucket: Option<String>,

    #[clap(long, default_value = "")]
    pub s3_key_prefix: String,

    /// Hex-encoded 32-byte secret used to sign upload tokens. Generated
    /// fresh on every start when absent, which invalidates in-flight
    /// multipart uploads across restarts.
    #[clap(long, env = "INSTANCE_SECRET")]
    pub instance_secret: Option<String>,

    /// `<token>=<user uuid>` pairs accepted as bearer sessions. Repeatable.
    #[clap(long = "access-token", value_parser = parse_access_token)]
    pub access_tokens: Vec<(String, UserId)>,
}

fn parse_access_token(raw: &str) -> Result<(String, UserId), String> {
    let (token, user) = raw
        .split_once('=')
        .ok_or_else(|| "expected <token>=<user uuid>".to_string())?;
    if token.is_empty() {
        return Err("token must not be empty".to_string());
    }
    let owner_id: UserId = user
        .parse()
        .map_err(|e| format!("bad user id {user:?}: {e}"))?;
    Ok((token.to_string(), owner_id))
}
