//! Remote command construction.
//!
//! Commands are built as argv vectors and carry a redacted display form for
//! logs and error messages. Passwords never appear in the display form.

use crate::config::PlatformConfig;
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;

pub const RESET_SCRIPT_NAME: &str = "reset-repos.sh";

const REDACTED: &str = "********";

/// Credentials of the document database, decoded from the cluster secret.
#[derive(Clone)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
    pub admin_password: String,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("admin_password", &REDACTED)
            .finish()
    }
}

impl DatabaseCredentials {
    /// Decode `user`, `password` and `admin_password` from secret data.
    pub fn from_secret(secret_name: &str, data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            let raw = data.get(key).ok_or_else(|| {
                BackupError::Config(format!("secret {} has no field {}", secret_name, key))
            })?;
            String::from_utf8(raw.clone()).map_err(|_| {
                BackupError::Config(format!("secret {} field {} is not UTF-8", secret_name, key))
            })
        };

        Ok(Self {
            user: field("user")?,
            password: field("password")?,
            admin_password: field("admin_password")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub argv: Vec<String>,
    display: String,
}

impl RemoteCommand {
    /// A command whose argv is safe to show as-is.
    pub fn plain(argv: Vec<String>) -> Self {
        let display = argv.join(" ");
        Self { argv, display }
    }

    pub fn display(&self) -> &str {
        &self.display
    }
}

/// `mongodump` of the instance database into the remote dump path.
pub fn dump_command(platform: &PlatformConfig, creds: &DatabaseCredentials) -> RemoteCommand {
    let args = |password: &str| {
        vec![
            "mongodump".to_string(),
            format!("--host={}", platform.database_host),
            format!("--username={}", creds.user),
            format!("--password={}", password),
            format!("--authenticationDatabase={}", platform.database_name),
            format!("--db={}", platform.database_name),
            format!("--out={}", platform.remote_dump_path),
        ]
    };
    RemoteCommand {
        argv: args(&creds.password),
        display: args(REDACTED).join(" "),
    }
}

/// `mongorestore` of the pushed dump, limited to the instance database.
pub fn restore_command(platform: &PlatformConfig, creds: &DatabaseCredentials) -> RemoteCommand {
    let args = |password: &str| {
        vec![
            "mongorestore".to_string(),
            format!("--host={}", platform.database_host),
            format!("--username={}", creds.user),
            format!("--password={}", password),
            format!("--authenticationDatabase={}", platform.database_name),
            format!("--nsInclude={}.*", platform.database_name),
            platform.remote_dump_path.clone(),
        ]
    };
    RemoteCommand {
        argv: args(&creds.password),
        display: args(REDACTED).join(" "),
    }
}

/// Script that makes every repository under `data_path` re-read its
/// restored state.
pub fn reset_script(data_path: &str) -> String {
    format!(
        r#"#!/bin/sh
set -e
find {root} -type d -name .git -prune | while read -r gitdir; do
    repo=$(dirname "$gitdir")
    echo "Resetting $repo"
    git -C "$repo" reset --hard
done
"#,
        root = shell_quote(data_path)
    )
}

/// Remove `path` inside the workload. Succeeds when it does not exist.
pub fn remove_dir_command(path: &str) -> RemoteCommand {
    RemoteCommand::plain(vec![
        "rm".to_string(),
        "-rf".to_string(),
        "--".to_string(),
        path.to_string(),
    ])
}

pub fn chmod_command(script_path: &str) -> RemoteCommand {
    RemoteCommand::plain(vec![
        "chmod".to_string(),
        "+x".to_string(),
        script_path.to_string(),
    ])
}

pub fn run_script_command(script_path: &str) -> RemoteCommand {
    RemoteCommand::plain(vec![script_path.to_string()])
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
