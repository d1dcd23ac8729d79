//! Profile storage: the saved `<id>.xml` configurations and the privileged
//! actions that make one of them the daemon's active configuration.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hqp_proto::config::{ProfileMode, ProfilesConfig};
use hqp_proto::ControlError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::exec::{quote_path, ExecError, ExecOutput, Executor, LocalExecutor, SshExecutor};

const PROFILE_EXTENSION: &str = "xml";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    pub display_name: String,
}

impl ProfileRef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let id = name.strip_suffix(".xml")?;
        validate_profile_id(id).ok()?;
        Some(Self::new(id))
    }
}

/// Ids become file names, so anything that could escape the profile
/// directory is refused.
pub fn validate_profile_id(id: &str) -> Result<(), ControlError> {
    if id.is_empty() {
        return Err(ControlError::invalid_argument("profile id is empty"));
    }
    if id.starts_with('.') || id.contains('/') || id.contains('\0') {
        return Err(ControlError::invalid_argument(format!(
            "invalid profile id {id:?}"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Host whose active configuration this store mutates.
    fn host(&self) -> &str;

    async fn list(&self) -> Result<Vec<ProfileRef>, ControlError>;

    /// The profile whose contents match the active configuration, if any.
    async fn current_id(&self) -> Result<Option<ProfileRef>, ControlError>;

    /// Make `id` the active configuration.
    async fn activate(&self, id: &str) -> Result<(), ControlError>;

    /// Restart the daemon so it picks up the active configuration.
    async fn restart(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn save_current_as(&self, id: &str) -> Result<ProfileRef, ControlError> {
        Err(ControlError::invalid_argument(format!(
            "saving profile {id:?} is not supported by this store"
        )))
    }

    async fn delete(&self, id: &str) -> Result<(), ControlError> {
        Err(ControlError::invalid_argument(format!(
            "deleting profile {id:?} is not supported by this store"
        )))
    }
}

/// Build the store selected by `[profiles] mode`.
pub fn from_config(config: &ProfilesConfig, host: &str) -> Arc<dyn ProfileStore> {
    match config.mode {
        ProfileMode::Local => Arc::new(LocalProfileStore::new(
            &config.profiles_path,
            &config.config_path,
            LocalExecutor::new(config.exec_timeout()),
            &config.restart_command,
        )),
        ProfileMode::Ssh => {
            let exec = SshExecutor::new(host, &config.ssh_user, config.exec_timeout())
                .with_key(config.ssh_key_path.clone());
            Arc::new(RemoteProfileStore::new(
                exec,
                &config.profiles_path,
                &config.config_path,
                &config.restart_command,
            ))
        }
    }
}

// ── Remote (shell) store ──────────────────────────────────────────────────────

/// Profile files on a host reached through an [`Executor`]; every action is
/// one shell command.
pub struct RemoteProfileStore<E: Executor> {
    exec: E,
    profiles_path: PathBuf,
    config_path: PathBuf,
    restart_command: String,
}

impl<E: Executor> RemoteProfileStore<E> {
    pub fn new(
        exec: E,
        profiles_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        restart_command: impl Into<String>,
    ) -> Self {
        Self {
            exec,
            profiles_path: profiles_path.into(),
            config_path: config_path.into(),
            restart_command: restart_command.into(),
        }
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.profiles_path.join(format!("{id}.{PROFILE_EXTENSION}"))
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, ExecError> {
        self.exec.run(command).await
    }
}

#[async_trait]
impl<E: Executor> ProfileStore for RemoteProfileStore<E> {
    fn host(&self) -> &str {
        self.exec.host()
    }

    async fn list(&self) -> Result<Vec<ProfileRef>, ControlError> {
        let out = self
            .run(&format!("ls -1 {}", quote_path(&self.profiles_path)))
            .await
            .map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(ControlError::StoreUnavailable(out.failure_reason()));
        }
        Ok(parse_listing(out.stdout.lines()))
    }

    async fn current_id(&self) -> Result<Option<ProfileRef>, ControlError> {
        // One round trip: the active file first, then every profile.
        let command = format!(
            "md5sum {} {}/*.{}",
            quote_path(&self.config_path),
            quote_path(&self.profiles_path),
            PROFILE_EXTENSION
        );
        let out = self
            .run(&command)
            .await
            .map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;

        let mut sums = out.stdout.lines().filter_map(|line| {
            let (hash, path) = line.split_once(char::is_whitespace)?;
            Some((hash.to_string(), path.trim_start_matches([' ', '*']).to_string()))
        });
        let config = self.config_path.to_string_lossy();
        let active = match sums.next() {
            Some((hash, path)) if path == config => hash,
            // md5sum reports a missing active file on stderr only.
            _ if !out.success() && out.stdout.trim().is_empty() => {
                return Err(ControlError::StoreUnavailable(out.failure_reason()))
            }
            _ => return Ok(None),
        };

        Ok(sums
            .filter(|(hash, _)| *hash == active)
            .filter_map(|(_, path)| {
                let name = Path::new(&path).file_name()?.to_str()?.to_string();
                ProfileRef::from_file_name(&name)
            })
            .next())
    }

    async fn activate(&self, id: &str) -> Result<(), ControlError> {
        validate_profile_id(id)?;
        let command = format!(
            "sudo cp {} {}",
            quote_path(&self.profile_path(id)),
            quote_path(&self.config_path)
        );
        let failed = |reason: String| ControlError::ActivationFailed {
            id: id.to_string(),
            reason,
        };
        let out = self.run(&command).await.map_err(|e| failed(e.to_string()))?;
        if !out.success() {
            return Err(failed(out.failure_reason()));
        }
        info!("Activated profile '{}' on {}", id, self.host());
        Ok(())
    }

    async fn restart(&self) -> Result<(), ControlError> {
        let out = self
            .run(&self.restart_command)
            .await
            .map_err(|e| ControlError::RestartFailed(e.to_string()))?;
        if !out.success() {
            return Err(ControlError::RestartFailed(out.failure_reason()));
        }
        info!("Restart issued on {}", self.host());
        Ok(())
    }

    async fn save_current_as(&self, id: &str) -> Result<ProfileRef, ControlError> {
        validate_profile_id(id)?;
        let command = format!(
            "sudo cp {} {}",
            quote_path(&self.config_path),
            quote_path(&self.profile_path(id))
        );
        let out = self
            .run(&command)
            .await
            .map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(ControlError::StoreUnavailable(out.failure_reason()));
        }
        Ok(ProfileRef::new(id))
    }

    async fn delete(&self, id: &str) -> Result<(), ControlError> {
        validate_profile_id(id)?;
        let path = self.profile_path(id);
        let command = format!(
            "test -e {path} || exit 44; sudo rm -- {path}",
            path = quote_path(&path)
        );
        let out = self
            .run(&command)
            .await
            .map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;
        match out.code {
            Some(0) => Ok(()),
            Some(44) => Err(ControlError::ProfileNotFound(id.to_string())),
            _ => Err(ControlError::StoreUnavailable(out.failure_reason())),
        }
    }
}

fn parse_listing<'a>(names: impl Iterator<Item = &'a str>) -> Vec<ProfileRef> {
    let mut profiles: Vec<ProfileRef> = names
        .map(str::trim)
        .filter_map(ProfileRef::from_file_name)
        .collect();
    profiles.sort_by(|a, b| a.id.cmp(&b.id));
    profiles
}

// ── Local filesystem store ────────────────────────────────────────────────────

/// Profile files on this machine, handled with `tokio::fs`.  Only the
/// restart goes through a shell.
pub struct LocalProfileStore {
    profiles_path: PathBuf,
    config_path: PathBuf,
    exec: LocalExecutor,
    restart_command: String,
}

impl LocalProfileStore {
    pub fn new(
        profiles_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        exec: LocalExecutor,
        restart_command: impl Into<String>,
    ) -> Self {
        Self {
            profiles_path: profiles_path.into(),
            config_path: config_path.into(),
            exec,
            restart_command: restart_command.into(),
        }
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.profiles_path.join(format!("{id}.{PROFILE_EXTENSION}"))
    }

    async fn file_names(&self) -> Result<Vec<String>, ControlError> {
        let unavailable = |e: std::io::Error| {
            ControlError::StoreUnavailable(format!("{}: {}", self.profiles_path.display(), e))
        };
        let mut entries = tokio::fs::read_dir(&self.profiles_path)
            .await
            .map_err(unavailable)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl ProfileStore for LocalProfileStore {
    fn host(&self) -> &str {
        self.exec.host()
    }

    async fn list(&self) -> Result<Vec<ProfileRef>, ControlError> {
        let names = self.file_names().await?;
        Ok(parse_listing(names.iter().map(String::as_str)))
    }

    async fn current_id(&self) -> Result<Option<ProfileRef>, ControlError> {
        let active = match tokio::fs::read(&self.config_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ControlError::StoreUnavailable(format!(
                    "{}: {}",
                    self.config_path.display(),
                    e
                )))
            }
        };
        for profile in self.list().await? {
            match tokio::fs::read(self.profile_path(&profile.id)).await {
                Ok(bytes) if bytes == active => return Ok(Some(profile)),
                Ok(_) => {}
                Err(e) => debug!("Skipping unreadable profile {}: {}", profile.id, e),
            }
        }
        Ok(None)
    }

    async fn activate(&self, id: &str) -> Result<(), ControlError> {
        validate_profile_id(id)?;
        tokio::fs::copy(self.profile_path(id), &self.config_path)
            .await
            .map_err(|e| ControlError::ActivationFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        info!("Activated profile '{}' locally", id);
        Ok(())
    }

    async fn restart(&self) -> Result<(), ControlError> {
        if self.restart_command.trim().is_empty() {
            return Ok(());
        }
        let out = self
            .exec
            .run(&self.restart_command)
            .await
            .map_err(|e| ControlError::RestartFailed(e.to_string()))?;
        if !out.success() {
            return Err(ControlError::RestartFailed(out.failure_reason()));
        }
        info!("Restart issued: {}", self.restart_command);
        Ok(())
    }

    async fn save_current_as(&self, id: &str) -> Result<ProfileRef, ControlError> {
        validate_profile_id(id)?;
        tokio::fs::copy(&self.config_path, self.profile_path(id))
            .await
            .map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;
        Ok(ProfileRef::new(id))
    }

    async fn delete(&self, id: &str) -> Result<(), ControlError> {
        validate_profile_id(id)?;
        match tokio::fs::remove_file(self.profile_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ControlError::ProfileNotFound(id.to_string()))
            }
            Err(e) => Err(ControlError::StoreUnavailable(e.to_string())),
        }
    }
}
