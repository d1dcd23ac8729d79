//! The operations the CLI and HTTP layers call.  Everything returns typed
//! results or a [`ControlError`]; no protocol bytes leak out of here.
use std::sync::Arc;
use std::time::Duration;

use hqp_proto::config::Config;
use hqp_proto::{ControlError, PlaybackStatus, VolumeBounds, VolumeDb};
use serde::Serialize;
use tracing::warn;

use crate::client::{ClientOptions, ControlClient, Direction};
use crate::store::{self, validate_profile_id, ProfileRef, ProfileStore};
use crate::switch::{PollPolicy, SwitchOrchestrator, SwitchPhase, SwitchResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEntry {
    #[serde(flatten)]
    pub profile: ProfileRef,
    pub current: bool,
}

pub struct Controller {
    client: Arc<ControlClient>,
    store: Arc<dyn ProfileStore>,
    orchestrator: SwitchOrchestrator,
}

impl Controller {
    pub fn new(client: Arc<ControlClient>, store: Arc<dyn ProfileStore>, policy: PollPolicy) -> Self {
        let orchestrator = SwitchOrchestrator::new(store.clone(), client.clone(), policy);
        Self {
            client,
            store,
            orchestrator,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ControlError> {
        let client = Arc::new(ControlClient::new(ClientOptions::from_config(
            &config.hqplayer,
        )?));
        let store = store::from_config(&config.profiles, &config.hqplayer.host);
        Ok(Self::new(
            client,
            store,
            PollPolicy::from_config(&config.switch),
        ))
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    pub fn host(&self) -> &str {
        self.store.host()
    }

    // ── Playback ──────────────────────────────────────────────────────────────

    pub async fn get_status(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.get_status().await
    }

    pub async fn set_volume(&self, value: VolumeDb) -> Result<PlaybackStatus, ControlError> {
        self.client.set_volume(value).await
    }

    pub async fn adjust_volume(
        &self,
        step: VolumeDb,
        direction: Direction,
    ) -> Result<PlaybackStatus, ControlError> {
        self.client.adjust_volume(step, direction).await
    }

    pub async fn volume_range(&self) -> Result<VolumeBounds, ControlError> {
        self.client.volume_range().await
    }

    pub async fn play(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.play().await
    }

    pub async fn pause(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.pause().await
    }

    pub async fn stop(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.stop().await
    }

    pub async fn next(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.next().await
    }

    pub async fn previous(&self) -> Result<PlaybackStatus, ControlError> {
        self.client.previous().await
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    /// All profiles, with the active one marked when it can be determined.
    pub async fn list_profiles(&self) -> Result<Vec<ProfileEntry>, ControlError> {
        let profiles = self.store.list().await?;
        let current = self.current_profile_lenient().await;
        Ok(profiles
            .into_iter()
            .map(|profile| ProfileEntry {
                current: current.as_ref().is_some_and(|c| c.id == profile.id),
                profile,
            })
            .collect())
    }

    pub async fn current_profile(&self) -> Result<Option<ProfileRef>, ControlError> {
        self.store.current_id().await
    }

    /// Like [`current_profile`](Self::current_profile) but an unreachable
    /// store just means "unknown".
    pub async fn current_profile_lenient(&self) -> Option<ProfileRef> {
        match self.store.current_id().await {
            Ok(current) => current,
            Err(e) => {
                warn!("Could not determine current profile: {}", e);
                None
            }
        }
    }

    pub async fn switch_profile(
        &self,
        id: &str,
        wait: bool,
        budget: Option<Duration>,
    ) -> Result<SwitchResult, ControlError> {
        self.orchestrator.switch(id, wait, budget).await
    }

    pub fn switch_phase(&self) -> SwitchPhase {
        self.orchestrator.phase()
    }

    pub async fn save_profile(&self, id: &str) -> Result<ProfileRef, ControlError> {
        validate_profile_id(id)?;
        self.store.save_current_as(id).await
    }

    pub async fn delete_profile(&self, id: &str) -> Result<(), ControlError> {
        validate_profile_id(id)?;
        // Refuse while a switch may be copying this very file.
        let _lease = self.orchestrator.locks().try_acquire(self.store.host())?;
        self.store.delete(id).await
    }
}
