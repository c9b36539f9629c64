//! Initiator Controller
//!
//! Idempotent session management on top of the [`Initiator`] port: logging
//! in to a target that already has a session is a no-op, logging out of a
//! target without one is a no-op, and device resolution polls with a bound.

use crate::domain::{DiscoveredTarget, InitiatorRef, IscsiSession, Portal};
use crate::error::{Error, Result};
use crate::lifecycle::retry::RetryPolicy;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of a login request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Established,
    AlreadyActive,
}

fn has_session(sessions: &[IscsiSession], target: &DiscoveredTarget) -> bool {
    sessions
        .iter()
        .any(|s| s.target_iqn == target.iqn && s.portal.address == target.portal.address)
}

/// Session-level operations for the local node
#[derive(Clone)]
pub struct InitiatorController {
    initiator: InitiatorRef,
    device_poll: RetryPolicy,
}

impl InitiatorController {
    pub fn new(initiator: InitiatorRef, device_poll: RetryPolicy) -> Self {
        Self {
            initiator,
            device_poll,
        }
    }

    pub async fn initiator_name(&self) -> Result<String> {
        self.initiator.initiator_name().await
    }

    /// Targets reachable through a portal; rediscovery is safe
    pub async fn discover(&self, portal: &Portal) -> Result<impl Iterator<Item = DiscoveredTarget>> {
        Ok(self.initiator.discover(portal).await?.into_iter())
    }

    pub async fn sessions(&self) -> Result<Vec<IscsiSession>> {
        self.initiator.sessions().await
    }

    /// Log in unless a session to the target already exists
    pub async fn login(&self, target: &DiscoveredTarget) -> Result<LoginOutcome> {
        if has_session(&self.initiator.sessions().await?, target) {
            debug!(iqn = %target.iqn, portal = %target.portal, "Session already active");
            return Ok(LoginOutcome::AlreadyActive);
        }
        self.initiator.login(target).await?;
        Ok(LoginOutcome::Established)
    }

    /// Log out if a session to the target exists
    pub async fn logout(&self, target: &DiscoveredTarget) -> Result<()> {
        if !has_session(&self.initiator.sessions().await?, target) {
            debug!(iqn = %target.iqn, portal = %target.portal, "No session to log out of");
            return Ok(());
        }
        self.initiator.logout(target).await
    }

    /// Discover and log in to every target behind `portals`
    ///
    /// A portal that cannot be reached is skipped; failing every portal is
    /// an error.
    pub async fn login_portals(&self, portals: &[Portal]) -> Result<Vec<DiscoveredTarget>> {
        let targets = self.discover_all(portals).await?;
        let mut established = 0;
        for target in &targets {
            if self.login(target).await? == LoginOutcome::Established {
                established += 1;
            }
        }
        info!(targets = targets.len(), established, "iSCSI sessions ready");
        Ok(targets)
    }

    /// Log out of every target behind `portals`
    pub async fn logout_portals(&self, portals: &[Portal]) -> Result<()> {
        let targets = self.discover_all(portals).await?;
        for target in &targets {
            self.logout(target).await?;
        }
        info!(targets = targets.len(), "iSCSI sessions closed");
        Ok(())
    }

    async fn discover_all(&self, portals: &[Portal]) -> Result<Vec<DiscoveredTarget>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        let mut last_error = None;

        for portal in portals {
            match self.discover(portal).await {
                Ok(found) => targets.extend(found.filter(|t| seen.insert(t.clone()))),
                Err(e) => {
                    warn!(%portal, error = %e, "Discovery failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if targets.is_empty() => Err(e),
            _ => Ok(targets),
        }
    }

    pub async fn rescan(&self) -> Result<()> {
        self.initiator.rescan().await
    }

    /// Single probe for the device carrying `device_id`
    pub async fn find_device(&self, device_id: &str) -> Result<Option<PathBuf>> {
        self.initiator.find_device(device_id).await
    }

    /// Poll until the kernel exposes the device; `DeviceNotReady` past the bound
    pub async fn resolve_device_path(&self, device_id: &str) -> Result<PathBuf> {
        let initiator = &self.initiator;
        let found = self
            .device_poll
            .poll("device path", move || async move {
                initiator.find_device(device_id).await
            })
            .await?;

        found.ok_or_else(|| Error::DeviceNotReady {
            device_id: device_id.to_string(),
            attempts: self.device_poll.max_attempts,
        })
    }

    pub async fn remove_device(&self, path: &Path) -> Result<()> {
        self.initiator.remove_device(path).await
    }
}
