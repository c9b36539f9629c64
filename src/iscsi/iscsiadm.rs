//! open-iscsi backed initiator
//!
//! Drives the host's initiator through `iscsiadm`, identifies block devices
//! with `scsi_id` and removes them through sysfs.

use super::discovery::{is_whole_disk, parse_discovery, parse_initiator_name, parse_sessions};
use crate::domain::{DiscoveredTarget, Initiator, IscsiSession, Portal};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// iscsiadm: session already exists
const EXIT_SESSION_EXISTS: i32 = 15;
/// iscsiadm: no matching objects (sessions, nodes)
const EXIT_NO_OBJECTS: i32 = 21;

/// Host paths used by the initiator
#[derive(Debug, Clone)]
pub struct IscsiAdmConfig {
    pub initiator_file: PathBuf,
    pub iscsiadm: PathBuf,
    pub scsi_id: PathBuf,
    pub device_glob: String,
    pub sysfs_block: PathBuf,
}

impl Default for IscsiAdmConfig {
    fn default() -> Self {
        Self {
            initiator_file: PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
            iscsiadm: PathBuf::from("iscsiadm"),
            scsi_id: PathBuf::from("/lib/udev/scsi_id"),
            device_glob: "/dev/sd*".to_string(),
            sysfs_block: PathBuf::from("/sys/block"),
        }
    }
}

/// Initiator implementation over open-iscsi
#[derive(Debug, Clone, Default)]
pub struct IscsiAdm {
    config: IscsiAdmConfig,
}

impl IscsiAdm {
    pub fn new(config: IscsiAdmConfig) -> Self {
        Self { config }
    }

    /// Run a command; exit codes in `accepted` count as success
    async fn run(&self, program: &Path, args: &[&str], accepted: &[i32]) -> Result<String> {
        let command = format!("{} {}", program.display(), args.join(" "));
        debug!(%command, "Running");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::InitiatorCommand {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        let code = output.status.code();
        if output.status.success() || code.is_some_and(|c| accepted.contains(&c)) {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        Err(Error::InitiatorCommand {
            command,
            reason: format!(
                "exit {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }

    async fn iscsiadm(&self, args: &[&str], accepted: &[i32]) -> Result<String> {
        self.run(&self.config.iscsiadm, args, accepted).await
    }

    /// Page 83 identifier of a SCSI device
    async fn scsi_id(&self, device: &Path) -> Result<String> {
        let device_arg = format!("--device={}", device.display());
        self.run(
            &self.config.scsi_id,
            &["--page=0x83", "--whitelisted", &device_arg],
            &[],
        )
        .await
        .map(|out| out.trim().to_string())
    }
}

#[async_trait]
impl Initiator for IscsiAdm {
    async fn initiator_name(&self) -> Result<String> {
        let path = &self.config.initiator_file;
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        parse_initiator_name(&contents).ok_or_else(|| {
            Error::Configuration(format!("no InitiatorName in {}", path.display()))
        })
    }

    async fn discover(&self, portal: &Portal) -> Result<Vec<DiscoveredTarget>> {
        let portal_arg = portal.to_string();
        let output = self
            .iscsiadm(&["-m", "discovery", "-t", "st", "-p", &portal_arg], &[])
            .await?;
        let targets: Vec<_> = parse_discovery(&output).collect();
        debug!(%portal, targets = targets.len(), "Discovery complete");
        Ok(targets)
    }

    async fn sessions(&self) -> Result<Vec<IscsiSession>> {
        let output = self
            .iscsiadm(&["-m", "session"], &[EXIT_NO_OBJECTS])
            .await?;
        Ok(parse_sessions(&output))
    }

    async fn login(&self, target: &DiscoveredTarget) -> Result<()> {
        self.iscsiadm(
            &["-m", "node", "-T", &target.iqn, "-p", &target.portal.address, "-l"],
            &[EXIT_SESSION_EXISTS],
        )
        .await?;
        info!(iqn = %target.iqn, portal = %target.portal, "Logged in to target");
        Ok(())
    }

    async fn logout(&self, target: &DiscoveredTarget) -> Result<()> {
        self.iscsiadm(
            &["-m", "node", "-T", &target.iqn, "-p", &target.portal.address, "-u"],
            &[EXIT_NO_OBJECTS],
        )
        .await?;
        info!(iqn = %target.iqn, portal = %target.portal, "Logged out of target");
        Ok(())
    }

    async fn rescan(&self) -> Result<()> {
        let started = Instant::now();
        self.iscsiadm(&["-m", "session", "--rescan"], &[EXIT_NO_OBJECTS])
            .await?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Rescan complete");
        Ok(())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<PathBuf>> {
        let paths = glob::glob(&self.config.device_glob).map_err(|e| {
            Error::Configuration(format!("invalid device glob '{}': {}", self.config.device_glob, e))
        })?;

        let wanted = device_id.to_ascii_lowercase();
        for path in paths.flatten() {
            let whole_disk = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_whole_disk);
            if !whole_disk {
                continue;
            }
            match self.scsi_id(&path).await {
                Ok(id) if id.to_ascii_lowercase().contains(&wanted) => {
                    info!(device_id, path = %path.display(), "Found block device");
                    return Ok(Some(path));
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot identify device"),
            }
        }
        Ok(None)
    }

    async fn remove_device(&self, path: &Path) -> Result<()> {
        let Some(name) = path.file_name() else {
            return Err(Error::InvalidArgument(format!(
                "not a device path: {}",
                path.display()
            )));
        };
        let delete = self.config.sysfs_block.join(name).join("device").join("delete");
        if !delete.exists() {
            debug!(path = %path.display(), "Device already removed");
            return Ok(());
        }

        let device = path.to_string_lossy();
        if let Err(e) = self
            .run(Path::new("blockdev"), &["--flushbufs", &device], &[])
            .await
        {
            warn!(path = %device, error = %e, "Failed to flush device buffers");
        }

        tokio::fs::write(&delete, b"1").await.map_err(|e| Error::InitiatorCommand {
            command: format!("write 1 > {}", delete.display()),
            reason: e.to_string(),
        })?;
        info!(path = %device, "Removed SCSI device");
        Ok(())
    }
}
