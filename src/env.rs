//! Read-only snapshot of the machine the installer runs on.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cmd::{self, System},
    config::Configuration,
    error::PreconditionError,
    lsblk::{self, Disk},
};

/// Tools every installation needs on the install medium.
pub const CORE_TOOLS: &[&str] = &[
    "parted", "wipefs", "mkfs.ext4", "mkswap", "swapon", "swapoff", "mount", "umount", "wget",
    "tar", "chroot",
];

/// Tools only some layouts need.
pub const OPTIONAL_TOOLS: &[&str] = &["mkfs.vfat", "mkfs.xfs", "mkfs.btrfs", "gpg", "genfstab"];

fn known_tools() -> impl Iterator<Item = &'static str> {
    CORE_TOOLS.iter().chain(OPTIONAL_TOOLS).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootMode {
    Uefi,
    Bios,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootMode::Uefi => "UEFI",
            BootMode::Bios => "BIOS",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub is_root: bool,
    pub boot_mode: BootMode,
    pub disks: Vec<Disk>,
    /// Mount point → device.
    pub mounts: BTreeMap<PathBuf, String>,
    pub tools: BTreeSet<String>,
    /// Names of steps whose effects are already in place.
    pub completed: BTreeSet<String>,
}

impl Environment {
    /// Reads the live host. Individual probe failures degrade to "absent".
    pub fn probe(system: &dyn System) -> Self {
        let disks = lsblk::list_disks(system).unwrap_or_else(|e| {
            warn!("Could not list block devices: {}", e);
            Vec::new()
        });

        let env = Self {
            is_root: effective_uid() == Some(0),
            boot_mode: detect_boot_mode(Path::new("/sys/firmware/efi")),
            disks,
            mounts: fs::read_to_string("/proc/mounts")
                .map(|s| parse_mounts(&s))
                .unwrap_or_default(),
            tools: known_tools()
                .filter(|t| cmd::is_available(t))
                .map(str::to_string)
                .collect(),
            completed: BTreeSet::new(),
        };
        debug!(
            boot_mode = %env.boot_mode,
            disks = env.disks.len(),
            tools = env.tools.len(),
            "Environment probed"
        );
        env
    }

    /// What a dry run assumes: root with the target disk present and
    /// unmounted, every tool installed, and firmware matching the layout
    /// (UEFI when it has an EFI system partition).
    pub fn simulated(config: &Configuration) -> Self {
        Self {
            is_root: true,
            boot_mode: if config.esp().is_some() {
                BootMode::Uefi
            } else {
                BootMode::Bios
            },
            disks: vec![Disk {
                path: config.target_disk.clone(),
                size: 256 << 30,
                model: "simulated".to_string(),
                partitions: Vec::new(),
            }],
            mounts: BTreeMap::new(),
            tools: known_tools().map(str::to_string).collect(),
            completed: BTreeSet::new(),
        }
    }

    pub fn disk(&self, path: &str) -> Option<&Disk> {
        self.disks.iter().find(|d| d.path == path)
    }

    pub fn is_mounted(&self, mount_point: &Path) -> bool {
        self.mounts.contains_key(mount_point)
    }

    pub fn is_complete(&self, step: &str) -> bool {
        self.completed.contains(step)
    }

    pub fn mark_complete(&mut self, step: &str) {
        self.completed.insert(step.to_string());
    }

    pub fn record_mount(&mut self, mount_point: PathBuf, device: String) {
        self.mounts.insert(mount_point, device);
    }

    // ── Precondition helpers ──────────────────────────────────────────────────

    /// Core tools absent from this environment.
    pub fn missing_core_tools(&self) -> Vec<String> {
        CORE_TOOLS
            .iter()
            .filter(|t| !self.tools.contains(**t))
            .map(|t| t.to_string())
            .collect()
    }

    pub fn require_root(&self) -> Result<(), PreconditionError> {
        if self.is_root {
            Ok(())
        } else {
            Err(PreconditionError::new("installer is not running as root")
                .with_remedy("re-run with sudo"))
        }
    }

    pub fn require_tool(&self, tool: &str) -> Result<(), PreconditionError> {
        if self.tools.contains(tool) {
            Ok(())
        } else {
            Err(PreconditionError::new(format!("required tool '{}' is not installed", tool))
                .with_remedy(format!("emerge --ask {}", cmd::package_for(tool))))
        }
    }

    pub fn require_complete(&self, step: &str) -> Result<(), PreconditionError> {
        if self.is_complete(step) {
            Ok(())
        } else {
            Err(PreconditionError::new(format!("step '{}' has not completed", step))
                .with_remedy("run the installation from the beginning or use --resume"))
        }
    }

    pub fn require_mounted(&self, mount_point: &Path) -> Result<(), PreconditionError> {
        if self.is_mounted(mount_point) {
            Ok(())
        } else {
            Err(PreconditionError::new(format!(
                "nothing is mounted at {}",
                mount_point.display()
            ))
            .with_remedy("mount the target root filesystem or re-run disk setup"))
        }
    }
}

/// Reads the effective UID from `/proc/self/status`.
fn effective_uid() -> Option<u32> {
    fs::read_to_string("/proc/self/status").ok().and_then(|s| {
        s.lines()
            .find(|l| l.starts_with("Uid:"))
            .and_then(|l| l.split_whitespace().nth(2))
            .and_then(|v| v.parse::<u32>().ok())
    })
}

/// UEFI firmware exposes `/sys/firmware/efi`; BIOS boots do not.
fn detect_boot_mode(efi_dir: &Path) -> BootMode {
    if efi_dir.exists() {
        BootMode::Uefi
    } else {
        BootMode::Bios
    }
}

/// Parses `/proc/mounts` into mount point → device.
fn parse_mounts(content: &str) -> BTreeMap<PathBuf, String> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            // /proc/mounts escapes spaces as \040
            Some((
                PathBuf::from(mount_point.replace("\\040", " ")),
                device.to_string(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLayer;

    #[test]
    fn simulated_environment_has_target_disk() {
        let config = ConfigLayer::defaults().validate().unwrap();
        let env = Environment::simulated(&config);
        assert!(env.is_root);
        assert_eq!(env.boot_mode, BootMode::Uefi);
        assert!(env.disk("/dev/sda").is_some());
        assert!(env.require_tool("parted").is_ok());
        assert!(env.completed.is_empty());
    }

    #[test]
    fn simulated_firmware_follows_layout() {
        let config = ConfigLayer::defaults()
            .merge(ConfigLayer::from_yaml("partitions:\n  - {mount_point: /, size: 100%, filesystem: ext4}\n").unwrap())
            .validate()
            .unwrap();
        assert_eq!(Environment::simulated(&config).boot_mode, BootMode::Bios);
    }

    #[test]
    fn parses_proc_mounts() {
        let mounts = parse_mounts(
            "/dev/sda3 /mnt/gentoo ext4 rw 0 0\nproc /proc proc rw 0 0\n/dev/sdb1 /media/my\\040stick vfat rw 0 0\n",
        );
        assert_eq!(mounts.get(Path::new("/mnt/gentoo")).map(String::as_str), Some("/dev/sda3"));
        assert!(mounts.contains_key(Path::new("/media/my stick")));
    }

    #[test]
    fn missing_tool_names_its_package() {
        let mut env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());
        env.tools.clear();
        let err = env.require_tool("mkfs.ext4").unwrap_err();
        assert_eq!(err.remedy.as_deref(), Some("emerge --ask sys-fs/e2fsprogs"));
    }

    #[test]
    fn boot_mode_follows_efi_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_boot_mode(dir.path()), BootMode::Uefi);
        assert_eq!(detect_boot_mode(&dir.path().join("missing")), BootMode::Bios);
    }
}
