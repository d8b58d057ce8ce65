use std::{fmt, path::PathBuf};

use crate::{
    cmd::Invocation,
    config::{Configuration, Filesystem, Partition, PartitionSize, PartitionTable},
    env::Environment,
    error::{ExecuteError, PreconditionError, RollbackError},
    steps::{undo_all, Phase, Step, StepContext},
};

pub const NAME: &str = "disk-setup";

/// Partitions the target disk, creates filesystems and mounts the new
/// tree under `mount_root`.
///
/// Not idempotent: running it twice would wipe what the first run (and
/// every later step) put on the disk.
#[derive(Debug, Default)]
pub struct DiskSetup;

// ── Layout planning ───────────────────────────────────────────────────────────

/// Device path of partition `n` on `disk` (`/dev/sda3`, `/dev/nvme0n1p3`).
pub fn part_path(disk: &str, n: usize) -> String {
    if disk.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        format!("{}p{}", disk, n)
    } else {
        format!("{}{}", disk, n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Boundary {
    MiB(u64),
    Percent(f64),
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::MiB(m) => write!(f, "{}MiB", m),
            Boundary::Percent(p) => write!(f, "{}%", p),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedPartition<'a> {
    number: usize,
    device: String,
    start: Boundary,
    end: Boundary,
    partition: &'a Partition,
}

/// Lays partitions out in configuration order. Fixed sizes are placed
/// first from 1MiB; percentage partitions end at the running percentage
/// of the whole disk.
fn plan(config: &Configuration) -> Vec<PlannedPartition<'_>> {
    let mut cursor = Boundary::MiB(1);
    let mut percent = 0.0;

    config
        .partitions
        .iter()
        .enumerate()
        .map(|(i, partition)| {
            let start = cursor;
            let end = match (partition.size, cursor) {
                (PartitionSize::Bytes(b), Boundary::MiB(m)) => {
                    Boundary::MiB(m.saturating_add(b.div_ceil(1 << 20)))
                }
                // validation keeps fixed sizes ahead of percentages
                (PartitionSize::Bytes(_), Boundary::Percent(p)) => Boundary::Percent(p),
                (PartitionSize::Percent(p), _) => {
                    percent = (percent + p).min(100.0);
                    Boundary::Percent(percent)
                }
            };
            cursor = end;
            PlannedPartition {
                number: i + 1,
                device: part_path(&config.target_disk, i + 1),
                start,
                end,
                partition,
            }
        })
        .collect()
}

/// Checks planned boundaries against the real disk: everything must fit
/// and every partition must end after it starts.
fn layout_conflict(planned: &[PlannedPartition<'_>], disk_size: u64) -> Option<String> {
    let offset = |b: Boundary| match b {
        Boundary::MiB(m) => m.saturating_mul(1 << 20),
        Boundary::Percent(p) => (disk_size as f64 * p / 100.0) as u64,
    };
    planned.iter().find_map(|p| {
        let (start, end) = (offset(p.start), offset(p.end));
        if end > disk_size {
            Some(format!(
                "{} would end at {} but the disk holds only {} bytes",
                p.device, p.end, disk_size
            ))
        } else if end <= start {
            Some(format!(
                "{} would end at {} before its start at {}",
                p.device, p.end, p.start
            ))
        } else {
            None
        }
    })
}

fn parted_fs_type(fs: Filesystem) -> &'static str {
    match fs {
        Filesystem::Ext4 => "ext4",
        Filesystem::Xfs => "xfs",
        Filesystem::Btrfs => "btrfs",
        Filesystem::Vfat => "fat32",
        Filesystem::Swap => "linux-swap",
    }
}

fn mkfs(fs: Filesystem, device: &str) -> Invocation {
    match fs {
        Filesystem::Ext4 => Invocation::new("mkfs.ext4", ["-F", device]),
        Filesystem::Xfs => Invocation::new("mkfs.xfs", ["-f", device]),
        Filesystem::Btrfs => Invocation::new("mkfs.btrfs", ["-f", device]),
        Filesystem::Vfat => Invocation::new("mkfs.vfat", ["-F", "32", device]),
        Filesystem::Swap => Invocation::new("mkswap", [device]),
    }
}

fn mkfs_program(fs: Filesystem) -> &'static str {
    match fs {
        Filesystem::Ext4 => "mkfs.ext4",
        Filesystem::Xfs => "mkfs.xfs",
        Filesystem::Btrfs => "mkfs.btrfs",
        Filesystem::Vfat => "mkfs.vfat",
        Filesystem::Swap => "mkswap",
    }
}

/// Mount order: shallow mount points before the ones nested inside them.
fn mount_order<'a>(planned: &'a [PlannedPartition<'a>]) -> Vec<&'a PlannedPartition<'a>> {
    let mut mounts: Vec<_> = planned.iter().filter(|p| !p.partition.is_swap()).collect();
    mounts.sort_by_key(|p| {
        let mp = p.partition.mount_point.trim_end_matches('/');
        (mp.matches('/').count(), mp.len())
    });
    mounts
}

// ── Step ──────────────────────────────────────────────────────────────────────

impl Step for DiskSetup {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::DiskSetup
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn revocable(&self) -> bool {
        true
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        if env.is_complete(NAME) {
            return Err(PreconditionError::new(format!(
                "{} was already partitioned and formatted by a previous run",
                config.target_disk
            ))
            .with_remedy("refusing to re-format; continue with --resume or wipe the disk by hand"));
        }

        env.require_root()?;
        env.require_tool("parted")?;
        for p in &config.partitions {
            env.require_tool(mkfs_program(p.filesystem))?;
        }

        let disk = env.disk(&config.target_disk).ok_or_else(|| {
            PreconditionError::new(format!("target disk {} not found", config.target_disk))
                .with_remedy("check target_disk against `lsblk`")
        })?;
        if disk.is_mounted() {
            return Err(PreconditionError::new(format!(
                "{} has mounted partitions",
                config.target_disk
            ))
            .with_remedy(format!("umount every partition of {} first", config.target_disk)));
        }

        if disk.size > 0 {
            if let Some(reason) = layout_conflict(&plan(config), disk.size) {
                return Err(PreconditionError::new(reason).with_remedy(
                    "shrink the fixed-size partitions or give the percentage partitions more room",
                ));
            }
        }

        Ok(())
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let disk = config.target_disk.as_str();
        let planned = plan(config);

        ctx.progress(2, format!("Clearing old signatures on {}", disk));
        ctx.run("wipe", Invocation::new("wipefs", ["--all", disk]))?;

        let label = match config.partition_table {
            PartitionTable::Gpt => "gpt",
            PartitionTable::Mbr => "msdos",
        };
        ctx.progress(5, format!("Creating {} partition table", label));
        ctx.run("partition", Invocation::new("parted", ["-s", disk, "mklabel", label]))?;

        let total = planned.len().max(1);
        for (i, p) in planned.iter().enumerate() {
            ctx.progress(
                (10 + 30 * i / total) as u8,
                format!("Creating {} ({} → {})", p.device, p.partition.mount_point, p.partition.size),
            );
            let name = match config.partition_table {
                PartitionTable::Gpt => partition_label(p.partition),
                PartitionTable::Mbr => "primary".to_string(),
            };
            ctx.run(
                "partition",
                Invocation::new(
                    "parted",
                    [
                        "-s".to_string(),
                        "-a".to_string(),
                        "optimal".to_string(),
                        disk.to_string(),
                        "mkpart".to_string(),
                        name,
                        parted_fs_type(p.partition.filesystem).to_string(),
                        p.start.to_string(),
                        p.end.to_string(),
                    ],
                ),
            )?;
            if config.esp().is_some_and(|esp| std::ptr::eq(esp, p.partition)) {
                let flag = match config.partition_table {
                    PartitionTable::Gpt => "esp",
                    PartitionTable::Mbr => "boot",
                };
                ctx.run(
                    "partition",
                    Invocation::new("parted", ["-s", disk, "set", &p.number.to_string(), flag, "on"]),
                )?;
            }
        }

        for (i, p) in planned.iter().enumerate() {
            ctx.progress(
                (40 + 30 * i / total) as u8,
                format!("Formatting {} as {}", p.device, p.partition.filesystem),
            );
            ctx.run("format", mkfs(p.partition.filesystem, &p.device))?;
        }

        let mounts = mount_order(&planned);
        for (i, p) in mounts.iter().enumerate() {
            let target = config.target_path(&p.partition.mount_point);
            ctx.progress(
                (70 + 25 * i / mounts.len().max(1)) as u8,
                format!("Mounting {} → {}", p.device, target.display()),
            );
            let target = target.display().to_string();
            ctx.run("mount", Invocation::new("mkdir", ["-p", target.as_str()]))?;
            ctx.run("mount", Invocation::new("mount", [p.device.as_str(), target.as_str()]))?;
        }

        if let Some(swap) = planned.iter().find(|p| p.partition.is_swap()) {
            ctx.progress(97, format!("Activating swap on {}", swap.device));
            ctx.run("swap", Invocation::new("swapon", [swap.device.as_str()]))?;
        }

        ctx.progress(100, format!("{} ready under {}", disk, config.mount_root.display()));
        Ok(())
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        let config = ctx.config();
        let planned = plan(config);
        let root = config.mount_root.display().to_string();

        ctx.progress(0, format!("Unmounting {}", root));
        let mut actions = Vec::new();
        if let Some(swap) = planned.iter().find(|p| p.partition.is_swap()) {
            actions.push(ctx.undo(Invocation::new("swapoff", [swap.device.as_str()])));
        }
        actions.push(ctx.undo(Invocation::new("umount", ["-R", root.as_str()])));
        undo_all(actions)
    }

    fn apply_postconditions(&self, config: &Configuration, env: &mut Environment) {
        for p in plan(config).iter().filter(|p| !p.partition.is_swap()) {
            let target: PathBuf = config.target_path(&p.partition.mount_point);
            env.record_mount(target, p.device.clone());
        }
    }
}

fn partition_label(p: &Partition) -> String {
    match p.mount_point.as_str() {
        "/" => "root".to_string(),
        "swap" => "swap".to_string(),
        "/boot/efi" | "/boot" if p.filesystem == Filesystem::Vfat => "esp".to_string(),
        other => other.trim_matches('/').replace('/', "-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLayer;

    fn config(yaml: &str) -> Configuration {
        ConfigLayer::defaults()
            .merge(ConfigLayer::from_yaml(yaml).unwrap())
            .validate()
            .unwrap()
    }

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(part_path("/dev/sda", 3), "/dev/sda3");
        assert_eq!(part_path("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(part_path("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
    }

    #[test]
    fn plans_fixed_then_percentage_boundaries() {
        let config = ConfigLayer::defaults().validate().unwrap();
        let planned = plan(&config);
        let bounds: Vec<_> = planned
            .iter()
            .map(|p| (p.device.as_str(), p.start.to_string(), p.end.to_string()))
            .collect();
        assert_eq!(
            bounds,
            vec![
                ("/dev/sda1", "1MiB".to_string(), "1025MiB".to_string()),
                ("/dev/sda2", "1025MiB".to_string(), "5121MiB".to_string()),
                ("/dev/sda3", "5121MiB".to_string(), "100%".to_string()),
            ]
        );
    }

    #[test]
    fn percentages_accumulate() {
        let config = config(
            "partitions:\n  - { mount_point: /, size: 60%, filesystem: ext4 }\n  - { mount_point: /home, size: 40%, filesystem: xfs }\n",
        );
        let planned = plan(&config);
        assert_eq!(planned[0].end, Boundary::Percent(60.0));
        assert_eq!(planned[1].start, Boundary::Percent(60.0));
        assert_eq!(planned[1].end, Boundary::Percent(100.0));
    }

    #[test]
    fn mounts_root_before_nested_points() {
        let config = config(
            "partitions:\n  - { mount_point: /boot/efi, size: 512M, filesystem: vfat }\n  - { mount_point: /home, size: 30%, filesystem: xfs }\n  - { mount_point: /, size: 70%, filesystem: ext4 }\n",
        );
        let planned = plan(&config);
        let order: Vec<_> = mount_order(&planned)
            .iter()
            .map(|p| p.partition.mount_point.as_str())
            .collect();
        assert_eq!(order, vec!["/", "/home", "/boot/efi"]);
    }

    #[test]
    fn refuses_to_reformat_after_prior_success() {
        let config = ConfigLayer::defaults().validate().unwrap();
        let mut env = Environment::simulated(&config);
        assert!(DiskSetup.check_precondition(&config, &env).is_ok());

        env.mark_complete(NAME);
        let err = DiskSetup.check_precondition(&config, &env).unwrap_err();
        assert!(err.reason.contains("already partitioned"));
    }

    #[test]
    fn refuses_missing_or_mounted_disk() {
        let config = ConfigLayer::defaults().validate().unwrap();
        let mut env = Environment::simulated(&config);
        env.disks[0].partitions.push(crate::lsblk::BlockPartition {
            path: "/dev/sda1".to_string(),
            fstype: Some("ext4".to_string()),
            mountpoint: Some("/".to_string()),
        });
        assert!(DiskSetup
            .check_precondition(&config, &env)
            .unwrap_err()
            .reason
            .contains("mounted"));

        env.disks.clear();
        assert!(DiskSetup
            .check_precondition(&config, &env)
            .unwrap_err()
            .reason
            .contains("not found"));
    }

    #[test]
    fn percentages_must_land_past_the_fixed_partitions() {
        let config = config(
            "partitions:\n  - { mount_point: /boot, size: 20G, filesystem: ext4 }\n  - { mount_point: /, size: 50%, filesystem: ext4 }\n  - { mount_point: /home, size: 50%, filesystem: xfs }\n",
        );
        let mut env = Environment::simulated(&config);
        env.disks[0].size = 30 << 30;
        let err = DiskSetup.check_precondition(&config, &env).unwrap_err();
        assert!(err.reason.contains("/dev/sda2"), "{}", err.reason);
        assert!(err.reason.contains("before its start"), "{}", err.reason);

        env.disks[0].size = 100 << 30;
        assert!(DiskSetup.check_precondition(&config, &env).is_ok());
    }

    #[test]
    fn oversized_fixed_partitions_are_refused_without_overflow() {
        let config = config(
            "partitions:\n  - { mount_point: /srv, size: 16000000T, filesystem: xfs }\n  - { mount_point: /var, size: 16000000T, filesystem: xfs }\n  - { mount_point: /, size: 100%, filesystem: ext4 }\n",
        );
        let env = Environment::simulated(&config);
        let err = DiskSetup.check_precondition(&config, &env).unwrap_err();
        assert!(err.reason.contains("/dev/sda1"), "{}", err.reason);
        assert!(err.reason.contains("disk holds only"), "{}", err.reason);
    }

    #[test]
    fn postconditions_record_mounts() {
        let config = ConfigLayer::defaults().validate().unwrap();
        let mut env = Environment::simulated(&config);
        DiskSetup.apply_postconditions(&config, &mut env);
        assert!(env.is_mounted(&config.mount_root));
        assert!(env.is_mounted(&config.mount_root.join("boot/efi")));
    }
}
