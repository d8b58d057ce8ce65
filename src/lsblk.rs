use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    cmd::{Invocation, System},
    error::CommandError,
};

// ── Data types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub path: String,  // /dev/sda
    pub size: u64,     // bytes
    pub model: String, // SAMSUNG SSD 870
    pub partitions: Vec<BlockPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPartition {
    pub path: String,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
}

impl Disk {
    /// One-line label used in summaries.
    pub fn display(&self) -> String {
        format!(
            "{:<12}  {:>8}   {}",
            self.path,
            format!("{}G", self.size >> 30),
            self.model
        )
    }

    /// `true` when the disk or any of its partitions is mounted.
    pub fn is_mounted(&self) -> bool {
        self.partitions.iter().any(|p| p.mountpoint.is_some())
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Lists block devices of type `disk` together with their partitions.
pub fn list_disks(system: &dyn System) -> Result<Vec<Disk>, CommandError> {
    let output = system.run(&Invocation::new(
        "lsblk",
        ["--pairs", "--bytes", "--output", "NAME,SIZE,TYPE,MODEL,FSTYPE,MOUNTPOINT"],
    ))?;
    Ok(parse(&output))
}

/// Parses `lsblk --pairs` output. Partitions follow their disk.
pub fn parse(output: &str) -> Vec<Disk> {
    let mut disks: Vec<Disk> = Vec::new();

    for line in output.lines() {
        let m = parse_pairs(line);
        let name = m.get("NAME").map(String::as_str).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        // lsblk may draw tree glyphs in front of child names
        let name = name.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        let path = format!("/dev/{}", name);
        let non_empty = |key: &str| m.get(key).filter(|s| !s.is_empty()).cloned();

        match m.get("TYPE").map(String::as_str) {
            Some("disk") => disks.push(Disk {
                path,
                size: m.get("SIZE").and_then(|s| s.parse().ok()).unwrap_or(0),
                model: non_empty("MODEL").unwrap_or_else(|| "—".to_string()),
                partitions: Vec::new(),
            }),
            Some("part") => {
                if let Some(disk) = disks.last_mut() {
                    disk.partitions.push(BlockPartition {
                        path,
                        fstype: non_empty("FSTYPE"),
                        mountpoint: non_empty("MOUNTPOINT"),
                    });
                }
            }
            _ => {}
        }
    }

    disks
}

// ── lsblk --pairs parser ──────────────────────────────────────────────────────
//
// Each line looks like:   NAME="sda1" SIZE="536870912" TYPE="part" MOUNTPOINT=""

fn parse_pairs(line: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].split_whitespace().last().unwrap_or("").to_string();
        rest = &rest[eq + 1..];

        if !rest.starts_with('"') {
            break;
        }
        rest = &rest[1..]; // skip opening "

        let Some(close) = rest.find('"') else { break };
        let value = rest[..close].to_string();
        rest = &rest[close + 1..]; // skip closing "

        if !key.is_empty() {
            map.insert(key, value);
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"NAME="sda" SIZE="256060514304" TYPE="disk" MODEL="SAMSUNG SSD 870" FSTYPE="" MOUNTPOINT=""
NAME="sda1" SIZE="536870912" TYPE="part" MODEL="" FSTYPE="vfat" MOUNTPOINT="/boot/efi"
NAME="sda2" SIZE="255522586624" TYPE="part" MODEL="" FSTYPE="ext4" MOUNTPOINT=""
NAME="sr0" SIZE="1073741312" TYPE="rom" MODEL="QEMU DVD-ROM" FSTYPE="iso9660" MOUNTPOINT="/run/media"
NAME="nvme0n1" SIZE="512110190592" TYPE="disk" MODEL="" FSTYPE="" MOUNTPOINT=""
"#;

    #[test]
    fn parses_disks_and_partitions() {
        let disks = parse(SAMPLE);
        assert_eq!(disks.len(), 2);

        let sda = &disks[0];
        assert_eq!(sda.path, "/dev/sda");
        assert_eq!(sda.size, 256060514304);
        assert_eq!(sda.model, "SAMSUNG SSD 870");
        assert_eq!(sda.partitions.len(), 2);
        assert_eq!(sda.partitions[0].mountpoint.as_deref(), Some("/boot/efi"));
        assert_eq!(sda.partitions[1].fstype.as_deref(), Some("ext4"));
        assert!(sda.is_mounted());

        let nvme = &disks[1];
        assert_eq!(nvme.model, "—");
        assert!(nvme.partitions.is_empty());
        assert!(!nvme.is_mounted());
    }

    #[test]
    fn tolerates_garbage_lines() {
        assert!(parse("garbage\nNAME=unquoted\n").is_empty());
    }
}
