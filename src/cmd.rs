use std::{
    fmt,
    fs::{self, OpenOptions},
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::debug;

use crate::error::CommandError;

// ── Invocation ────────────────────────────────────────────────────────────────

/// A single black-box system command, described but not yet run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// When set, stdout is appended to this file (`>> path`).
    pub append_stdout_to: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            append_stdout_to: None,
        }
    }

    /// Runs `program` inside the target tree rooted at `root`.
    pub fn chroot<I, S>(root: &Path, program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![root.display().to_string(), program.to_string()];
        all.extend(args.into_iter().map(Into::into));
        Self::new("chroot", all)
    }

    pub fn append_stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.append_stdout_to = Some(path.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        if let Some(ref path) = self.append_stdout_to {
            write!(f, " >> {}", path.display())?;
        }
        Ok(())
    }
}

// ── System seam ───────────────────────────────────────────────────────────────

/// The privileged operations steps depend on. Every effect a step has on
/// the machine goes through here, so a test double can stand in for it.
pub trait System: Send + Sync {
    /// Runs a command and returns its captured stdout.
    fn run(&self, invocation: &Invocation) -> Result<String, CommandError>;

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), CommandError>;

    fn remove_file(&self, path: &Path) -> Result<(), CommandError>;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

// ── Host implementation ───────────────────────────────────────────────────────

/// Runs commands on the live system.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

fn not_found_or_io(program: &str, err: io::Error) -> CommandError {
    if err.kind() == io::ErrorKind::NotFound {
        CommandError::NotFound(program.to_string())
    } else {
        CommandError::Io(err)
    }
}

impl System for HostSystem {
    fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        let program = invocation.program.as_str();
        debug!(command = %invocation, "running");

        let mut command = Command::new(program);
        command.args(&invocation.args).stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C reaches the installer, not a
        // half-finished mkfs or tar.
        command.process_group(0);

        if let Some(ref path) = invocation.append_stdout_to {
            let file = OpenOptions::new().append(true).create(true).open(path)?;
            command.stdout(file);
        } else {
            command.stdout(Stdio::piped());
        }

        let output = command.output().map_err(|e| not_found_or_io(program, e))?;
        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), CommandError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), CommandError> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Returns `true` when `program` resolves in `PATH`.
pub fn is_available(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Maps a binary name to the Gentoo package that ships it.
pub fn package_for(program: &str) -> &str {
    match program {
        "mkfs.fat" | "mkfs.vfat" | "fsck.fat" | "fatlabel" => "sys-fs/dosfstools",
        "mkfs.ext4" | "mkfs.ext3" | "mkfs.ext2" | "e2fsck" | "resize2fs" | "tune2fs" => {
            "sys-fs/e2fsprogs"
        }
        "mkfs.btrfs" | "btrfs" => "sys-fs/btrfs-progs",
        "mkfs.xfs" | "xfs_repair" => "sys-fs/xfsprogs",
        "mkswap" | "swapon" | "swapoff" | "mount" | "umount" | "fdisk" | "lsblk" | "blkid"
        | "findmnt" | "wipefs" => "sys-apps/util-linux",
        "parted" => "sys-block/parted",
        "genfstab" => "sys-fs/genfstab",
        "wget" => "net-misc/wget",
        "gpg" => "app-crypt/gnupg",
        "tar" => "app-arch/tar",
        other => other,
    }
}
