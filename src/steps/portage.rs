use std::path::PathBuf;

use tracing::debug;

use crate::{
    cmd::Invocation,
    config::{Configuration, Profile},
    env::Environment,
    error::{ExecuteError, PreconditionError, RollbackError},
    steps::{stage3, undo_all, Phase, Step, StepContext},
};

pub const NAME: &str = "package-manager";

const BACKUP_SUFFIX: &str = ".installer-bak";

/// Writes Portage configuration into the new system, prepares the chroot
/// and syncs the package tree.
#[derive(Debug, Default)]
pub struct PackageManagerSetup;

fn make_conf_path(config: &Configuration) -> PathBuf {
    config.target_path("/etc/portage/make.conf")
}

fn backup_path(config: &Configuration) -> PathBuf {
    let mut path = make_conf_path(config).into_os_string();
    path.push(BACKUP_SUFFIX);
    PathBuf::from(path)
}

fn repos_conf_path(config: &Configuration) -> PathBuf {
    config.target_path("/etc/portage/repos.conf/gentoo.conf")
}

/// Parallel jobs for builds; `kernel.jobs = 0` means one per CPU.
pub(crate) fn jobs(config: &Configuration) -> u32 {
    match config.kernel.jobs {
        0 => std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        n => n,
    }
}

/// Renders `make.conf` from the portage section.
pub fn render_make_conf(config: &Configuration) -> String {
    let portage = &config.portage;
    let mut out = String::from("# Generated by gentoo-installer\n");
    out.push_str("COMMON_FLAGS=\"-O2 -pipe\"\n");
    out.push_str("CFLAGS=\"${COMMON_FLAGS}\"\nCXXFLAGS=\"${COMMON_FLAGS}\"\n");
    let make_opts = portage
        .make_opts
        .clone()
        .unwrap_or_else(|| format!("-j{}", jobs(config)));
    out.push_str(&format!("MAKEOPTS=\"{}\"\n", make_opts));
    if !portage.use_flags.is_empty() {
        out.push_str(&format!("USE=\"{}\"\n", portage.use_flags.join(" ")));
    }
    if !portage.accept_keywords.is_empty() {
        out.push_str(&format!(
            "ACCEPT_KEYWORDS=\"{}\"\n",
            portage.accept_keywords.join(" ")
        ));
    }
    if !portage.mirrors.is_empty() {
        out.push_str(&format!("GENTOO_MIRRORS=\"{}\"\n", portage.mirrors.join(" ")));
    }
    out.push_str("ACCEPT_LICENSE=\"-* @FREE @BINARY-REDISTRIBUTABLE\"\n");
    out
}

fn render_repos_conf() -> &'static str {
    "[DEFAULT]\nmain-repo = gentoo\n\n[gentoo]\nlocation = /var/db/repos/gentoo\nsync-type = rsync\nsync-uri = rsync://rsync.gentoo.org/gentoo-portage\nauto-sync = yes\n"
}

/// Portage profile selected for a system profile.
fn eselect_profile(config: &Configuration) -> Option<String> {
    let arch = &config.stage3.arch;
    match config.profile {
        Profile::Desktop => Some(format!("default/linux/{}/23.0/desktop", arch)),
        Profile::Server => Some(format!("default/linux/{}/23.0", arch)),
        Profile::Custom => None,
    }
}

/// Pseudo filesystems the chroot needs, as (target, mount args).
fn pseudo_mounts(config: &Configuration) -> Vec<(String, Vec<String>)> {
    let target = |p: &str| config.target_path(p).display().to_string();
    vec![
        (
            target("/proc"),
            vec!["--types".into(), "proc".into(), "/proc".into(), target("/proc")],
        ),
        (target("/sys"), vec!["--rbind".into(), "/sys".into(), target("/sys")]),
        (target("/dev"), vec!["--rbind".into(), "/dev".into(), target("/dev")]),
        (target("/run"), vec!["--bind".into(), "/run".into(), target("/run")]),
    ]
}

impl Step for PackageManagerSetup {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::PackageManager
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        true
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        env.require_complete(stage3::NAME)?;
        env.require_mounted(&config.mount_root)?;
        env.require_tool("chroot")
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let make_conf = make_conf_path(config);
        let backup = backup_path(config);

        // a backup from an earlier attempt holds the stock file; keep it
        if ctx.exists(&backup) {
            debug!("Keeping existing backup {}", backup.display());
        } else {
            ctx.progress(5, "Backing up stock make.conf");
            ctx.run(
                "configure",
                Invocation::new(
                    "cp",
                    [
                        "-a".to_string(),
                        make_conf.display().to_string(),
                        backup.display().to_string(),
                    ],
                ),
            )?;
        }

        ctx.progress(10, "Writing make.conf");
        ctx.write("configure", &make_conf, &render_make_conf(config))?;
        ctx.write("configure", &repos_conf_path(config), render_repos_conf())?;

        ctx.progress(20, "Copying DNS configuration");
        let resolv = config.target_path("/etc/resolv.conf").display().to_string();
        ctx.run(
            "configure",
            Invocation::new("cp", ["--dereference", "/etc/resolv.conf", resolv.as_str()]),
        )?;

        ctx.progress(25, "Mounting pseudo filesystems for the chroot");
        for (_, args) in pseudo_mounts(config) {
            ctx.run("chroot", Invocation::new("mount", args))?;
        }

        ctx.progress(35, "Syncing the Gentoo package tree");
        ctx.run("sync", Invocation::chroot(&config.mount_root, "emerge-webrsync", ["--quiet"]))?;

        if let Some(profile) = eselect_profile(config) {
            ctx.progress(85, format!("Selecting profile {}", profile));
            ctx.run(
                "profile",
                Invocation::chroot(&config.mount_root, "eselect", ["profile".to_string(), "set".to_string(), profile]),
            )?;
        }

        ctx.progress(100, "Package manager configured");
        Ok(())
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        let config = ctx.config();
        let make_conf = make_conf_path(config).display().to_string();
        let backup = backup_path(config).display().to_string();

        ctx.progress(0, "Restoring stock Portage configuration");
        let mut actions = Vec::new();
        // unmount in reverse order of mounting
        for (target, _) in pseudo_mounts(config).into_iter().rev() {
            actions.push(ctx.undo(Invocation::new("umount", ["-R".to_string(), target])));
        }
        actions.push(ctx.undo(Invocation::new("mv", ["-f".to_string(), backup, make_conf])));
        actions.push(ctx.undo_remove(&repos_conf_path(config)));
        undo_all(actions)
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
    fn make_conf_carries_portage_settings() {
        let config = config(
            "portage:\n  make_opts: -j8 -l8\n  use_flags: [X, -systemd]\n  accept_keywords: [\"~amd64\"]\n",
        );
        let rendered = render_make_conf(&config);
        assert!(rendered.contains("MAKEOPTS=\"-j8 -l8\""));
        assert!(rendered.contains("USE=\"X -systemd\""));
        assert!(rendered.contains("ACCEPT_KEYWORDS=\"~amd64\""));
        assert!(rendered.contains("GENTOO_MIRRORS=\"https://distfiles.gentoo.org\""));
    }

    #[test]
    fn make_opts_default_to_job_count() {
        let config = config("kernel:\n  jobs: 6\n");
        assert!(render_make_conf(&config).contains("MAKEOPTS=\"-j6\""));
    }

    #[test]
    fn profile_selection_follows_system_profile() {
        assert_eq!(
            eselect_profile(&config("profile: server\n")).as_deref(),
            Some("default/linux/amd64/23.0")
        );
        assert!(eselect_profile(&config("profile: custom\n")).is_none());
    }
}
