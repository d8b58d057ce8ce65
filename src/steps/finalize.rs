use crate::{
    cmd::Invocation,
    config::{Configuration, Profile},
    env::Environment,
    error::{ExecuteError, PreconditionError},
    steps::{disk, system, Phase, Step, StepContext},
};

pub const NAME: &str = "finalize";

const FSTAB_HEADER: &str = "# /etc/fstab: static file system information.\n# Generated by gentoo-installer with genfstab -U.\n\n";

/// A service to install and enable in the new system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Service {
    package: &'static str,
    name: &'static str,
    runlevel: &'static str,
}

const fn service(package: &'static str, name: &'static str, runlevel: &'static str) -> Service {
    Service {
        package,
        name,
        runlevel,
    }
}

/// Services enabled for each profile. `custom` leaves service choice to
/// the user.
fn services(profile: Profile) -> Vec<Service> {
    let base = [
        service("app-admin/sysklogd", "sysklogd", "default"),
        service("sys-process/cronie", "cronie", "default"),
    ];
    match profile {
        Profile::Desktop => {
            let mut all = base.to_vec();
            all.push(service("sys-auth/elogind", "elogind", "boot"));
            all.push(service("sys-apps/dbus", "dbus", "default"));
            all
        }
        Profile::Server => {
            let mut all = base.to_vec();
            all.push(service("net-misc/openssh", "sshd", "default"));
            all
        }
        Profile::Custom => Vec::new(),
    }
}

/// Writes fstab, enables services and unmounts the finished system.
///
/// Not revocable: once the tree is unmounted there is nothing left to undo
/// that later phases depend on.
#[derive(Debug, Default)]
pub struct Finalize;

impl Step for Finalize {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::Finalization
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        false
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        env.require_complete(system::NAME)?;
        env.require_mounted(&config.mount_root)?;
        env.require_tool("genfstab")
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let root = &config.mount_root;
        let fstab = config.target_path("/etc/fstab");

        ctx.progress(10, format!("Generating {} (UUID-based)", fstab.display()));
        // start from a fresh file so a repeated run does not duplicate entries
        ctx.write("fstab", &fstab, FSTAB_HEADER)?;
        ctx.run(
            "fstab",
            Invocation::new("genfstab", ["-U".to_string(), root.display().to_string()])
                .append_stdout_to(fstab),
        )?;

        let services = services(config.profile);
        if !services.is_empty() {
            ctx.progress(25, format!("Installing {} profile services", config.profile));
            let mut args = vec!["--quiet-build", "--noreplace"];
            args.extend(services.iter().map(|s| s.package));
            ctx.run("services", Invocation::chroot(root, "emerge", args))?;
        }
        for (i, s) in services.iter().enumerate() {
            ctx.progress(
                (60 + 20 * i / services.len()) as u8,
                format!("Enabling {} in runlevel {}", s.name, s.runlevel),
            );
            ctx.run("services", Invocation::chroot(root, "rc-update", ["add", s.name, s.runlevel]))?;
        }

        ctx.checkpoint()?;
        ctx.progress(85, format!("Unmounting {}", root.display()));
        let root = root.display().to_string();
        ctx.run("unmount", Invocation::new("umount", ["-R", root.as_str()]))?;
        if let Some(n) = config.partitions.iter().position(|p| p.is_swap()) {
            let swap = disk::part_path(&config.target_disk, n + 1);
            ctx.run("unmount", Invocation::new("swapoff", [swap.as_str()]))?;
        }

        ctx.progress(100, "Installation finished; the system is ready to boot");
        Ok(())
    }
}
