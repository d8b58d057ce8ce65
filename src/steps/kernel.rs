use crate::{
    cmd::Invocation,
    config::{Configuration, KernelConfigProfile},
    env::Environment,
    error::{ExecuteError, PreconditionError, RollbackError},
    steps::{portage, Phase, Step, StepContext},
};

pub const BUILD: &str = "kernel-build";
pub const BINARY: &str = "kernel-binary";

fn emerge<I, S>(config: &Configuration, args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut all = vec!["--quiet-build".to_string(), "--noreplace".to_string()];
    all.extend(args.into_iter().map(Into::into));
    Invocation::chroot(&config.mount_root, "emerge", all)
}

fn common_precondition(config: &Configuration, env: &Environment) -> Result<(), PreconditionError> {
    env.require_complete(portage::NAME)?;
    env.require_mounted(&config.mount_root)
}

// ── Compiled kernel ───────────────────────────────────────────────────────────

/// Installs kernel sources and compiles them inside the chroot.
#[derive(Debug, Default)]
pub struct KernelBuild;

impl Step for KernelBuild {
    fn name(&self) -> &str {
        BUILD
    }

    fn phase(&self) -> Phase {
        Phase::Kernel
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        false
    }

    fn applicable(&self, config: &Configuration) -> bool {
        !config.kernel.source.is_precompiled()
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        common_precondition(config, env)
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let kernel = &config.kernel;
        let root = &config.mount_root;
        let jobs = format!("-j{}", portage::jobs(config));

        ctx.progress(5, format!("Installing {}", kernel.source.package()));
        let mut packages = vec![kernel.source.package()];
        if kernel.firmware {
            packages.push("sys-kernel/linux-firmware");
        }
        ctx.run("sources", emerge(config, packages))?;

        ctx.progress(15, "Selecting kernel source tree");
        ctx.run("sources", Invocation::chroot(root, "eselect", ["kernel", "set", "1"]))?;

        match kernel.config {
            KernelConfigProfile::Genkernel => {
                ctx.progress(20, "Installing genkernel");
                ctx.run("configure", emerge(config, ["sys-kernel/genkernel"]))?;
                ctx.checkpoint()?;

                ctx.progress(25, format!("Building kernel with genkernel ({})", jobs));
                let mut args = vec![format!("--makeopts={}", jobs)];
                if !kernel.initramfs {
                    args.push("--no-install-initramfs".to_string());
                }
                args.push("all".to_string());
                ctx.run("compile", Invocation::chroot(root, "genkernel", args))?;
            }
            KernelConfigProfile::Defconfig => {
                ctx.progress(20, "Generating defconfig");
                ctx.run(
                    "configure",
                    Invocation::chroot(root, "make", ["-C", "/usr/src/linux", "defconfig"]),
                )?;
                ctx.checkpoint()?;

                ctx.progress(25, format!("Compiling kernel ({})", jobs));
                ctx.run(
                    "compile",
                    Invocation::chroot(root, "make", ["-C", "/usr/src/linux", jobs.as_str()]),
                )?;
                ctx.checkpoint()?;

                ctx.progress(75, "Installing modules");
                ctx.run(
                    "install",
                    Invocation::chroot(root, "make", ["-C", "/usr/src/linux", "modules_install"]),
                )?;
                ctx.progress(85, "Installing kernel image");
                ctx.run(
                    "install",
                    Invocation::chroot(root, "make", ["-C", "/usr/src/linux", "install"]),
                )?;

                if kernel.initramfs {
                    ctx.progress(90, "Building initramfs");
                    ctx.run("initramfs", emerge(config, ["sys-kernel/dracut"]))?;
                    ctx.run(
                        "initramfs",
                        Invocation::chroot(root, "dracut", ["--force", "--regenerate-all"]),
                    )?;
                }
            }
        }

        ctx.progress(100, "Kernel installed");
        Ok(())
    }
}

// ── Precompiled kernel ────────────────────────────────────────────────────────

/// Installs the distribution kernel binary package.
#[derive(Debug, Default)]
pub struct KernelBinary;

impl Step for KernelBinary {
    fn name(&self) -> &str {
        BINARY
    }

    fn phase(&self) -> Phase {
        Phase::Kernel
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        true
    }

    fn applicable(&self, config: &Configuration) -> bool {
        config.kernel.source.is_precompiled()
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        common_precondition(config, env)
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();

        ctx.progress(10, "Installing installkernel");
        ctx.run("install", emerge(config, ["sys-kernel/installkernel"]))?;

        ctx.progress(30, format!("Installing {}", config.kernel.source.package()));
        let mut packages = vec![config.kernel.source.package()];
        if config.kernel.firmware {
            packages.push("sys-kernel/linux-firmware");
        }
        ctx.run("install", emerge(config, packages))?;

        ctx.progress(100, "Kernel installed");
        Ok(())
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        let config = ctx.config();
        ctx.progress(0, format!("Removing {}", config.kernel.source.package()));
        ctx.undo(Invocation::chroot(
            &config.mount_root,
            "emerge",
            ["--unmerge", config.kernel.source.package()],
        ))
    }
}
