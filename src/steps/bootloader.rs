use std::path::PathBuf;

use crate::{
    cmd::Invocation,
    config::{BootloaderType, Configuration},
    env::{BootMode, Environment},
    error::{ExecuteError, PreconditionError, RollbackError},
    steps::{kernel, undo_all, Phase, Step, StepContext},
};

pub const NAME: &str = "bootloader";

const EFI_ID: &str = "gentoo";

/// Installs and configures the chosen bootloader in the new system.
///
/// The firmware target follows the layout: a plan with an EFI system
/// partition installs for UEFI, one without installs to the disk's MBR.
#[derive(Debug, Default)]
pub struct BootloaderInstall;

/// Mount point of the ESP inside the new system, when the layout has one.
fn esp_mount(config: &Configuration) -> Option<&str> {
    config.esp().map(|p| p.mount_point.as_str())
}

fn package_use_path(config: &Configuration) -> PathBuf {
    config.target_path("/etc/portage/package.use/bootloader")
}

fn lilo_conf_path(config: &Configuration) -> PathBuf {
    config.target_path("/etc/lilo.conf")
}

/// Root device as the new system will see it.
fn root_device(config: &Configuration) -> Option<String> {
    config
        .partitions
        .iter()
        .position(|p| p.mount_point == "/")
        .map(|i| super::disk::part_path(&config.target_disk, i + 1))
}

fn render_lilo_conf(config: &Configuration) -> String {
    let root = root_device(config).unwrap_or_default();
    format!(
        "# Generated by gentoo-installer\nboot={}\nprompt\ntimeout=50\ndefault=gentoo\n\nimage=/boot/vmlinuz\n    label=gentoo\n    read-only\n    root={}\n",
        config.target_disk, root
    )
}

/// Portage USE settings the loader package needs.
fn package_use(config: &Configuration) -> Option<&'static str> {
    match config.bootloader {
        BootloaderType::Grub if config.esp().is_some() => {
            Some("sys-boot/grub GRUB_PLATFORMS: efi-64\n")
        }
        BootloaderType::Grub => Some("sys-boot/grub GRUB_PLATFORMS: pc\n"),
        BootloaderType::SystemdBoot => Some("sys-apps/systemd-utils boot kernel-install\n"),
        BootloaderType::Lilo => None,
    }
}

impl Step for BootloaderInstall {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::Bootloader
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
        if !env.is_complete(kernel::BUILD) && !env.is_complete(kernel::BINARY) {
            return Err(PreconditionError::new("no kernel has been installed yet")
                .with_remedy("run the kernel phase first or use --resume"));
        }
        env.require_mounted(&config.mount_root)?;

        match (config.bootloader, env.boot_mode) {
            (BootloaderType::SystemdBoot, BootMode::Bios) => Err(PreconditionError::new(
                "systemd-boot needs a machine booted in UEFI mode",
            )
            .with_remedy("choose grub or lilo, or boot the install medium in UEFI mode")),
            (BootloaderType::Lilo, BootMode::Uefi) => Err(PreconditionError::new(
                "lilo only boots BIOS machines",
            )
            .with_remedy("choose grub or systemd-boot")),
            (BootloaderType::Grub, BootMode::Uefi) if config.esp().is_none() => Err(
                PreconditionError::new("UEFI boot needs an EFI system partition")
                    .with_remedy("add a vfat partition mounted at /boot/efi"),
            ),
            (BootloaderType::Grub, BootMode::Bios) if config.esp().is_some() => Err(
                PreconditionError::new(
                    "layout has an EFI system partition but the machine booted in BIOS mode",
                )
                .with_remedy("boot the install medium in UEFI mode or drop the ESP"),
            ),
            _ => Ok(()),
        }
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let root = &config.mount_root;

        if let Some(flags) = package_use(config) {
            ctx.write("configure", &package_use_path(config), flags)?;
        }

        match config.bootloader {
            BootloaderType::Grub => {
                ctx.progress(10, "Installing GRUB");
                ctx.run("install", Invocation::chroot(root, "emerge", ["--quiet-build", "--noreplace", "sys-boot/grub"]))?;
                ctx.checkpoint()?;

                match esp_mount(config) {
                    Some(esp) => {
                        ctx.progress(60, format!("Installing GRUB to the EFI partition at {}", esp));
                        ctx.run(
                            "install",
                            Invocation::chroot(
                                root,
                                "grub-install",
                                [
                                    "--target=x86_64-efi".to_string(),
                                    format!("--efi-directory={}", esp),
                                    format!("--bootloader-id={}", EFI_ID),
                                ],
                            ),
                        )?;
                    }
                    None => {
                        ctx.progress(60, format!("Installing GRUB to the MBR of {}", config.target_disk));
                        ctx.run(
                            "install",
                            Invocation::chroot(
                                root,
                                "grub-install",
                                ["--target=i386-pc", config.target_disk.as_str()],
                            ),
                        )?;
                    }
                }

                ctx.progress(85, "Generating grub.cfg");
                ctx.run(
                    "configure",
                    Invocation::chroot(root, "grub-mkconfig", ["-o", "/boot/grub/grub.cfg"]),
                )?;
            }
            BootloaderType::SystemdBoot => {
                ctx.progress(10, "Installing systemd-boot");
                ctx.run(
                    "install",
                    Invocation::chroot(root, "emerge", ["--quiet-build", "--noreplace", "sys-apps/systemd-utils"]),
                )?;
                ctx.checkpoint()?;

                let esp = esp_mount(config).unwrap_or("/boot/efi");
                ctx.progress(60, format!("Installing boot manager to {}", esp));
                ctx.run(
                    "install",
                    Invocation::chroot(root, "bootctl", [format!("--esp-path={}", esp), "install".to_string()]),
                )?;
            }
            BootloaderType::Lilo => {
                ctx.progress(10, "Installing LILO");
                ctx.run("install", Invocation::chroot(root, "emerge", ["--quiet-build", "--noreplace", "sys-boot/lilo"]))?;
                ctx.checkpoint()?;

                ctx.progress(60, "Writing lilo.conf");
                ctx.write("configure", &lilo_conf_path(config), &render_lilo_conf(config))?;
                ctx.progress(80, format!("Writing boot record to {}", config.target_disk));
                ctx.run("install", Invocation::chroot(root, "lilo", Vec::<String>::new()))?;
            }
        }

        ctx.progress(100, format!("{} installed", config.bootloader));
        Ok(())
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        let config = ctx.config();
        let root = &config.mount_root;
        let rm = |path: PathBuf| ctx.undo(Invocation::new("rm", ["-rf".to_string(), path.display().to_string()]));

        ctx.progress(0, format!("Removing {} files", config.bootloader));
        let mut actions = Vec::new();
        match config.bootloader {
            BootloaderType::Grub => {
                if let Some(esp) = esp_mount(config) {
                    actions.push(rm(config.target_path(esp).join("EFI").join(EFI_ID)));
                }
                actions.push(rm(config.target_path("/boot/grub")));
            }
            BootloaderType::SystemdBoot => {
                let esp = esp_mount(config).unwrap_or("/boot/efi");
                actions.push(ctx.undo(Invocation::chroot(
                    root,
                    "bootctl",
                    [format!("--esp-path={}", esp), "remove".to_string()],
                )));
            }
            BootloaderType::Lilo => actions.push(ctx.undo_remove(&lilo_conf_path(config))),
        }
        if package_use(config).is_some() {
            actions.push(ctx.undo_remove(&package_use_path(config)));
        }
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

    fn ready_env(config: &Configuration) -> Environment {
        let mut env = Environment::simulated(config);
        env.mark_complete(kernel::BUILD);
        env.record_mount(config.mount_root.clone(), "/dev/sda3".to_string());
        env
    }

    #[test]
    fn needs_an_installed_kernel() {
        let config = config("");
        let env = Environment::simulated(&config);
        assert!(BootloaderInstall.check_precondition(&config, &env).is_err());
        assert!(BootloaderInstall.check_precondition(&config, &ready_env(&config)).is_ok());
    }

    #[test]
    fn systemd_boot_refuses_bios() {
        let config = config("bootloader: systemd-boot\n");
        let mut env = ready_env(&config);
        env.boot_mode = BootMode::Bios;
        let err = BootloaderInstall.check_precondition(&config, &env).unwrap_err();
        assert!(err.reason.contains("UEFI"));
    }

    #[test]
    fn lilo_refuses_uefi() {
        let config = config("bootloader: lilo\npartition_table: mbr\n");
        let mut env = ready_env(&config);
        env.boot_mode = BootMode::Uefi;
        assert!(BootloaderInstall.check_precondition(&config, &env).is_err());
    }

    #[test]
    fn grub_on_bios_layout() {
        let config = config("partitions:\n  - {mount_point: /, size: 100%, filesystem: ext4}\n");
        let env = ready_env(&config);
        assert_eq!(env.boot_mode, BootMode::Bios);
        assert!(BootloaderInstall.check_precondition(&config, &env).is_ok());
        assert_eq!(package_use(&config), Some("sys-boot/grub GRUB_PLATFORMS: pc\n"));
    }

    #[test]
    fn lilo_conf_points_at_root_partition() {
        let config = config("bootloader: lilo\n");
        let rendered = render_lilo_conf(&config);
        assert!(rendered.contains("boot=/dev/sda\n"));
        assert!(rendered.contains("root=/dev/sda3\n"));
    }
}
