use std::path::PathBuf;

use crate::{
    cmd::Invocation,
    config::{Configuration, Interface, Privilege},
    env::Environment,
    error::{ExecuteError, PreconditionError, RollbackError},
    steps::{bootloader, undo_all, Phase, Step, StepContext},
};

pub const NAME: &str = "system-config";

const SUDOERS_DROP_IN: &str = "/etc/sudoers.d/wheel";

/// Writes host identity, locale, network and user accounts into the new
/// system.
#[derive(Debug, Default)]
pub struct SystemConfig;

// ── Rendering ─────────────────────────────────────────────────────────────────

fn render_net(interfaces: &[Interface]) -> String {
    let mut out = String::from("# Generated by gentoo-installer\n");
    for iface in interfaces {
        if iface.dhcp {
            out.push_str(&format!("config_{}=\"dhcp\"\n", iface.name));
            continue;
        }
        if let Some(ref address) = iface.address {
            out.push_str(&format!("config_{}=\"{}\"\n", iface.name, address));
        }
        if let Some(ref gateway) = iface.gateway {
            out.push_str(&format!("routes_{}=\"default via {}\"\n", iface.name, gateway));
        }
    }
    out
}

fn render_resolv(config: &Configuration) -> String {
    config
        .network
        .dns
        .iter()
        .map(|ip| format!("nameserver {}\n", ip))
        .collect()
}

/// `locale.gen` line: `en_US.UTF-8` → `en_US.UTF-8 UTF-8`.
fn locale_gen_line(lang: &str) -> String {
    match lang.split_once('.') {
        Some((_, charset)) => format!("{} {}\n", lang, charset.to_ascii_uppercase()),
        None => format!("{} ISO-8859-1\n", lang),
    }
}

/// Name `eselect locale` knows a locale by (`en_US.UTF-8` → `en_US.utf8`).
fn eselect_locale(lang: &str) -> String {
    match lang.split_once('.') {
        Some((base, charset)) => format!("{}.{}", base, charset.to_ascii_lowercase().replace('-', "")),
        None => lang.to_string(),
    }
}

fn net_script(config: &Configuration, iface: &str) -> PathBuf {
    config.target_path(&format!("/etc/init.d/net.{}", iface))
}

// ── Step ──────────────────────────────────────────────────────────────────────

impl Step for SystemConfig {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::SystemConfig
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
        env.require_complete(bootloader::NAME)?;
        env.require_mounted(&config.mount_root)
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let root = &config.mount_root;
        let locale = &config.locale;

        ctx.progress(5, format!("Setting hostname to {}", config.network.hostname));
        ctx.write(
            "hostname",
            &config.target_path("/etc/conf.d/hostname"),
            &format!("hostname=\"{}\"\n", config.network.hostname),
        )?;
        ctx.write(
            "hostname",
            &config.target_path("/etc/hostname"),
            &format!("{}\n", config.network.hostname),
        )?;

        ctx.progress(15, format!("Setting timezone to {}", locale.timezone));
        ctx.write("timezone", &config.target_path("/etc/timezone"), &format!("{}\n", locale.timezone))?;
        ctx.run(
            "timezone",
            Invocation::chroot(root, "emerge", ["--config", "sys-libs/timezone-data"]),
        )?;

        ctx.progress(25, format!("Generating locale {}", locale.lang));
        ctx.write("locale", &config.target_path("/etc/locale.gen"), &locale_gen_line(&locale.lang))?;
        ctx.run("locale", Invocation::chroot(root, "locale-gen", Vec::<String>::new()))?;
        ctx.run(
            "locale",
            Invocation::chroot(root, "eselect", ["locale".to_string(), "set".to_string(), eselect_locale(&locale.lang)]),
        )?;

        ctx.progress(35, format!("Setting console keymap to {}", locale.keymap));
        ctx.write(
            "keymap",
            &config.target_path("/etc/conf.d/keymaps"),
            &format!("keymap=\"{}\"\n", locale.keymap),
        )?;

        let interfaces = &config.network.interfaces;
        if !interfaces.is_empty() {
            ctx.progress(45, "Configuring network interfaces");
            if interfaces.iter().any(|i| i.dhcp) {
                ctx.run(
                    "network",
                    Invocation::chroot(root, "emerge", ["--quiet-build", "--noreplace", "net-misc/dhcpcd"]),
                )?;
            }
            ctx.write("network", &config.target_path("/etc/conf.d/net"), &render_net(interfaces))?;
            for iface in interfaces {
                let script = format!("net.{}", iface.name);
                ctx.run(
                    "network",
                    Invocation::new(
                        "ln",
                        ["-sf".to_string(), "net.lo".to_string(), net_script(config, &iface.name).display().to_string()],
                    ),
                )?;
                ctx.run(
                    "network",
                    Invocation::chroot(root, "rc-update", ["add".to_string(), script, "default".to_string()]),
                )?;
            }
        }

        if !config.network.dns.is_empty() {
            ctx.progress(55, "Writing resolver configuration");
            ctx.write("dns", &config.target_path("/etc/resolv.conf"), &render_resolv(config))?;
        }

        ctx.checkpoint()?;
        let users = &config.users;
        if users.iter().any(|u| u.privileges == Privilege::Admin) {
            ctx.progress(65, "Installing sudo");
            ctx.run("users", Invocation::chroot(root, "emerge", ["--quiet-build", "--noreplace", "app-admin/sudo"]))?;
            ctx.write(
                "users",
                &config.target_path(SUDOERS_DROP_IN),
                "%wheel ALL=(ALL:ALL) ALL\n",
            )?;
        }
        for (i, user) in users.iter().enumerate() {
            ctx.progress(
                (70 + 25 * i / users.len()) as u8,
                format!("Creating user {} ({})", user.name, user.privileges),
            );
            let groups = match user.privileges {
                Privilege::Admin => "users,wheel,audio,video",
                Privilege::Standard => "users,audio,video",
            };
            ctx.run(
                "users",
                Invocation::chroot(root, "useradd", ["-m", "-G", groups, "-s", "/bin/bash", user.name.as_str()]),
            )?;
        }

        ctx.progress(100, "System configured");
        Ok(())
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        let config = ctx.config();
        let root = &config.mount_root;

        ctx.progress(0, "Removing created users and network configuration");
        let mut actions = Vec::new();
        for user in config.users.iter().rev() {
            actions.push(ctx.undo(Invocation::chroot(root, "userdel", ["-r", user.name.as_str()])));
        }
        if config.users.iter().any(|u| u.privileges == Privilege::Admin) {
            actions.push(ctx.undo_remove(&config.target_path(SUDOERS_DROP_IN)));
        }
        for iface in &config.network.interfaces {
            actions.push(ctx.undo(Invocation::chroot(
                root,
                "rc-update",
                ["del".to_string(), format!("net.{}", iface.name), "default".to_string()],
            )));
            actions.push(ctx.undo_remove(&net_script(config, &iface.name)));
        }
        actions.push(ctx.undo_remove(&config.target_path("/etc/conf.d/net")));
        undo_all(actions)
    }
}
