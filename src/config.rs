//! Typed installation plan plus the layered loader that produces it.
//!
//! A [`Configuration`] is built once per run: built-in defaults, then the
//! YAML file, then command-line overrides, merged field by field into a
//! [`ConfigLayer`] and validated as a whole. Every problem is collected
//! before failing, so one pass shows the user everything to fix.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Violation};

// ── Enumerations ──────────────────────────────────────────────────────────────

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn parse(s: &str) -> Option<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn choices() -> String {
                Self::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum!(
    /// Filesystem created on a partition.
    Filesystem {
        Ext4 => "ext4",
        Xfs => "xfs",
        Btrfs => "btrfs",
        Vfat => "vfat",
        Swap => "swap",
    }
);

config_enum!(
    BootloaderType {
        Grub => "grub",
        SystemdBoot => "systemd-boot",
        Lilo => "lilo",
    }
);

config_enum!(
    Profile {
        Desktop => "desktop",
        Server => "server",
        Custom => "custom",
    }
);

config_enum!(
    PartitionTable {
        Gpt => "gpt",
        Mbr => "mbr",
    }
);

config_enum!(
    /// Where the kernel comes from. `gentoo-kernel-bin` is precompiled.
    KernelSource {
        GentooSources => "gentoo-sources",
        VanillaSources => "vanilla-sources",
        GentooKernelBin => "gentoo-kernel-bin",
    }
);

config_enum!(
    KernelConfigProfile {
        Genkernel => "genkernel",
        Defconfig => "defconfig",
    }
);

config_enum!(
    Privilege {
        Standard => "standard",
        Admin => "admin",
    }
);

impl KernelSource {
    /// Portage atom for this kernel.
    pub fn package(self) -> &'static str {
        match self {
            KernelSource::GentooSources => "sys-kernel/gentoo-sources",
            KernelSource::VanillaSources => "sys-kernel/vanilla-sources",
            KernelSource::GentooKernelBin => "sys-kernel/gentoo-kernel-bin",
        }
    }

    pub fn is_precompiled(self) -> bool {
        matches!(self, KernelSource::GentooKernelBin)
    }
}

// ── Partition sizes ───────────────────────────────────────────────────────────

/// Size of a partition: a share of the whole disk or a fixed byte count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSize {
    Percent(f64),
    Bytes(u64),
}

impl PartitionSize {
    /// Parses `100%`, `512M`, `4G`, `1T`, `2048K` or a plain byte count.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let s = raw.trim();
        if s.is_empty() {
            return Err("size is empty".to_string());
        }
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("'{}' is not a percentage", raw))?;
            if !value.is_finite() {
                return Err(format!("'{}' is not a finite percentage", raw));
            }
            if value < 0.0 {
                return Err(format!("size '{}' must be non-negative", raw));
            }
            if value == 0.0 || value > 100.0 {
                return Err(format!("percentage '{}' must be in (0, 100]", raw));
            }
            return Ok(PartitionSize::Percent(value));
        }

        let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
            Some('K') => (&s[..s.len() - 1], 1u64 << 10),
            Some('M') => (&s[..s.len() - 1], 1u64 << 20),
            Some('G') => (&s[..s.len() - 1], 1u64 << 30),
            Some('T') => (&s[..s.len() - 1], 1u64 << 40),
            _ => (s, 1),
        };
        let value: f64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a size (expected e.g. 512M, 4G or 50%)", raw))?;
        if !value.is_finite() {
            return Err(format!("size '{}' is not a finite number", raw));
        }
        if value < 0.0 {
            return Err(format!("size '{}' must be non-negative", raw));
        }
        let bytes = value * multiplier as f64;
        if bytes >= u64::MAX as f64 {
            return Err(format!("size '{}' is too large", raw));
        }
        match bytes as u64 {
            0 => Err(format!("size '{}' must be greater than zero", raw)),
            bytes => Ok(PartitionSize::Bytes(bytes)),
        }
    }

    pub fn percent(self) -> Option<f64> {
        match self {
            PartitionSize::Percent(p) => Some(p),
            PartitionSize::Bytes(_) => None,
        }
    }
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionSize::Percent(p) => write!(f, "{}%", p),
            PartitionSize::Bytes(b) if b % (1 << 30) == 0 => write!(f, "{}G", b >> 30),
            PartitionSize::Bytes(b) if b % (1 << 20) == 0 => write!(f, "{}M", b >> 20),
            PartitionSize::Bytes(b) => write!(f, "{}", b),
        }
    }
}

// ── Validated configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub mount_point: String,
    pub size: PartitionSize,
    pub filesystem: Filesystem,
}

impl Partition {
    pub fn is_swap(&self) -> bool {
        self.filesystem == Filesystem::Swap
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub dhcp: bool,
    pub address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub hostname: String,
    pub interfaces: Vec<Interface>,
    pub dns: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locale {
    pub lang: String,
    pub timezone: String,
    pub keymap: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub privileges: Privilege,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub source: KernelSource,
    pub config: KernelConfigProfile,
    pub initramfs: bool,
    pub firmware: bool,
    /// Parallel compile jobs; 0 picks the host's available parallelism.
    pub jobs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage3 {
    pub mirror: String,
    pub arch: String,
    pub variant: String,
    pub verify_signature: bool,
}

impl Stage3 {
    pub fn tarball_name(&self) -> String {
        format!("stage3-{}-{}.tar.xz", self.arch, self.variant)
    }

    pub fn url(&self) -> String {
        format!(
            "{}/releases/{}/autobuilds/current-stage3-{}-{}/{}",
            self.mirror.trim_end_matches('/'),
            self.arch,
            self.arch,
            self.variant,
            self.tarball_name()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portage {
    pub make_opts: Option<String>,
    pub use_flags: Vec<String>,
    pub accept_keywords: Vec<String>,
    pub mirrors: Vec<String>,
}

/// Immutable install plan shared read-only by every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub target_disk: String,
    pub mount_root: PathBuf,
    pub partition_table: PartitionTable,
    pub partitions: Vec<Partition>,
    pub network: Network,
    pub locale: Locale,
    pub users: Vec<User>,
    pub kernel: Kernel,
    pub bootloader: BootloaderType,
    pub profile: Profile,
    pub stage3: Stage3,
    pub portage: Portage,
}

impl Configuration {
    pub fn root_partition(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.mount_point == "/")
    }

    /// The EFI system partition, if the layout has one.
    pub fn esp(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| {
            p.filesystem == Filesystem::Vfat
                && (p.mount_point == "/boot/efi" || p.mount_point == "/boot")
        })
    }

    /// Path of `mount_point` inside the target tree.
    pub fn target_path(&self, mount_point: &str) -> PathBuf {
        match mount_point.trim_start_matches('/') {
            "" => self.mount_root.clone(),
            relative => self.mount_root.join(relative),
        }
    }
}

// ── Layers ────────────────────────────────────────────────────────────────────

/// A partition size as written in YAML: `512M`, `100%` or a bare number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Number(f64),
    Text(String),
}

impl SizeValue {
    fn parse(&self) -> Result<PartitionSize, String> {
        match self {
            SizeValue::Number(n) if *n < 0.0 => Err(format!("size {} must be non-negative", n)),
            SizeValue::Number(n) => PartitionSize::parse(&n.to_string()),
            SizeValue::Text(s) => PartitionSize::parse(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PartitionLayer {
    pub mount_point: Option<String>,
    pub size: Option<SizeValue>,
    pub filesystem: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InterfaceLayer {
    pub name: Option<String>,
    pub dhcp: Option<bool>,
    pub address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetworkLayer {
    pub hostname: Option<String>,
    pub interfaces: Option<Vec<InterfaceLayer>>,
    pub dns: Option<Vec<String>>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocaleLayer {
    pub lang: Option<String>,
    pub timezone: Option<String>,
    pub keymap: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserLayer {
    pub name: Option<String>,
    pub privileges: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KernelLayer {
    pub source: Option<String>,
    pub config: Option<String>,
    pub initramfs: Option<bool>,
    pub firmware: Option<bool>,
    pub jobs: Option<i64>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Stage3Layer {
    pub mirror: Option<String>,
    pub arch: Option<String>,
    pub variant: Option<String>,
    pub verify_signature: Option<bool>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PortageLayer {
    pub make_opts: Option<String>,
    pub use_flags: Option<Vec<String>>,
    pub accept_keywords: Option<Vec<String>>,
    pub mirrors: Option<Vec<String>>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

/// One source of configuration values. Every field is optional; merging
/// two layers keeps the later layer's value wherever it sets one.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigLayer {
    pub target_disk: Option<String>,
    pub mount_root: Option<String>,
    pub partition_table: Option<String>,
    pub partitions: Option<Vec<PartitionLayer>>,
    pub network: Option<NetworkLayer>,
    pub locale: Option<LocaleLayer>,
    pub users: Option<Vec<UserLayer>>,
    pub kernel: Option<KernelLayer>,
    pub bootloader: Option<String>,
    pub profile: Option<String>,
    pub stage3: Option<Stage3Layer>,
    pub portage: Option<PortageLayer>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Later `Option` wins; nested sections recurse.
trait Merge {
    fn merge(self, over: Self) -> Self;
}

impl<T> Merge for Option<T> {
    fn merge(self, over: Self) -> Self {
        over.or(self)
    }
}

fn merge_section<T: Merge>(base: Option<T>, over: Option<T>) -> Option<T> {
    match (base, over) {
        (Some(b), Some(o)) => Some(b.merge(o)),
        (b, o) => o.or(b),
    }
}

fn merge_unknown(
    mut base: BTreeMap<String, serde_yaml::Value>,
    over: BTreeMap<String, serde_yaml::Value>,
) -> BTreeMap<String, serde_yaml::Value> {
    base.extend(over);
    base
}

impl Merge for NetworkLayer {
    fn merge(self, o: Self) -> Self {
        Self {
            hostname: self.hostname.merge(o.hostname),
            interfaces: self.interfaces.merge(o.interfaces),
            dns: self.dns.merge(o.dns),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }
}

impl Merge for LocaleLayer {
    fn merge(self, o: Self) -> Self {
        Self {
            lang: self.lang.merge(o.lang),
            timezone: self.timezone.merge(o.timezone),
            keymap: self.keymap.merge(o.keymap),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }
}

impl Merge for KernelLayer {
    fn merge(self, o: Self) -> Self {
        Self {
            source: self.source.merge(o.source),
            config: self.config.merge(o.config),
            initramfs: self.initramfs.merge(o.initramfs),
            firmware: self.firmware.merge(o.firmware),
            jobs: self.jobs.merge(o.jobs),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }
}

impl Merge for Stage3Layer {
    fn merge(self, o: Self) -> Self {
        Self {
            mirror: self.mirror.merge(o.mirror),
            arch: self.arch.merge(o.arch),
            variant: self.variant.merge(o.variant),
            verify_signature: self.verify_signature.merge(o.verify_signature),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }
}

impl Merge for PortageLayer {
    fn merge(self, o: Self) -> Self {
        Self {
            make_opts: self.make_opts.merge(o.make_opts),
            use_flags: self.use_flags.merge(o.use_flags),
            accept_keywords: self.accept_keywords.merge(o.accept_keywords),
            mirrors: self.mirrors.merge(o.mirrors),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }
}

impl ConfigLayer {
    /// Built-in defaults: a UEFI layout on `/dev/sda` with an OpenRC stage3.
    pub fn defaults() -> Self {
        let part = |mount: &str, size: &str, fs: &str| PartitionLayer {
            mount_point: Some(mount.to_string()),
            size: Some(SizeValue::Text(size.to_string())),
            filesystem: Some(fs.to_string()),
            unknown: BTreeMap::new(),
        };
        let strings = |items: &[&str]| Some(items.iter().map(|s| s.to_string()).collect());

        Self {
            target_disk: Some("/dev/sda".to_string()),
            mount_root: Some("/mnt/gentoo".to_string()),
            partition_table: Some("gpt".to_string()),
            partitions: Some(vec![
                part("/boot/efi", "1G", "vfat"),
                part("swap", "4G", "swap"),
                part("/", "100%", "ext4"),
            ]),
            network: Some(NetworkLayer {
                hostname: Some("gentoo".to_string()),
                interfaces: Some(Vec::new()),
                dns: strings(&["8.8.8.8", "8.8.4.4"]),
                unknown: BTreeMap::new(),
            }),
            locale: Some(LocaleLayer {
                lang: Some("en_US.UTF-8".to_string()),
                timezone: Some("UTC".to_string()),
                keymap: Some("us".to_string()),
                unknown: BTreeMap::new(),
            }),
            users: Some(Vec::new()),
            kernel: Some(KernelLayer {
                source: Some("gentoo-sources".to_string()),
                config: Some("genkernel".to_string()),
                initramfs: Some(true),
                firmware: Some(true),
                jobs: Some(0),
                unknown: BTreeMap::new(),
            }),
            bootloader: Some("grub".to_string()),
            profile: Some("desktop".to_string()),
            stage3: Some(Stage3Layer {
                mirror: Some("https://distfiles.gentoo.org".to_string()),
                arch: Some("amd64".to_string()),
                variant: Some("openrc".to_string()),
                verify_signature: Some(true),
                unknown: BTreeMap::new(),
            }),
            portage: Some(PortageLayer {
                make_opts: None,
                use_flags: strings(&["bindist"]),
                accept_keywords: Some(Vec::new()),
                mirrors: strings(&["https://distfiles.gentoo.org"]),
                unknown: BTreeMap::new(),
            }),
            unknown: BTreeMap::new(),
        }
    }

    /// Reads a YAML layer. An empty document is an empty layer.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value)
    }

    /// Field-by-field merge; `over` wins wherever it sets a value.
    pub fn merge(self, o: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            target_disk: self.target_disk.merge(o.target_disk),
            mount_root: self.mount_root.merge(o.mount_root),
            partition_table: self.partition_table.merge(o.partition_table),
            partitions: self.partitions.merge(o.partitions),
            network: merge_section(self.network, o.network),
            locale: merge_section(self.locale, o.locale),
            users: self.users.merge(o.users),
            kernel: merge_section(self.kernel, o.kernel),
            bootloader: self.bootloader.merge(o.bootloader),
            profile: self.profile.merge(o.profile),
            stage3: merge_section(self.stage3, o.stage3),
            portage: merge_section(self.portage, o.portage),
            unknown: merge_unknown(self.unknown, o.unknown),
        }
    }

    /// Converts the merged layer into a [`Configuration`], collecting every
    /// violation instead of stopping at the first.
    pub fn validate(self) -> Result<Configuration, ConfigError> {
        let mut v = Validator::default();

        for key in self.unknown.keys() {
            v.push(key, "unknown configuration key");
        }

        let target_disk = v.required("target_disk", self.target_disk).unwrap_or_default();
        if !target_disk.is_empty() && !is_device_path(&target_disk) {
            v.push(
                "target_disk",
                format!("'{}' is not a block device path (expected /dev/…)", target_disk),
            );
        }

        let mount_root = v.required("mount_root", self.mount_root).unwrap_or_default();
        if !mount_root.is_empty() && (!mount_root.starts_with('/') || mount_root == "/") {
            v.push("mount_root", "must be an absolute path other than /");
        }

        let partition_table = v
            .enumerated("partition_table", self.partition_table, PartitionTable::parse, PartitionTable::choices)
            .unwrap_or(PartitionTable::Gpt);

        let partitions = validate_partitions(&mut v, self.partitions.unwrap_or_default());
        let network = validate_network(&mut v, self.network.unwrap_or_default());
        let locale = validate_locale(&mut v, self.locale.unwrap_or_default());
        let users = validate_users(&mut v, self.users.unwrap_or_default());
        let kernel = validate_kernel(&mut v, self.kernel.unwrap_or_default());

        let bootloader = v
            .enumerated("bootloader", self.bootloader, BootloaderType::parse, BootloaderType::choices)
            .unwrap_or(BootloaderType::Grub);
        let profile = v
            .enumerated("profile", self.profile, Profile::parse, Profile::choices)
            .unwrap_or(Profile::Custom);

        let stage3 = validate_stage3(&mut v, self.stage3.unwrap_or_default());
        let portage = validate_portage(&mut v, self.portage.unwrap_or_default());

        let config = Configuration {
            target_disk,
            mount_root: PathBuf::from(mount_root),
            partition_table,
            partitions,
            network,
            locale,
            users,
            kernel,
            bootloader,
            profile,
            stage3,
            portage,
        };

        if config.bootloader == BootloaderType::SystemdBoot && config.esp().is_none() {
            v.push(
                "bootloader",
                "systemd-boot needs a vfat partition mounted at /boot or /boot/efi",
            );
        }
        if config.bootloader == BootloaderType::Lilo && config.partition_table == PartitionTable::Gpt {
            warn!("lilo on a GPT disk relies on BIOS compatibility mode");
        }

        v.finish(config)
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

/// Builds the run's configuration: `defaults < file < overrides`, then validates.
pub fn load(
    defaults: ConfigLayer,
    file: Option<&Path>,
    overrides: ConfigLayer,
) -> Result<Configuration, ConfigError> {
    let mut merged = defaults;
    if let Some(path) = file {
        info!("Loading configuration from {}", path.display());
        merged = merged.merge(ConfigLayer::from_file(path)?);
    } else {
        debug!("No configuration file given, using defaults");
    }
    let config = merged.merge(overrides).validate()?;
    info!(
        disk = %config.target_disk,
        profile = %config.profile,
        bootloader = %config.bootloader,
        "Configuration validated"
    );
    Ok(config)
}

// ── Validation helpers ────────────────────────────────────────────────────────

#[derive(Default)]
struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(Violation::new(field, reason));
    }

    fn required(&mut self, field: &str, value: Option<String>) -> Option<String> {
        match value {
            Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => {
                self.push(field, "required field is missing");
                None
            }
        }
    }

    fn enumerated<T>(
        &mut self,
        field: &str,
        value: Option<String>,
        parse: fn(&str) -> Option<T>,
        choices: fn() -> String,
    ) -> Option<T> {
        let raw = self.required(field, value)?;
        let parsed = parse(&raw);
        if parsed.is_none() {
            self.push(field, format!("unknown value '{}' (expected one of: {})", raw, choices()));
        }
        parsed
    }

    fn unknown_keys(&mut self, section: &str, unknown: &BTreeMap<String, serde_yaml::Value>) {
        for key in unknown.keys() {
            self.push(format!("{}.{}", section, key), "unknown configuration key");
        }
    }

    fn finish(self, config: Configuration) -> Result<Configuration, ConfigError> {
        if self.violations.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(self.violations))
        }
    }
}

fn is_device_path(path: &str) -> bool {
    path.starts_with("/dev/")
        && path.len() > "/dev/".len()
        && !path.ends_with('/')
        && !path.contains("..")
        && !path.chars().any(char::is_whitespace)
}

fn validate_partitions(v: &mut Validator, layers: Vec<PartitionLayer>) -> Vec<Partition> {
    if layers.is_empty() {
        v.push("partitions", "at least one partition is required");
        return Vec::new();
    }

    let mut out = Vec::with_capacity(layers.len());
    let mut seen = BTreeSet::new();
    let mut percent_total = 0.0;
    let mut saw_percent = false;

    for (i, layer) in layers.into_iter().enumerate() {
        let field = format!("partitions[{}]", i);
        v.unknown_keys(&field, &layer.unknown);

        let mount = v.required(&format!("{}.mount_point", field), layer.mount_point);
        let fs = v.enumerated(
            &format!("{}.filesystem", field),
            layer.filesystem,
            Filesystem::parse,
            Filesystem::choices,
        );
        let size = match layer.size {
            None => {
                v.push(format!("{}.size", field), "required field is missing");
                None
            }
            Some(raw) => match raw.parse() {
                Ok(size) => Some(size),
                Err(reason) => {
                    v.push(format!("{}.size", field), reason);
                    None
                }
            },
        };

        if let Some(ref mount) = mount {
            if !seen.insert(mount.clone()) {
                v.push(format!("{}.mount_point", field), format!("duplicate mount point '{}'", mount));
            }
            if mount != "swap" && !mount.starts_with('/') {
                v.push(format!("{}.mount_point", field), "must be an absolute path or 'swap'");
            }
        }

        match (&mount, fs) {
            (Some(m), Some(Filesystem::Swap)) if m != "swap" => {
                v.push(format!("{}.mount_point", field), "swap partitions must use mount point 'swap'")
            }
            (Some(m), Some(fs)) if m == "swap" && fs != Filesystem::Swap => {
                v.push(format!("{}.filesystem", field), "mount point 'swap' needs filesystem swap")
            }
            (Some(m), Some(Filesystem::Vfat)) if m == "/" => {
                v.push(format!("{}.filesystem", field), "root cannot be vfat")
            }
            _ => {}
        }

        match size {
            Some(PartitionSize::Percent(p)) => {
                saw_percent = true;
                percent_total += p;
            }
            Some(PartitionSize::Bytes(_)) if saw_percent => v.push(
                format!("{}.size", field),
                "fixed-size partitions must come before percentage partitions",
            ),
            _ => {}
        }

        if let (Some(mount_point), Some(size), Some(filesystem)) = (mount, size, fs) {
            out.push(Partition {
                mount_point,
                size,
                filesystem,
            });
        }
    }

    if percent_total > 100.0 + f64::EPSILON {
        v.push(
            "partitions",
            format!("percentage sizes add up to {}% (must be at most 100%)", percent_total),
        );
    }
    if !seen.contains("/") {
        v.push("partitions", "exactly one partition must mount at /");
    }

    out
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn is_cidr(address: &str) -> bool {
    let Some((ip, prefix)) = address.split_once('/') else {
        return false;
    };
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    let max = if ip.is_ipv4() { 32 } else { 128 };
    prefix.parse::<u8>().map(|p| p <= max).unwrap_or(false)
}

fn validate_network(v: &mut Validator, layer: NetworkLayer) -> Network {
    v.unknown_keys("network", &layer.unknown);

    let hostname = v.required("network.hostname", layer.hostname).unwrap_or_default();
    if !hostname.is_empty() && !is_hostname(&hostname) {
        v.push("network.hostname", format!("'{}' is not a valid hostname", hostname));
    }

    let mut names = BTreeSet::new();
    let mut interfaces = Vec::new();
    for (i, iface) in layer.interfaces.unwrap_or_default().into_iter().enumerate() {
        let field = format!("network.interfaces[{}]", i);
        let Some(name) = v.required(&format!("{}.name", field), iface.name) else {
            continue;
        };
        if !names.insert(name.clone()) {
            v.push(format!("{}.name", field), format!("duplicate interface '{}'", name));
        }
        let dhcp = iface.dhcp.unwrap_or(iface.address.is_none());
        match iface.address {
            Some(ref a) if !is_cidr(a) => {
                v.push(format!("{}.address", field), format!("'{}' is not in CIDR form", a))
            }
            None if !dhcp => v.push(format!("{}.address", field), "static interface needs an address"),
            _ => {}
        }
        if let Some(ref gw) = iface.gateway {
            if gw.parse::<IpAddr>().is_err() {
                v.push(format!("{}.gateway", field), format!("'{}' is not an IP address", gw));
            }
        }
        interfaces.push(Interface {
            name,
            dhcp,
            address: iface.address,
            gateway: iface.gateway,
        });
    }

    let mut dns = Vec::new();
    for (i, server) in layer.dns.unwrap_or_default().iter().enumerate() {
        match server.parse() {
            Ok(ip) => dns.push(ip),
            Err(_) => v.push(format!("network.dns[{}]", i), format!("'{}' is not an IP address", server)),
        }
    }

    Network {
        hostname,
        interfaces,
        dns,
    }
}

fn validate_locale(v: &mut Validator, layer: LocaleLayer) -> Locale {
    v.unknown_keys("locale", &layer.unknown);
    let lang = v.required("locale.lang", layer.lang).unwrap_or_default();
    let timezone = v.required("locale.timezone", layer.timezone).unwrap_or_default();
    let keymap = v.required("locale.keymap", layer.keymap).unwrap_or_default();

    if timezone.contains("..") || timezone.starts_with('/') {
        v.push("locale.timezone", format!("'{}' is not a zoneinfo name", timezone));
    }
    if lang.chars().any(char::is_whitespace) {
        v.push("locale.lang", format!("'{}' is not a locale name", lang));
    }

    Locale {
        lang,
        timezone,
        keymap,
    }
}

fn is_user_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && name.len() <= 32
}

fn validate_users(v: &mut Validator, layers: Vec<UserLayer>) -> Vec<User> {
    let mut seen = BTreeSet::new();
    let mut users = Vec::new();
    for (i, layer) in layers.into_iter().enumerate() {
        let field = format!("users[{}]", i);
        let name = v.required(&format!("{}.name", field), layer.name);
        let privileges = match layer.privileges {
            None => Some(Privilege::Standard),
            Some(raw) => v.enumerated(&format!("{}.privileges", field), Some(raw), Privilege::parse, Privilege::choices),
        };
        let Some(name) = name else { continue };
        if !is_user_name(&name) || name == "root" {
            v.push(format!("{}.name", field), format!("'{}' is not a valid user name", name));
        }
        if !seen.insert(name.clone()) {
            v.push(format!("{}.name", field), format!("duplicate user '{}'", name));
        }
        if let Some(privileges) = privileges {
            users.push(User { name, privileges });
        }
    }
    users
}

fn validate_kernel(v: &mut Validator, layer: KernelLayer) -> Kernel {
    v.unknown_keys("kernel", &layer.unknown);
    let source = v
        .enumerated("kernel.source", layer.source, KernelSource::parse, KernelSource::choices)
        .unwrap_or(KernelSource::GentooSources);
    let config = v
        .enumerated("kernel.config", layer.config, KernelConfigProfile::parse, KernelConfigProfile::choices)
        .unwrap_or(KernelConfigProfile::Genkernel);
    let jobs = match layer.jobs.unwrap_or(0) {
        n if n < 0 => {
            v.push("kernel.jobs", "must be non-negative");
            0
        }
        n => u32::try_from(n).unwrap_or(u32::MAX),
    };
    Kernel {
        source,
        config,
        initramfs: layer.initramfs.unwrap_or(true),
        firmware: layer.firmware.unwrap_or(true),
        jobs,
    }
}

fn is_mirror_url(url: &str) -> bool {
    ["http://", "https://", "rsync://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len())
}

fn validate_stage3(v: &mut Validator, layer: Stage3Layer) -> Stage3 {
    v.unknown_keys("stage3", &layer.unknown);
    let mirror = v.required("stage3.mirror", layer.mirror).unwrap_or_default();
    if !mirror.is_empty() && !is_mirror_url(&mirror) {
        v.push("stage3.mirror", format!("'{}' is not an http(s) or rsync URL", mirror));
    }
    Stage3 {
        mirror,
        arch: v.required("stage3.arch", layer.arch).unwrap_or_default(),
        variant: v.required("stage3.variant", layer.variant).unwrap_or_default(),
        verify_signature: layer.verify_signature.unwrap_or(true),
    }
}

fn validate_portage(v: &mut Validator, layer: PortageLayer) -> Portage {
    v.unknown_keys("portage", &layer.unknown);
    let mirrors = layer.mirrors.unwrap_or_default();
    for (i, m) in mirrors.iter().enumerate() {
        if !is_mirror_url(m) {
            v.push(format!("portage.mirrors[{}]", i), format!("'{}' is not an http(s) or rsync URL", m));
        }
    }
    Portage {
        make_opts: layer.make_opts.filter(|s| !s.trim().is_empty()),
        use_flags: layer.use_flags.unwrap_or_default(),
        accept_keywords: layer.accept_keywords.unwrap_or_default(),
        mirrors,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
