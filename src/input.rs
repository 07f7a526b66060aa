//! Provides a means to read, parse and hold configuration options for scans.
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, ValueEnum};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Deserialize as _;
use serde_derive::Deserialize;

const DEFAULT_WORKERS: usize = 100;
const DEFAULT_SAMPLES: u32 = 3;
const SPKI_DIGEST_LEN: usize = 32;

/// Which probe the run uses. Resolved once at startup.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// HTTP/3 capable QUIC front ends.
    #[default]
    Quic,
    /// TLS on tcp/443 with a pinned intermediate.
    Tls,
    /// TLS on tcp/443 answering for every configured server name.
    Sni,
    /// Plain ICMP echo reachability.
    Ping,
}

impl Operation {
    /// Lowercase name as used in config sections and backup file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quic => "quic",
            Self::Tls => "tls",
            Self::Sni => "sni",
            Self::Ping => "ping",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Settings of one operation. Durations are written in milliseconds.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    /// Front names presented as SNI; a random name is generated when empty.
    pub server_names: Vec<String>,
    /// Hosts requested at level 3, one chosen at random per sample.
    pub http_verify_hosts: Vec<String>,
    /// Deadline of the transport + TLS/QUIC handshake.
    #[serde(deserialize_with = "millis")]
    pub handshake_timeout: Duration,
    /// A sample must take longer than this to count.
    #[serde(deserialize_with = "millis")]
    pub min_rtt: Duration,
    /// Whole-sample deadline.
    #[serde(deserialize_with = "millis")]
    pub max_rtt: Duration,
    /// Stop once this many records are found.
    pub record_limit: usize,
    /// Range file to scan.
    pub input_file: PathBuf,
    /// Where the ranked addresses are written.
    pub output_file: PathBuf,
    /// Joins addresses in the output; `gop` writes a quoted list.
    pub output_separator: String,
    /// Verification depth, 1 to 4. Zero or below means handshake only.
    pub level: i32,
    /// Base64 SHA-256 digests of the SubjectPublicKeyInfo to pin.
    pub pinned_spki: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            server_names: Vec::new(),
            http_verify_hosts: Vec::new(),
            handshake_timeout: Duration::from_millis(2500),
            min_rtt: Duration::ZERO,
            max_rtt: Duration::from_millis(3000),
            record_limit: 100,
            input_file: PathBuf::from("./iprange.txt"),
            output_file: PathBuf::new(),
            output_separator: String::from("|"),
            level: 1,
            pinned_spki: Vec::new(),
        }
    }
}

impl ScanConfig {
    /// Picks the SNI value for one sample.
    pub fn server_name(&self) -> String {
        self.server_names
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(random_host)
    }

    /// Picks the level-3 verification host for one sample.
    pub fn verify_host(&self) -> Option<&str> {
        self.http_verify_hosts
            .choose(&mut rand::rng())
            .map(String::as_str)
    }

    /// Decodes `pinned_spki`.
    pub fn pins(&self) -> anyhow::Result<Vec<[u8; SPKI_DIGEST_LEN]>> {
        self.pinned_spki
            .iter()
            .map(|pin| decode_pin(pin))
            .collect()
    }
}

/// Decodes one base64 SHA-256 fingerprint.
pub fn decode_pin(pin: &str) -> anyhow::Result<[u8; SPKI_DIGEST_LEN]> {
    let bytes = STANDARD
        .decode(pin.trim())
        .with_context(|| format!("Pinned SPKI {pin:?} is not valid base64"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Pinned SPKI {pin:?} is {len} bytes, expected a SHA-256 digest"))
}

/// A host name of two or three labels, each three to six lowercase letters.
pub fn random_host() -> String {
    let mut rng = rand::rng();
    let labels = rng.random_range(2..=3);
    (0..labels)
        .map(|_| {
            let len = rng.random_range(3..=6);
            (0..len)
                .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// The configuration file, after the user overlay is merged in.
///
/// # Format
///
/// ```toml
/// operation = "quic"
/// scan_worker = 100
/// verify_ping = false
/// scan_count_per_ip = 3
/// backup_dir = "./bak"
/// ping_min_rtt = 0
/// ping_max_rtt = 800
///
/// [quic]
/// server_names = ["www.example.com"]
/// http_verify_hosts = ["www.example.com"]
/// handshake_timeout = 2500
/// max_rtt = 3000
/// record_limit = 100
/// input_file = "./iprange.txt"
/// output_file = "./quic_ip.txt"
/// level = 2
/// ```
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Probe used for this run.
    pub operation: Operation,
    /// Size of the worker pool.
    pub scan_worker: usize,
    /// Run the ICMP gate before the protocol probe.
    pub verify_ping: bool,
    /// Samples that must all succeed per address.
    pub scan_count_per_ip: u32,
    /// Directory receiving timestamped copies of the output.
    pub backup_dir: PathBuf,
    /// Gate replies faster than this are discarded; zero disables the bound.
    #[serde(deserialize_with = "millis")]
    pub ping_min_rtt: Duration,
    /// Gate timeout.
    #[serde(deserialize_with = "millis")]
    pub ping_max_rtt: Duration,
    /// `[quic]` section.
    pub quic: ScanConfig,
    /// `[tls]` section.
    pub tls: ScanConfig,
    /// `[sni]` section.
    pub sni: ScanConfig,
    /// `[ping]` section.
    pub ping: ScanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operation: Operation::default(),
            scan_worker: DEFAULT_WORKERS,
            verify_ping: false,
            scan_count_per_ip: DEFAULT_SAMPLES,
            backup_dir: PathBuf::from("./bak"),
            ping_min_rtt: Duration::ZERO,
            ping_max_rtt: Duration::from_millis(800),
            quic: ScanConfig::default(),
            tls: ScanConfig::default(),
            sni: ScanConfig::default(),
            ping: ScanConfig::default(),
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads `path` and, when present, the `.user` overlay beside it
    /// (`config.toml` + `config.user.toml`). Overlay tables are merged key by key.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let mut table = read_table(path)?;

        let overlay_path = user_overlay_path(path);
        if overlay_path.exists() {
            let overlay = read_table(&overlay_path)?;
            merge_tables(&mut table, overlay)
                .with_context(|| format!("Failed to merge {}", overlay_path.display()))?;
        }

        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Settings of the selected operation.
    pub fn section(&self) -> &ScanConfig {
        match self.operation {
            Operation::Quic => &self.quic,
            Operation::Tls => &self.tls,
            Operation::Sni => &self.sni,
            Operation::Ping => &self.ping,
        }
    }

    fn section_mut(&mut self) -> &mut ScanConfig {
        match self.operation {
            Operation::Quic => &mut self.quic,
            Operation::Tls => &mut self.tls,
            Operation::Sni => &mut self.sni,
            Operation::Ping => &mut self.ping,
        }
    }

    /// Applies command line overrides on top of the file values.
    pub fn merge(&mut self, opts: &Opts) {
        macro_rules! merge_global {
            ($($field: ident),+) => {
                $(
                    if let Some(value) = &opts.$field {
                        self.$field = value.clone();
                    }
                )+
            }
        }

        merge_global!(operation, scan_worker, verify_ping);

        let section = self.section_mut();
        macro_rules! merge_section {
            ($($opt: ident => $field: ident),+) => {
                $(
                    if let Some(value) = &opts.$opt {
                        section.$field = value.clone();
                    }
                )+
            }
        }

        merge_section!(
            input => input_file,
            output => output_file,
            record_limit => record_limit,
            level => level
        );
    }

    /// Resolves `./` paths against `exec_dir` and other relative paths against
    /// the working directory.
    pub fn resolve_paths(&mut self, exec_dir: &Path) -> anyhow::Result<()> {
        let operation = self.operation;
        self.backup_dir = resolve_path(&self.backup_dir, exec_dir)?;

        let section = self.section_mut();
        if section.output_file.as_os_str().is_empty() {
            section.output_file = PathBuf::from(format!("./{operation}_ip.txt"));
        }
        section.input_file = resolve_path(&section.input_file, exec_dir)?;
        section.output_file = resolve_path(&section.output_file, exec_dir)?;
        Ok(())
    }

    /// Corrects zero counts and rejects settings the selected probe cannot run with.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.scan_worker = self.scan_worker.max(1);
        self.scan_count_per_ip = self.scan_count_per_ip.max(1);

        let operation = self.operation;
        let section = self.section();
        if matches!(operation, Operation::Quic | Operation::Tls)
            && section.level > 2
            && section.http_verify_hosts.is_empty()
        {
            bail!("[{operation}] level {} needs at least one http_verify_hosts entry", section.level);
        }
        if section.max_rtt.is_zero() {
            bail!("[{operation}] max_rtt must be greater than zero");
        }
        section.pins()?;
        Ok(())
    }
}

fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    let content = content.trim_start_matches('\u{feff}');
    toml::from_str(content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// `dir/config.toml` -> `dir/config.user.toml`.
fn user_overlay_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.user.{}", ext.to_string_lossy()),
        None => format!("{stem}.user"),
    };
    path.with_file_name(name)
}

/// Deep-merges `overlay` into `base`. Nested tables merge; anything else is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) -> anyhow::Result<()> {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)?;
            }
            (Some(existing), toml::Value::Table(_)) => {
                bail!("key {key:?} is a table in the overlay but {} in the base", existing.type_str());
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
    Ok(())
}

/// `./x` becomes `exec_dir/x`; any other relative path is taken from the
/// working directory.
pub fn resolve_path(path: &Path, exec_dir: &Path) -> anyhow::Result<PathBuf> {
    if path.starts_with(".") {
        let relative = path.strip_prefix(".").unwrap_or(path);
        return Ok(exec_dir.join(relative));
    }
    std::path::absolute(path).with_context(|| format!("Cannot resolve path {}", path.display()))
}

/// Directory holding the running executable.
pub fn executable_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate the running executable")?;
    Ok(exe
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf))
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
/// Finds IPv4 addresses that front a target service over QUIC, TLS, SNI or ICMP.
/// Values given here override the configuration file.
pub struct Opts {
    /// Path to the TOML configuration file. A leading "./" is relative to the executable.
    #[arg(short, long, default_value = "./config.toml")]
    pub config_path: PathBuf,

    /// The probe to run.
    #[arg(short, long, value_enum, ignore_case = true)]
    pub operation: Option<Operation>,

    /// Number of concurrent workers.
    #[arg(short = 'w', long)]
    pub scan_worker: Option<usize>,

    /// Run an ICMP echo before the protocol probe and drop silent addresses.
    #[arg(long)]
    pub verify_ping: Option<bool>,

    /// IP range file of the selected operation.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output file of the selected operation.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Stop after this many records.
    #[arg(short = 'n', long)]
    pub record_limit: Option<usize>,

    /// Verification level, 1 (handshake) to 4 (response content).
    #[arg(short, long)]
    pub level: Option<i32>,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    /// Parses the process arguments.
    pub fn read() -> Self {
        Self::parse()
    }
}
