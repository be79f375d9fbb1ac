use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::ProtocolClass;

pub const DEFAULT_TARGET_URL: &str = "https://api.devjugal.com/ip";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONCURRENCY: usize = 256;
pub const MAX_CONCURRENCY: usize = 5_000;

const HTTP_LIST_URL: &str = "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/http.txt";
const SOCKS4_LIST_URL: &str = "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/socks4.txt";
const SOCKS5_LIST_URL: &str = "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/socks5.txt";

/// Where a candidate list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListLocation {
    Url(String),
    File(PathBuf),
}

impl ListLocation {
    /// `http(s)://...` is fetched remotely, anything else is read as a local path.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ListLocation::Url(s.to_string())
        } else {
            ListLocation::File(PathBuf::from(s))
        }
    }
}

/// One protocol class to probe: its candidate list and its result file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClassConfig {
    pub class: ProtocolClass,
    pub source: String,
    pub output: PathBuf,
}

impl ClassConfig {
    pub fn location(&self) -> ListLocation {
        ListLocation::parse(&self.source)
    }
}

/// Run configuration. Every field has a default so partial JSON files are accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub target_url: String,
    pub timeout_ms: u64,
    pub concurrency: usize,
    /// Require a 2xx answer from the target. Off by default: any response counts.
    pub strict_status: bool,
    pub classes: Vec<ClassConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            concurrency: DEFAULT_CONCURRENCY,
            strict_status: false,
            classes: default_classes(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Concurrency ceiling clamped into `1..=MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn class(&self, class: ProtocolClass) -> Option<&ClassConfig> {
        self.classes.iter().find(|c| c.class == class)
    }

    /// Keep only the listed classes, preserving configured order.
    pub fn retain_classes(&mut self, keep: &[ProtocolClass]) {
        if keep.is_empty() {
            return;
        }
        self.classes.retain(|c| keep.contains(&c.class));
    }

    /// Re-root every relative output file under `dir`.
    pub fn set_output_dir(&mut self, dir: impl AsRef<Path>) {
        for c in &mut self.classes {
            if c.output.is_relative() {
                c.output = dir.as_ref().join(&c.output);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        let lower = self.target_url.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            bail!("target_url must be an http(s) URL: {}", self.target_url);
        }
        for (i, c) in self.classes.iter().enumerate() {
            if self.classes[..i].iter().any(|o| o.class == c.class) {
                bail!("protocol class {} configured more than once", c.class);
            }
            if c.source.trim().is_empty() {
                bail!("protocol class {} has an empty source", c.class);
            }
            // Each class resets its own file after its list loads, so a shared
            // file would be deleted under a class that is already appending.
            if let Some(o) = self.classes[..i]
                .iter()
                .find(|o| same_file(&o.output, &c.output))
            {
                bail!(
                    "protocol classes {} and {} both write to {}",
                    o.class,
                    c.class,
                    c.output.display()
                );
            }
        }
        Ok(())
    }
}

/// Lexical comparison ignoring `.` components (`a.txt` == `./a.txt`).
fn same_file(a: &Path, b: &Path) -> bool {
    let strip = |p: &Path| -> PathBuf {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    };
    strip(a) == strip(b)
}

/// The three public lists and output file names the prober ships with.
pub fn default_classes() -> Vec<ClassConfig> {
    vec![
        ClassConfig {
            class: ProtocolClass::Http,
            source: HTTP_LIST_URL.to_string(),
            output: PathBuf::from("http_working_proxies.txt"),
        },
        ClassConfig {
            class: ProtocolClass::Socks4,
            source: SOCKS4_LIST_URL.to_string(),
            output: PathBuf::from("socks4_working_proxies.txt"),
        },
        ClassConfig {
            class: ProtocolClass::Socks5,
            source: SOCKS5_LIST_URL.to_string(),
            output: PathBuf::from("socks5_working_proxies.txt"),
        },
    ]
}

pub fn parse_config_str(s: &str) -> Result<Config> {
    let cfg: Config = serde_json::from_str(s).context("invalid config JSON")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load a JSON config file. Errors if the file cannot be read, parsed or validated.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
    parse_config_str(&content)
        .with_context(|| format!("in config file: {}", path.as_ref().display()))
}
