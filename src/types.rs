use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tunneling protocol a candidate claims to speak.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolClass {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProtocolClass {
    /// URL scheme prefix used when routing a request through a candidate of this class.
    pub fn proxy_prefix(self) -> &'static str {
        match self {
            ProtocolClass::Http => "http://",
            ProtocolClass::Https => "https://",
            ProtocolClass::Socks4 => "socks4://",
            ProtocolClass::Socks5 => "socks5://",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolClass::Http => "http",
            ProtocolClass::Https => "https",
            ProtocolClass::Socks4 => "socks4",
            ProtocolClass::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProtocolClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProtocolClass::Http),
            "https" => Ok(ProtocolClass::Https),
            "socks4" => Ok(ProtocolClass::Socks4),
            "socks5" => Ok(ProtocolClass::Socks5),
            other => Err(format!("unknown protocol class: {other}")),
        }
    }
}

/// One proxy endpoint to be tested.
///
/// The address is never blank: [`Candidate::new`] rejects empty input and
/// anything with embedded whitespace, so a blank or mangled list entry can
/// never reach a probe or a result file.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    address: String,
    class: ProtocolClass,
}

impl Candidate {
    pub fn new(address: impl AsRef<str>, class: ProtocolClass) -> Option<Self> {
        let address = address.as_ref().trim();
        if address.is_empty() || address.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            address: address.to_string(),
            class,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn class(&self) -> ProtocolClass {
        self.class
    }

    /// Full proxy URL, e.g. `socks5://1.2.3.4:1080`.
    pub fn proxy_url(&self) -> String {
        format!("{}{}", self.class.proxy_prefix(), self.address)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class.proxy_prefix(), self.address)
    }
}

/// Why a probe attempt did not verify its candidate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConnectFailed,
    Timeout,
    NonSuccessStatus,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::ConnectFailed => "connect failed",
            FailureReason::Timeout => "timeout",
            FailureReason::NonSuccessStatus => "non-success status",
        };
        f.pad(s)
    }
}

/// Result of a single probe attempt through one candidate.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub success: bool,
    pub status: Option<u16>,
    pub response_metadata: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub latency_ms: u64,
}

impl ProbeOutcome {
    pub fn verified(candidate: Candidate, status: u16, metadata: Option<String>, latency_ms: u64) -> Self {
        Self {
            candidate,
            success: true,
            status: Some(status),
            response_metadata: metadata,
            failure_reason: None,
            latency_ms,
        }
    }

    pub fn failed(candidate: Candidate, reason: FailureReason, detail: Option<String>, latency_ms: u64) -> Self {
        Self {
            candidate,
            success: false,
            status: None,
            response_metadata: detail,
            failure_reason: Some(reason),
            latency_ms,
        }
    }
}

/// Counters and verified addresses for one protocol class in one run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Verified addresses the sink failed to persist.
    pub write_errors: u64,
    pub verified: Vec<String>,
}

impl BatchSummary {
    /// Attempts that ran to a conclusion (success, failure or timeout).
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Per-class section of a [`RunReport`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClassReport {
    pub class: ProtocolClass,
    pub source: String,
    pub output: String,
    pub list_available: bool,
    pub list_error: Option<String>,
    pub summary: BatchSummary,
}

/// Aggregate outcome of a full run over every configured protocol class.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub cancelled: bool,
    pub classes: Vec<ClassReport>,
}

impl RunReport {
    pub fn total_verified(&self) -> u64 {
        self.classes.iter().map(|c| c.summary.succeeded).sum()
    }
}
