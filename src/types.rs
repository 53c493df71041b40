use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Transport used by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

/// Optional address-family pin for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpVersion {
    /// Whatever the resolver returns first.
    #[default]
    Any,
    V4,
    V6,
}

impl IpVersion {
    fn suffix(self) -> &'static str {
        match self {
            IpVersion::Any => "",
            IpVersion::V4 => "4",
            IpVersion::V6 => "6",
        }
    }
}

/// Protocol plus address family, rendered as `tcp`, `tcp4`, `udp6`, ...
///
/// Serialized as that tag in the JSON report.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct ProbeKind {
    pub proto: Proto,
    pub version: IpVersion,
}

impl ProbeKind {
    pub const fn new(proto: Proto, version: IpVersion) -> Self {
        Self { proto, version }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        };
        write!(f, "{proto}{}", self.version.suffix())
    }
}

impl FromStr for ProbeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (proto, rest) = if let Some(rest) = s.strip_prefix("tcp") {
            (Proto::Tcp, rest)
        } else if let Some(rest) = s.strip_prefix("udp") {
            (Proto::Udp, rest)
        } else {
            bail!("unknown probe kind: {s}");
        };
        let version = match rest {
            "" => IpVersion::Any,
            "4" => IpVersion::V4,
            "6" => IpVersion::V6,
            _ => bail!("unknown probe kind: {s}"),
        };
        Ok(Self { proto, version })
    }
}

impl From<ProbeKind> for String {
    fn from(kind: ProbeKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ProbeKind {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Final verdict for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Unknown,
    Open,
    Closed,
}

/// One unit of work. Moves producer -> worker -> collector; only the worker mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTask {
    pub attempt: u32,
    pub kind: ProbeKind,
    pub port: u16,
    pub outcome: Outcome,
}

impl ProbeTask {
    pub fn new(kind: ProbeKind, port: u16) -> Self {
        Self {
            attempt: 0,
            kind,
            port,
            outcome: Outcome::Unknown,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outcome == Outcome::Open
    }
}

/// One drained result in the run report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub kind: ProbeKind,
    pub port: u16,
    pub open: bool,
    pub attempts: u32,
    pub timestamp: String,
}

/// Aggregate results and progress counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanResults {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub open_count: u64,
    pub cancelled: bool,
    pub entries: Vec<ScanEntry>,
}

pub fn write_results_json(path: &Path, results: &ScanResults) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parameterized::parameterized;

    #[parameterized(tag = {
        "tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"
    })]
    fn kind_tags_round_trip_through_display(tag: &str) {
        let kind: ProbeKind = tag.parse().unwrap();
        assert_eq!(kind.to_string(), tag);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("sctp".parse::<ProbeKind>().is_err());
        assert!("tcp5".parse::<ProbeKind>().is_err());
        assert!("".parse::<ProbeKind>().is_err());
    }

    fn sample_results() -> ScanResults {
        ScanResults {
            scanned_total: 2,
            scanned_done: 2,
            open_count: 1,
            cancelled: false,
            entries: vec![
                ScanEntry {
                    kind: ProbeKind::new(Proto::Tcp, IpVersion::V4),
                    port: 443,
                    open: true,
                    attempts: 1,
                    timestamp: "2024-01-01T00:00:00Z".into(),
                },
                ScanEntry {
                    kind: ProbeKind::new(Proto::Udp, IpVersion::Any),
                    port: 53,
                    open: false,
                    attempts: 3,
                    timestamp: "2024-01-01T00:00:01Z".into(),
                },
            ],
        }
    }

    #[test]
    fn results_json_is_written_pretty_and_reads_back() {
        let path = std::env::temp_dir()
            .join(format!("portquiz-results-{}.json", std::process::id()));
        let results = sample_results();
        write_results_json(&path, &results).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(text.contains('\n'));
        assert!(text.contains("\"kind\": \"tcp4\""));

        let back: ScanResults = serde_json::from_str(&text).unwrap();
        assert_eq!(back.open_count, 1);
        assert_eq!(back.entries, results.entries);
    }

    #[test]
    fn results_json_to_directory_fails() {
        let dir = std::env::temp_dir();
        assert!(write_results_json(&dir, &sample_results()).is_err());
    }

    #[test]
    fn report_rejects_unknown_kind_tag() {
        let json = r#"{"kind":"sctp","port":1,"open":false,"attempts":1,"timestamp":""}"#;
        assert!(serde_json::from_str::<ScanEntry>(json).is_err());
    }

    #[test]
    fn new_task_starts_unknown() {
        let t = ProbeTask::new(ProbeKind::new(Proto::Udp, IpVersion::V6), 53);
        assert_eq!(t.attempt, 0);
        assert_eq!(t.outcome, Outcome::Unknown);
        assert!(!t.is_open());
    }
}
