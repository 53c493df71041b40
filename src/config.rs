use std::time::Duration;

use anyhow::{bail, Result};

use crate::types::{IpVersion, ProbeKind, Proto};

pub const DEFAULT_SECRET: &str = "portquiz";
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Which address families to probe, from the `-4` / `-6` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionFilter {
    pub v4: bool,
    pub v6: bool,
}

impl VersionFilter {
    /// Neither flag leaves the family to the resolver; both flags probe each family.
    pub fn versions(self) -> Vec<IpVersion> {
        match (self.v4, self.v6) {
            (false, false) => vec![IpVersion::Any],
            (true, false) => vec![IpVersion::V4],
            (false, true) => vec![IpVersion::V6],
            (true, true) => vec![IpVersion::V4, IpVersion::V6],
        }
    }
}

/// Which results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayFilter {
    pub open: bool,
    pub closed: bool,
}

impl DisplayFilter {
    /// Setting neither `--open` nor `--closed` shows both.
    pub fn from_flags(open: bool, closed: bool) -> Self {
        if !open && !closed {
            Self {
                open: true,
                closed: true,
            }
        } else {
            Self { open, closed }
        }
    }
}

impl Default for DisplayFilter {
    fn default() -> Self {
        Self::from_flags(false, false)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub host: String,
    pub tcp: bool,
    pub udp: bool,
    pub ports: Vec<u16>,
    pub versions: VersionFilter,
    /// Bound on each network step of a single probe.
    pub timeout: Duration,
    /// Attempts per task before it is declared closed.
    pub retry: u32,
    /// Consecutive probes that must all succeed for one attempt to count as open.
    pub multi: u32,
    pub workers: usize,
    pub queue_depth: usize,
    pub secret: Vec<u8>,
    pub display: DisplayFilter,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            tcp: false,
            udp: false,
            ports: Vec::new(),
            versions: VersionFilter::default(),
            timeout: Duration::from_secs(5),
            retry: 3,
            multi: 1,
            workers: 20,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            secret: DEFAULT_SECRET.as_bytes().to_vec(),
            display: DisplayFilter::default(),
        }
    }
}

impl RunConfig {
    /// Check the configuration before any task is created.
    ///
    /// A retry or multi count of 0 is corrected to 1 rather than rejected.
    pub fn validate(mut self) -> Result<Self> {
        if !self.tcp && !self.udp {
            bail!("must set TCP and/or UDP");
        }
        if self.host.trim().is_empty() {
            bail!("pass IP/host to connect to");
        }
        if self.ports.is_empty() {
            bail!("no ports to probe");
        }
        if self.secret.is_empty() {
            bail!("shared secret must not be empty");
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        self.retry = self.retry.max(1);
        self.multi = self.multi.max(1);
        self.queue_depth = self.queue_depth.max(1);
        Ok(self)
    }

    /// Selected protocols, TCP first.
    pub fn protocols(&self) -> Vec<Proto> {
        let mut out = Vec::with_capacity(2);
        if self.tcp {
            out.push(Proto::Tcp);
        }
        if self.udp {
            out.push(Proto::Udp);
        }
        out
    }

    /// Every kind probed for a single port, in emission order.
    pub fn kinds(&self) -> Vec<ProbeKind> {
        let protos = self.protocols();
        self.versions
            .versions()
            .into_iter()
            .flat_map(|v| protos.iter().map(move |&p| ProbeKind::new(p, v)))
            .collect()
    }

    pub fn total_tasks(&self) -> u64 {
        self.ports.len() as u64 * self.kinds().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        RunConfig {
            host: "example.net".into(),
            tcp: true,
            ports: vec![80],
            ..RunConfig::default()
        }
    }

    #[test]
    fn version_suffix_sets() {
        let f = |v4, v6| VersionFilter { v4, v6 }.versions();
        assert_eq!(f(false, false), vec![IpVersion::Any]);
        assert_eq!(f(true, false), vec![IpVersion::V4]);
        assert_eq!(f(false, true), vec![IpVersion::V6]);
        assert_eq!(f(true, true), vec![IpVersion::V4, IpVersion::V6]);
    }

    #[test]
    fn display_defaults_to_both() {
        assert_eq!(
            DisplayFilter::from_flags(false, false),
            DisplayFilter { open: true, closed: true }
        );
        assert_eq!(
            DisplayFilter::from_flags(true, false),
            DisplayFilter { open: true, closed: false }
        );
    }

    #[test]
    fn no_protocol_is_fatal() {
        let cfg = RunConfig { tcp: false, ..base() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("TCP and/or UDP"));
    }

    #[test]
    fn empty_secret_is_fatal() {
        let cfg = RunConfig { secret: Vec::new(), ..base() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_counts_are_corrected() {
        let cfg = RunConfig { retry: 0, multi: 0, ..base() }.validate().unwrap();
        assert_eq!(cfg.retry, 1);
        assert_eq!(cfg.multi, 1);
    }

    #[test]
    fn task_count_is_cartesian_product() {
        let cfg = RunConfig {
            udp: true,
            ports: vec![22, 80, 443],
            versions: VersionFilter { v4: true, v6: true },
            ..base()
        };
        assert_eq!(cfg.total_tasks(), 3 * 2 * 2);
        let kinds: Vec<String> = cfg.kinds().iter().map(ToString::to_string).collect();
        assert_eq!(kinds, vec!["tcp4", "udp4", "tcp6", "udp6"]);
    }
}
