use std::fmt;
use std::future::Future;
use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::types::Proto;

pub const NAT_TABLE: &str = "nat";
pub const CHAIN: &str = "PREROUTING";
pub const INSERT_POS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnatRule {
    pub destination: IpAddr,
    pub proto: Proto,
    pub to_port: u16,
    pub comment: String,
}

impl DnatRule {
    /// Rule specification, without table/chain/operation.
    pub fn args(&self) -> Vec<String> {
        let proto = match self.proto {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        };
        vec![
            "--destination".into(),
            self.destination.to_string(),
            "-p".into(),
            proto.into(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            format!(":{}", self.to_port),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            self.comment.clone(),
        ]
    }
}

impl fmt::Display for DnatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Backend that applies rules. Split out so the bookkeeping is testable without root.
pub trait Firewall: Send + Sync {
    fn exists(&self, rule: &DnatRule) -> impl Future<Output = Result<bool>> + Send;
    fn insert(&self, rule: &DnatRule) -> impl Future<Output = Result<()>> + Send;
    fn delete(&self, rule: &DnatRule) -> impl Future<Output = Result<()>> + Send;
}

/// Shells out to `iptables` for IPv4 rules and `ip6tables` for IPv6 rules.
#[derive(Debug, Clone, Default)]
pub struct Iptables;

impl Iptables {
    fn binary(rule: &DnatRule) -> &'static str {
        if rule.destination.is_ipv4() {
            "iptables"
        } else {
            "ip6tables"
        }
    }

    async fn exec(rule: &DnatRule, op: &[&str]) -> Result<std::process::Output> {
        let bin = Self::binary(rule);
        let output = Command::new(bin)
            .arg("--wait")
            .args(["-t", NAT_TABLE])
            .args(op)
            .args(rule.args())
            .output()
            .await
            .with_context(|| format!("running {bin}"))?;
        Ok(output)
    }

    fn check_status(rule: &DnatRule, output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        bail!(
            "{} failed ({}): {}",
            Self::binary(rule),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}

impl Firewall for Iptables {
    async fn exists(&self, rule: &DnatRule) -> Result<bool> {
        let output = Self::exec(rule, &["-C", CHAIN]).await?;
        // `-C` exits 1 when the rule is absent; anything else non-zero is a real error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Self::check_status(rule, &output).map(|()| false),
        }
    }

    async fn insert(&self, rule: &DnatRule) -> Result<()> {
        let pos = INSERT_POS.to_string();
        let output = Self::exec(rule, &["-I", CHAIN, &pos]).await?;
        Self::check_status(rule, &output)
    }

    async fn delete(&self, rule: &DnatRule) -> Result<()> {
        let output = Self::exec(rule, &["-D", CHAIN]).await?;
        Self::check_status(rule, &output)
    }
}

/// Tracks the rules this process inserted so shutdown removes exactly those.
#[derive(Debug)]
pub struct Redirector<F> {
    fw: F,
    inserted: Vec<DnatRule>,
}

impl<F: Firewall> Redirector<F> {
    pub fn new(fw: F) -> Self {
        Self {
            fw,
            inserted: Vec::new(),
        }
    }

    pub fn inserted(&self) -> &[DnatRule] {
        &self.inserted
    }

    /// Redirect every `proto` port on `ip` to `to_port`.
    ///
    /// Loopback addresses are rejected: PREROUTING never sees their traffic.
    pub async fn redirect(
        &mut self,
        ip: IpAddr,
        to_port: u16,
        protos: &[Proto],
        comment: &str,
    ) -> Result<()> {
        if ip.is_loopback() {
            bail!("{ip} is a loopback IP");
        }
        for &proto in protos {
            let rule = DnatRule {
                destination: ip,
                proto,
                to_port,
                comment: comment.to_owned(),
            };
            if self.fw.exists(&rule).await? {
                debug!("firewall rule already present: {rule}");
                continue;
            }
            info!("adding firewall rule {rule}");
            self.fw
                .insert(&rule)
                .await
                .with_context(|| format!("inserting rule {rule}"))?;
            self.inserted.push(rule);
        }
        Ok(())
    }

    /// Remove every inserted rule, carrying on past failures and reporting them together.
    pub async fn cleanup(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for rule in std::mem::take(&mut self.inserted) {
            debug!("removing firewall rule {rule}");
            if let Err(e) = self.fw.delete(&rule).await {
                warn!("failed to remove firewall rule {rule}: {e:#}");
                failures.push(format!("{rule}: {e:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            bail!(
                "failed to remove {} firewall rule(s): {}",
                failures.len(),
                failures.join("; ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFirewall {
        present: Mutex<Vec<DnatRule>>,
        log: Mutex<Vec<String>>,
        fail_delete_port: Option<u16>,
    }

    impl Firewall for FakeFirewall {
        async fn exists(&self, rule: &DnatRule) -> Result<bool> {
            Ok(self.present.lock().unwrap().contains(rule))
        }

        async fn insert(&self, rule: &DnatRule) -> Result<()> {
            self.log.lock().unwrap().push(format!("I {rule}"));
            self.present.lock().unwrap().push(rule.clone());
            Ok(())
        }

        async fn delete(&self, rule: &DnatRule) -> Result<()> {
            self.log.lock().unwrap().push(format!("D {rule}"));
            if self.fail_delete_port == Some(rule.to_port) && rule.proto == Proto::Udp {
                bail!("simulated failure");
            }
            self.present.lock().unwrap().retain(|r| r != rule);
            Ok(())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn address_family_picks_binary() {
        let rule = |dest: &str| DnatRule {
            destination: ip(dest),
            proto: Proto::Tcp,
            to_port: 1337,
            comment: "portquiz".into(),
        };
        assert_eq!(Iptables::binary(&rule("192.0.2.10")), "iptables");
        assert_eq!(Iptables::binary(&rule("2001:db8::1")), "ip6tables");
    }

    #[test]
    fn rule_renders_iptables_args() {
        let rule = DnatRule {
            destination: ip("192.0.2.10"),
            proto: Proto::Tcp,
            to_port: 1337,
            comment: "portquiz".into(),
        };
        assert_eq!(
            rule.to_string(),
            "--destination 192.0.2.10 -p tcp -j DNAT --to-destination :1337 -m comment --comment portquiz"
        );
    }

    #[tokio::test]
    async fn loopback_is_rejected() {
        let mut r = Redirector::new(FakeFirewall::default());
        let err = r
            .redirect(ip("127.0.0.123"), 1337, &[Proto::Tcp], "portquiz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loopback"));
        assert!(r.inserted().is_empty());
    }

    #[tokio::test]
    async fn inserts_once_per_protocol_and_skips_existing() {
        let mut r = Redirector::new(FakeFirewall::default());
        r.redirect(ip("192.0.2.10"), 1337, &[Proto::Tcp, Proto::Udp], "portquiz")
            .await
            .unwrap();
        r.redirect(ip("192.0.2.10"), 1337, &[Proto::Tcp], "portquiz")
            .await
            .unwrap();
        assert_eq!(r.inserted().len(), 2);
        assert_eq!(r.fw.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_own_rules_and_accumulates_errors() {
        let pre_existing = DnatRule {
            destination: ip("2001:db8::1"),
            proto: Proto::Tcp,
            to_port: 1337,
            comment: "portquiz".into(),
        };
        let fw = FakeFirewall {
            present: Mutex::new(vec![pre_existing.clone()]),
            fail_delete_port: Some(1337),
            ..FakeFirewall::default()
        };
        let mut r = Redirector::new(fw);
        r.redirect(ip("2001:db8::1"), 1337, &[Proto::Tcp, Proto::Udp], "portquiz")
            .await
            .unwrap();
        r.redirect(ip("192.0.2.10"), 1337, &[Proto::Tcp], "portquiz")
            .await
            .unwrap();
        assert_eq!(r.inserted().len(), 2);

        let err = r.cleanup().await.unwrap_err();
        assert!(err.to_string().contains("failed to remove 1 firewall rule(s)"));
        // Both deletes were attempted despite the first failing.
        let deletes: Vec<_> = r
            .fw
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("D "))
            .cloned()
            .collect();
        assert_eq!(deletes.len(), 2);
        // The rule we found in place is left alone.
        assert!(r.fw.present.lock().unwrap().contains(&pre_existing));
        assert!(r.inserted().is_empty());
    }
}
