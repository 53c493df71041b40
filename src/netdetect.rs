use anyhow::{bail, Context, Result};
use if_addrs::get_if_addrs;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Non-loopback interface addresses, IPv4 first, used as default listen addresses.
///
/// Link-local IPv6 addresses are skipped: a redirect rule on them needs a scope.
pub fn detect_listen_ips() -> Result<Vec<IpAddr>> {
    let ips: BTreeSet<IpAddr> = get_if_addrs()
        .context("listing network interfaces")?
        .into_iter()
        .map(|iface| iface.ip())
        .filter(is_listen_candidate)
        .collect();
    if ips.is_empty() {
        bail!("no non-loopback interface addresses found; pass --listen");
    }
    Ok(ips.into_iter().collect())
}

/// Parse a comma-separated list of listen IPs. Empty entries are skipped.
pub fn parse_listen_ips(s: &str) -> Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let ip: IpAddr = entry
            .parse()
            .with_context(|| format!("{entry:?} is not a valid IP"))?;
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    if out.is_empty() {
        bail!("no listen IPs given");
    }
    Ok(out)
}

fn is_listen_candidate(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback(),
        IpAddr::V6(v6) => !v6.is_loopback() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}
