use anyhow::{bail, Context, Result};

pub const LOWEST_PORT: u16 = 1;
pub const HIGHEST_PORT: u16 = 65535;

/// Parse a comma-separated port list such as `80,443,8080`.
///
/// Empty entries (`80,,443` or a trailing comma) are skipped. Any other entry that is
/// not a number in 1..=65535 fails the whole list. Order and duplicates are kept as
/// given, so every listed entry becomes its own set of probes.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    for (idx, raw) in s.split(',').enumerate() {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let port = parse_port_str(entry)
            .with_context(|| format!("entry {}: invalid port value: {entry}", idx + 1))?;
        out.push(port);
    }
    if out.is_empty() {
        bail!("no ports in list: {s:?}");
    }
    Ok(out)
}

/// Every port, 1 through 65535.
pub fn full_range() -> Vec<u16> {
    (LOWEST_PORT..=HIGHEST_PORT).collect()
}

/// Resolve the `--port` argument: an explicit list if given, else the full range.
pub fn select_ports(arg: Option<&str>) -> Result<Vec<u16>> {
    match arg {
        Some(list) if !list.trim().is_empty() => parse_port_list(list),
        _ => Ok(full_range()),
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val < u32::from(LOWEST_PORT) || val > u32::from(HIGHEST_PORT) {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_list() {
        assert_eq!(parse_port_list("80,443").unwrap(), vec![80, 443]);
    }

    #[test]
    fn parse_skips_empty_entries_and_trims() {
        assert_eq!(parse_port_list(" 22, ,80,").unwrap(), vec![22, 80]);
    }

    #[test]
    fn parse_keeps_duplicates_in_order() {
        assert_eq!(parse_port_list("443,80,443").unwrap(), vec![443, 80, 443]);
    }

    #[test]
    fn non_numeric_entry_fails_whole_list() {
        let err = parse_port_list("80,http,443").unwrap_err();
        assert!(format!("{err:#}").contains("invalid port value: http"));
    }

    #[test]
    fn out_of_range_values_error() {
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("70000").is_err());
    }

    #[test]
    fn default_is_full_range() {
        let ports = select_ports(None).unwrap();
        assert_eq!(ports.len(), 65535);
        assert_eq!(ports.first(), Some(&1));
        assert_eq!(ports.last(), Some(&65535));
    }
}
