//! Address parser (§4.1).
//!
//! Parses the CLI-style `[port]` / `[host, port]` argument pairs into a
//! validated `(host, port)`, and parses Scanner port-range specs
//! (`"a-b"`, `"p1,p2,…"`, `"p"`) into a sorted, deduplicated port set.

use std::collections::BTreeSet;

use crate::error::GocatError;

/// Parse `(args, default_host) -> (host, port)` per §4.1.
///
/// `args` must be `[port]` or `[host, port]`; anything else is
/// `MissingArguments`. Ports are strict decimal integers in `[1, 65535]`.
pub fn parse_host_port(args: &[&str], default_host: &str) -> Result<(String, u16), GocatError> {
    let (host, port_str) = match args {
        [port] => (default_host.to_string(), *port),
        [host, port] => (normalise_host(host)?, *port),
        _ => {
            return Err(GocatError::Validation(
                "expected [port] or [host, port]".to_string(),
            ))
        }
    };
    let port = parse_port(port_str)?;
    Ok((host, port))
}

/// Parse and strictly range-check a single port string (§4.1).
pub fn parse_port(s: &str) -> Result<u16, GocatError> {
    let value: u32 = s
        .parse()
        .map_err(|_| GocatError::Validation(format!("invalid port: {s}")))?;
    if value == 0 || value > 65535 {
        return Err(GocatError::Validation(format!(
            "port out of range [1, 65535]: {value}"
        )));
    }
    Ok(value as u16)
}

/// Validate a bare host string: reject empty, unwrap (and re-validate)
/// bracketed IPv6 literals used in combined `"[addr]:port"` forms.
pub fn normalise_host(host: &str) -> Result<String, GocatError> {
    if host.is_empty() {
        return Err(GocatError::Validation("empty host".to_string()));
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        inner
            .parse::<std::net::Ipv6Addr>()
            .map_err(|_| GocatError::Validation(format!("invalid ipv6 literal: {inner}")))?;
        return Ok(inner.to_string());
    }
    Ok(host.to_string())
}

/// Split a combined `"host:port"` or `"[addr]:port"` form.
pub fn split_host_port(combined: &str) -> Result<(String, u16), GocatError> {
    if let Some(rest) = combined.strip_prefix('[') {
        let (addr, after) = rest
            .split_once(']')
            .ok_or_else(|| GocatError::Validation(format!("unterminated ipv6 literal: {combined}")))?;
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| GocatError::Validation(format!("missing port after ipv6 literal: {combined}")))?;
        let host = normalise_host(&format!("[{addr}]"))?;
        return Ok((host, parse_port(port_str)?));
    }
    let (host, port_str) = combined
        .rsplit_once(':')
        .ok_or_else(|| GocatError::Validation(format!("missing port: {combined}")))?;
    Ok((normalise_host(host)?, parse_port(port_str)?))
}

/// Parse a Scanner port-range spec into a sorted, deduplicated port set (§4.1).
///
/// Accepts comma-separated items, each either a single port `"p"` or an
/// inclusive range `"a-b"` with `a <= b`.
pub fn parse_port_range(spec: &str) -> Result<BTreeSet<u16>, GocatError> {
    let mut out = BTreeSet::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(GocatError::Validation(format!(
                "invalid port range spec: {spec}"
            )));
        }
        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port(a.trim())
                .map_err(|_| GocatError::Validation(format!("invalid range start: {a}")))?;
            let end = parse_port(b.trim())
                .map_err(|_| GocatError::Validation(format!("invalid range end: {b}")))?;
            if start > end {
                return Err(GocatError::Validation(format!(
                    "invalid range {start}-{end}: start > end"
                )));
            }
            out.extend(start..=end);
        } else {
            out.insert(parse_port(item)?);
        }
    }
    Ok(out)
}

/// Render a port set back to its canonical comma-separated form, collapsing
/// consecutive runs into ranges. Inverse of [`parse_port_range`].
pub fn format_port_range(ports: &BTreeSet<u16>) -> String {
    let mut parts = Vec::new();
    let mut iter = ports.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}
