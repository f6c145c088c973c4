//! `MOVED` / `ASK` redirect parsing.
//!
//! Cluster servers answer a mis-routed command with an error reply of the
//! form `"<code> <slot> <host>:<port>"`. The host may be an IPv6 literal
//! in brackets. Parsing is total: anything malformed yields `None` and is
//! treated as an ordinary server error by the caller.

/// Whether a redirect is permanent or one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `MOVED`: the slot has permanently moved; re-learn topology.
    Moved,
    /// `ASK`: one-shot redirect during slot migration; topology unchanged.
    Ask,
}

/// A parsed redirect error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub host: String,
    pub port: u16,
}

impl Redirect {
    /// Parses a redirect out of an error string, if it is one.
    ///
    /// Accepted shapes:
    /// - `MOVED 3000 10.0.0.7:6379`
    /// - `ASK 3000 [2001:db8::1]:6379`
    pub fn parse(err: &str) -> Option<Redirect> {
        let mut parts = err.splitn(3, ' ');

        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };

        let slot: u16 = parts.next()?.parse().ok()?;
        if slot >= 16384 {
            return None;
        }

        let addr = parts.next()?;
        let (host, port) = split_host_port(addr)?;
        if host.is_empty() {
            return None;
        }

        Some(Redirect {
            kind,
            slot,
            host: host.to_string(),
            port,
        })
    }
}

/// Splits `host:port`, unwrapping a bracketed IPv6 host.
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port_str) = addr.rsplit_once(':')?;
    let port: u16 = port_str.parse().ok()?;

    let host = if let Some(stripped) = host.strip_prefix('[') {
        stripped.strip_suffix(']')?
    } else {
        host
    };

    Some((host, port))
}
