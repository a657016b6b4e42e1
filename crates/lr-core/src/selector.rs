// Canonicalization helpers shared by the command builders.
//
// A selector whose value is empty or means "match everything" is dropped from
// the invocation: the tools treat an absent selector as match-all.
use ipnet::IpNet;

/// Trimmed, non-empty value or `None`.
pub fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// True for `0.0.0.0/0`, `::/0`, `default`-style wildcards and `all`/`any`.
pub fn is_any_address(value: &str) -> bool {
    match value.trim() {
        "" | "all" | "any" => true,
        other => other
            .parse::<IpNet>()
            .map(|net| net.prefix_len() == 0)
            .unwrap_or(false),
    }
}

/// Address selector worth emitting, or `None` when it would match everything.
pub fn address(value: Option<&str>) -> Option<&str> {
    present(value).filter(|v| !is_any_address(v))
}

/// Protocol selector worth emitting; `all`, `any` and `0` match every protocol.
pub fn protocol(value: Option<&str>) -> Option<&str> {
    present(value).filter(|v| !matches!(v.to_ascii_lowercase().as_str(), "all" | "any" | "0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_addresses_are_dropped() {
        assert_eq!(address(Some("0.0.0.0/0")), None);
        assert_eq!(address(Some("::/0")), None);
        assert_eq!(address(Some("all")), None);
        assert_eq!(address(Some("  ")), None);
        assert_eq!(address(None), None);
        assert_eq!(address(Some("10.0.0.0/8")), Some("10.0.0.0/8"));
        assert_eq!(address(Some("192.168.1.5")), Some("192.168.1.5"));
    }

    #[test]
    fn wildcard_protocols_are_dropped() {
        assert_eq!(protocol(Some("all")), None);
        assert_eq!(protocol(Some("ANY")), None);
        assert_eq!(protocol(Some("tcp")), Some("tcp"));
    }
}
