use std::borrow::Cow;

pub const BRIDGE_DRIVER: &str = "bridge";

/// Network as the runtime reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
}

/// Snapshot of a shared network and how many holders it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
    pub ref_count: usize,
    /// False when the network existed before this process looked it up;
    /// such networks are never removed.
    pub created: bool,
}

/// `host` as written in a URL authority: IPv6 literals are bracketed.
pub fn url_host(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{host}]"))
    } else {
        Cow::Borrowed(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_only_ipv6_literals() {
        assert_eq!(url_host("localhost"), "localhost");
        assert_eq!(url_host("10.0.0.5"), "10.0.0.5");
        assert_eq!(url_host("::1"), "[::1]");
        assert_eq!(url_host("[::1]"), "[::1]");
    }
}
