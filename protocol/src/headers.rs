//! Hop-by-hop header stripping.
//!
//! A fixed set of HTTP headers only makes sense on one TCP connection and
//! must not leak across the relay. Both directions sanitize: the proxy
//! strips them from browser requests before framing, the LAN agent strips
//! them from target responses before replying.

/// Ordered `[name, value]` header pairs as they travel on the wire.
pub type HeaderList = Vec<(String, String)>;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailers",
];

/// Whether `name` is part of the hop-by-hop set (case-insensitive).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Returns `headers` with the hop-by-hop set removed, order preserved.
pub fn sanitize_headers(headers: &[(String, String)]) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> HeaderList {
        raw.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_hop_by_hop_case_insensitively() {
        let sanitized = sanitize_headers(&pairs(&[
            ("Host", "example.test"),
            ("Connection", "keep-alive"),
            ("Proxy-Connection", "keep-alive"),
            ("KEEP-ALIVE", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "h2c"),
            ("TE", "trailers"),
            ("Trailers", "Expires"),
            ("Content-Type", "text/plain"),
        ]));
        assert_eq!(
            sanitized,
            pairs(&[("Host", "example.test"), ("Content-Type", "text/plain")])
        );
    }

    #[test]
    fn keeps_order_and_duplicates() {
        let sanitized = sanitize_headers(&pairs(&[
            ("set-cookie", "a=1"),
            ("connection", "close"),
            ("set-cookie", "b=2"),
        ]));
        assert_eq!(sanitized, pairs(&[("set-cookie", "a=1"), ("set-cookie", "b=2")]));
    }
}
