mod op_timer;

pub(crate) use op_timer::OpTimer;


/// accept ip either like 127.0.0.1:2379 or docker host name: etcd1:2379
pub(crate) fn address_str(addr: &str) -> String {
    let normalized = addr.trim().trim_start_matches("http://");
    format!("http://{normalized}")
}

/// Only plaintext `http://` (or scheme-less) endpoints can be dialed
pub(crate) fn is_tls_endpoint(addr: &str) -> bool {
    addr.trim().starts_with("https://")
}
