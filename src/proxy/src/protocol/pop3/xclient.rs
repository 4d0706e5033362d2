use crate::protocol::pop3::Pop3LoginSettings;
use crate::server::is_valid_dns_name;

use base64::prelude::{Engine, BASE64_STANDARD};
use itertools::Itertools;

/// Compose the XCLIENT line forwarding the original client's identity to a
/// trusted backend: `ADDR PORT SESSION TTL CLIENT-TRANSPORT [DESTNAME]
/// [FORWARD]`.
pub(crate) fn format_xclient(set: &Pop3LoginSettings) -> String {
    let mut line = format!(
        "XCLIENT ADDR={} PORT={} SESSION={} TTL={} CLIENT-TRANSPORT={}",
        set.client_ip,
        set.client_port,
        set.session_id,
        set.session_ttl - 1,
        if set.client_secured_tls {
            "TLS"
        } else {
            "insecure"
        }
    );
    if let Some(local_name) = set.local_name.as_deref() {
        if is_valid_dns_name(local_name) {
            line.push_str(" DESTNAME=");
            line.push_str(local_name);
        }
    }
    let forward = forward_fields(set);
    if !forward.is_empty() {
        line.push_str(" FORWARD=");
        line.push_str(&BASE64_STANDARD.encode(forward));
    }
    line
}

/// TAB-joined `name=value` passdb entries whose key begins `forward_`
/// (case-insensitive), kept in passdb order.
fn forward_fields(set: &Pop3LoginSettings) -> String {
    set.passdb_fields
        .iter()
        .filter(|(key, _)| {
            key.get(..8)
                .map_or(false, |prefix| prefix.eq_ignore_ascii_case("forward_"))
        })
        .map(|(key, value)| format!("{key}={value}"))
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pop3::Pop3LoginSettings;
    use base64::prelude::{Engine, BASE64_STANDARD};

    fn settings() -> Pop3LoginSettings {
        Pop3LoginSettings {
            client_ip: "192.0.2.7".parse().unwrap(),
            client_port: 51234,
            session_id: "a1b2c3".to_string(),
            session_ttl: 5,
            client_secured_tls: true,
            local_name: Some("pop.example.com".to_string()),
            passdb_fields: vec![
                ("forward_quota".to_string(), "100M".to_string()),
                ("nologin".to_string(), "y".to_string()),
                ("Forward_tag".to_string(), "vip".to_string()),
            ],
            ..Pop3LoginSettings::for_tests()
        }
    }

    #[test]
    fn test_key_order_and_transport() {
        let line = format_xclient(&settings());
        assert!(line.starts_with(
            "XCLIENT ADDR=192.0.2.7 PORT=51234 SESSION=a1b2c3 TTL=4 CLIENT-TRANSPORT=TLS"
        ));
        assert!(line.contains(" DESTNAME=pop.example.com"));
    }

    #[test]
    fn test_forward_round_trips_in_passdb_order() {
        let line = format_xclient(&settings());
        let encoded = line.split(" FORWARD=").nth(1).unwrap();
        let decoded = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"forward_quota=100M\tForward_tag=vip");
    }

    #[test]
    fn test_invalid_destname_is_dropped() {
        let mut set = settings();
        set.local_name = Some("bad_name!".to_string());
        let line = format_xclient(&set);
        assert!(!line.contains("DESTNAME"));
    }

    #[test]
    fn test_insecure_transport_without_forward() {
        let mut set = settings();
        set.client_secured_tls = false;
        set.passdb_fields.clear();
        let line = format_xclient(&set);
        assert!(line.contains("CLIENT-TRANSPORT=insecure"));
        assert!(!line.contains("FORWARD="));
    }
}
