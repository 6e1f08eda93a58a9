//! Cluster key layout over the shared KV store. The
//! `{$group=…$}{$ns$}{$sys$}{$mod$}{$srv$}` shape is shared stored
//! state; existing deployments depend on it, so it is kept verbatim.

pub const GROUP_INFO: &str = "cluster_info";
pub const GROUP_MASTER: &str = "cluster_master";
pub const GROUP_EVENT_EXISTS: &str = "cluster_event_exists";
pub const GROUP_EVENT: &str = "cluster_event";

pub fn info_key(namespace: &str, sys_id: &str, module_id: &str, server_id: &str) -> String {
    node_key(GROUP_INFO, namespace, sys_id, module_id, server_id)
}

pub fn master_key(namespace: &str, sys_id: &str, module_id: &str) -> String {
    format!(
        "{{$group={}$}}{{${}$}}{{${}$}}{{${}$}}",
        GROUP_MASTER, namespace, sys_id, module_id
    )
}

pub fn event_exists_key(namespace: &str, sys_id: &str, module_id: &str, server_id: &str) -> String {
    node_key(GROUP_EVENT_EXISTS, namespace, sys_id, module_id, server_id)
}

pub fn event_key(namespace: &str, sys_id: &str, module_id: &str, server_id: &str) -> String {
    node_key(GROUP_EVENT, namespace, sys_id, module_id, server_id)
}

fn node_key(group: &str, namespace: &str, sys_id: &str, module_id: &str, server_id: &str) -> String {
    format!(
        "{{$group={}$}}{{${}$}}{{${}$}}{{${}$}}{{${}$}}",
        group, namespace, sys_id, module_id, server_id
    )
}

/// Pattern over all nodes below `(namespace[, sys][, module])`.
pub fn node_pattern(
    group: &str,
    namespace: &str,
    sys_id: Option<&str>,
    module_id: Option<&str>,
) -> String {
    let sys = sys_id.unwrap_or("*");
    let module = if sys_id.is_none() {
        "*"
    } else {
        module_id.unwrap_or("*")
    };
    node_key(group, namespace, sys, module, "*")
}

/// Pattern over master keys below `(namespace[, sys][, module])`.
pub fn master_pattern(namespace: &str, sys_id: Option<&str>, module_id: Option<&str>) -> String {
    let sys = sys_id.unwrap_or("*");
    let module = if sys_id.is_none() {
        "*"
    } else {
        module_id.unwrap_or("*")
    };
    format!(
        "{{$group={}$}}{{${}$}}{{${}$}}{{${}$}}",
        GROUP_MASTER, namespace, sys, module
    )
}

/// Split a node key back into its `(namespace, sys, module, server)`
/// coordinates.
pub fn parse_node_key(key: &str) -> Option<(String, String, String, String)> {
    let parts: Vec<&str> = key.split("$}{$").collect();
    if parts.len() != 5 {
        return None;
    }
    let server = parts[4].trim_end_matches("$}");
    Some((
        parts[1].to_string(),
        parts[2].to_string(),
        parts[3].to_string(),
        server.to_string(),
    ))
}

/// Rewrite an `event_exists` key into its event-queue sibling.
pub fn exists_to_event_key(exists_key: &str) -> String {
    exists_key.replace(
        &format!("{{$group={}$}}", GROUP_EVENT_EXISTS),
        &format!("{{$group={}$}}", GROUP_EVENT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_stored_state() {
        assert_eq!(
            info_key("ns", "S0001", "001", "01"),
            "{$group=cluster_info$}{$ns$}{$S0001$}{$001$}{$01$}"
        );
        assert_eq!(
            master_key("ns", "S0001", "001"),
            "{$group=cluster_master$}{$ns$}{$S0001$}{$001$}"
        );
    }

    #[test]
    fn patterns_widen_below_missing_levels() {
        assert_eq!(
            node_pattern(GROUP_INFO, "ns", None, None),
            "{$group=cluster_info$}{$ns$}{$*$}{$*$}{$*$}"
        );
        assert_eq!(
            node_pattern(GROUP_INFO, "ns", Some("S0001"), None),
            "{$group=cluster_info$}{$ns$}{$S0001$}{$*$}{$*$}"
        );
        // A module filter without a sys filter widens both.
        assert_eq!(
            node_pattern(GROUP_INFO, "ns", None, Some("001")),
            "{$group=cluster_info$}{$ns$}{$*$}{$*$}{$*$}"
        );
    }

    #[test]
    fn parse_node_key_roundtrip() {
        let key = info_key("ns", "S0001", "001", "07");
        let (ns, sys, module, server) = parse_node_key(&key).unwrap();
        assert_eq!(ns, "ns");
        assert_eq!(sys, "S0001");
        assert_eq!(module, "001");
        assert_eq!(server, "07");
        assert!(parse_node_key("garbage").is_none());
    }

    #[test]
    fn exists_to_event_rewrite() {
        let exists = event_exists_key("ns", "S", "M", "01");
        let event = exists_to_event_key(&exists);
        assert_eq!(event, event_key("ns", "S", "M", "01"));
    }
}
