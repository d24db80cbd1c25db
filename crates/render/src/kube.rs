//! Label and naming conventions for rendered Kubernetes objects.

use std::collections::BTreeMap;

pub const LABEL_APPLICATION: &str = "keel.dev/application";
pub const LABEL_RESOURCE: &str = "keel.dev/resource";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_KEEL: &str = "keel";

pub type Labels = BTreeMap<String, String>;

/// Labels describing what an object belongs to.
pub fn descriptive_labels(application: &str, resource: &str) -> Labels {
    [
        (LABEL_APPLICATION, application),
        (LABEL_RESOURCE, resource),
        (LABEL_NAME, resource),
        (LABEL_PART_OF, application),
        (LABEL_MANAGED_BY, MANAGED_BY_KEEL),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Labels a workload's pods carry and its selectors match.
pub fn selector_labels(application: &str, resource: &str) -> Labels {
    [(LABEL_APPLICATION, application), (LABEL_RESOURCE, resource)].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Label a route's Service selects; pods providing the route carry it.
pub fn route_selector_labels(application: &str, route_type: &str, route: &str) -> Labels {
    let mut l = Labels::new();
    l.insert(LABEL_APPLICATION.to_string(), application.to_string());
    l.insert(format!("keel.dev/route-{}-{}", route_type.to_ascii_lowercase(), route.to_ascii_lowercase()), "true".to_string());
    l
}

/// Port names are capped at 15 characters, so route ports are named by hash:
/// `a` followed by the FNV-1a 32 hash of the lower-cased name.
pub fn shortened_target_port_name(name: &str) -> String {
    let mut h: u32 = 0x811c_9dc5;
    for b in name.to_ascii_lowercase().bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    format!("a{}", h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_names_fit_and_ignore_case() {
        let a = shortened_target_port_name("app0httpRoutesroute0");
        assert_eq!(a, shortened_target_port_name("APP0HTTPROUTESROUTE0"));
        assert!(a.starts_with('a') && a.len() <= 15);
        assert_ne!(a, shortened_target_port_name("app0httpRoutesroute1"));
        // FNV-1a of the empty input is the offset basis.
        assert_eq!(shortened_target_port_name(""), "a2166136261");
    }

    #[test]
    fn route_labels_are_lowercase() {
        let l = route_selector_labels("app0", "httpRoutes", "Route0");
        assert_eq!(l.get("keel.dev/route-httproutes-route0").map(String::as_str), Some("true"));
    }
}
