//! Small Kubernetes helpers shared across crates

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

/// Check whether a pod is ready: not terminating and Ready condition is True
pub fn pod_is_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Multiply a resource quantity by an integer factor, preserving its suffix
///
/// `500m * 3 = 1500m`, `2Gi * 2 = 4Gi`, `0.5 * 4 = 2`. Used to scale
/// resource profiles linearly by their multiplier.
pub fn mul_quantity(quantity: &Quantity, factor: i64) -> Result<Quantity> {
    let s = quantity.0.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);

    let value: f64 = num.parse().map_err(|_| {
        Error::validation(format!("invalid resource quantity: {:?}", quantity.0))
    })?;

    let scaled = value * factor as f64;
    let formatted = if scaled.fract() == 0.0 {
        format!("{}", scaled as i64)
    } else {
        format!("{}", scaled)
    };

    Ok(Quantity(format!("{}{}", formatted, suffix)))
}

/// Multiply every quantity in a resource list by an integer factor
pub fn scale_resources(
    resources: &BTreeMap<String, Quantity>,
    factor: i64,
) -> Result<BTreeMap<String, Quantity>> {
    resources
        .iter()
        .map(|(key, quantity)| Ok((key.clone(), mul_quantity(quantity, factor)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn quantity(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn mul_quantity_millicores() {
        assert_eq!(mul_quantity(&quantity("500m"), 3).unwrap().0, "1500m");
    }

    #[test]
    fn mul_quantity_binary_suffix() {
        assert_eq!(mul_quantity(&quantity("2Gi"), 2).unwrap().0, "4Gi");
        assert_eq!(mul_quantity(&quantity("512Mi"), 4).unwrap().0, "2048Mi");
    }

    #[test]
    fn mul_quantity_bare_and_fractional() {
        assert_eq!(mul_quantity(&quantity("1"), 8).unwrap().0, "8");
        assert_eq!(mul_quantity(&quantity("0.5"), 4).unwrap().0, "2");
        assert_eq!(mul_quantity(&quantity("0.5"), 3).unwrap().0, "1.5");
    }

    #[test]
    fn mul_quantity_rejects_garbage() {
        assert!(mul_quantity(&quantity("Gi"), 2).is_err());
        assert!(mul_quantity(&quantity("abc"), 2).is_err());
    }

    #[test]
    fn scale_resources_scales_all_keys() {
        let mut resources = BTreeMap::new();
        resources.insert("cpu".to_string(), quantity("2"));
        resources.insert("memory".to_string(), quantity("8Gi"));
        resources.insert("nvidia.com/gpu".to_string(), quantity("1"));

        let scaled = scale_resources(&resources, 2).unwrap();
        assert_eq!(scaled["cpu"].0, "4");
        assert_eq!(scaled["memory"].0, "16Gi");
        assert_eq!(scaled["nvidia.com/gpu"].0, "2");
    }

    fn pod_with_ready(status: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_is_ready_requires_ready_condition() {
        assert!(pod_is_ready(&pod_with_ready("True")));
        assert!(!pod_is_ready(&pod_with_ready("False")));
        assert!(!pod_is_ready(&Pod::default()));
    }

    #[test]
    fn terminating_pod_is_not_ready() {
        let mut pod = pod_with_ready("True");
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!pod_is_ready(&pod));
    }
}
