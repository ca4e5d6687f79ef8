use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

/// Returns true if the label selector matches the resource labels. A nil selector
/// matches everything (the same as an empty selector) to avoid surprises.
pub fn selector_matches_labels(
    selector: Option<&LabelSelector>,
    resource_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let Some(selector) = selector else {
        return Ok(true);
    };

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if resource_labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(match_expressions) = &selector.match_expressions {
        for requirement in match_expressions {
            if !requirement_matches_labels(requirement, resource_labels)? {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn requirement_matches_labels(
    requirement: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement,
    resource_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let values = requirement.values.as_deref().unwrap_or(&[]);
    let label_value = resource_labels.get(&requirement.key);
    match requirement.operator.as_str() {
        "In" => {
            if values.is_empty() {
                return Err(Error::InvalidLabelSelector(
                    "values must be specified when the operator is In".to_string(),
                ));
            }
            Ok(label_value.is_some_and(|value| values.contains(value)))
        }
        "NotIn" => {
            if values.is_empty() {
                return Err(Error::InvalidLabelSelector(
                    "values must be specified when the operator is NotIn".to_string(),
                ));
            }
            // A missing label also satisfies NotIn
            Ok(!label_value.is_some_and(|value| values.contains(value)))
        }
        "Exists" => {
            if !values.is_empty() {
                return Err(Error::InvalidLabelSelector(
                    "values may not be specified when the operator is Exists".to_string(),
                ));
            }
            Ok(label_value.is_some())
        }
        "DoesNotExist" => {
            if !values.is_empty() {
                return Err(Error::InvalidLabelSelector(
                    "values may not be specified when the operator is DoesNotExist".to_string(),
                ));
            }
            Ok(label_value.is_none())
        }
        operator => Err(Error::InvalidLabelSelector(format!(
            "unknown operator: {operator}"
        ))),
    }
}
