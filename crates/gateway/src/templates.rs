//! Validation and defaulting of template parameters, plus the cluster
//! node-set rules.

use std::collections::BTreeMap;

use foundry_api::private::{ClusterNodeSet, TemplateParameterDefinition};
use foundry_api::rpc::Status;
use foundry_api::TypedValue;

/// Joins quoted items into an English series: `'a', 'b' and 'c'`.
pub fn word_series(items: &[String], conjunction: &str) -> String {
    match items.len() {
        0 => String::new(),
        1 => items[0].clone(),
        _ => format!(
            "{} {} {}",
            items[..items.len() - 1].join(", "),
            conjunction,
            items[items.len() - 1]
        ),
    }
}

fn quoted_sorted(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut quoted = items.map(|item| format!("'{}'", item)).collect::<Vec<_>>();
    quoted.sort();
    quoted
}

/// Validates a parameter map against the template's definitions: unknown
/// names, missing required parameters and type URL mismatches are rejected.
pub fn validate_template_parameters(
    template_id: &str,
    definitions: &[TemplateParameterDefinition],
    parameters: &BTreeMap<String, TypedValue>,
) -> Result<(), Status> {
    let unknown = parameters
        .keys()
        .filter(|name| !definitions.iter().any(|def| &def.name == *name))
        .cloned()
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        let unknown_series = word_series(&quoted_sorted(unknown.iter().cloned()), "and");
        let valid = quoted_sorted(definitions.iter().map(|def| def.name.clone()));
        let message = if valid.is_empty() {
            if unknown.len() == 1 {
                format!(
                    "template parameter {} doesn't exist, template '{}' doesn't accept parameters",
                    unknown_series, template_id
                )
            } else {
                format!(
                    "template parameters {} don't exist, template '{}' doesn't accept parameters",
                    unknown_series, template_id
                )
            }
        } else if unknown.len() == 1 {
            format!(
                "template parameter {} doesn't exist, valid values for template '{}' are {}",
                unknown_series,
                template_id,
                word_series(&valid, "and")
            )
        } else {
            format!(
                "template parameters {} don't exist, valid values for template '{}' are {}",
                unknown_series,
                template_id,
                word_series(&valid, "and")
            )
        };
        return Err(Status::invalid_argument(message));
    }

    for definition in definitions {
        let value = parameters.get(&definition.name);
        if definition.required && value.is_none() {
            return Err(Status::invalid_argument(format!(
                "parameter '{}' of template '{}' is mandatory",
                definition.name, template_id
            )));
        }
        if let Some(value) = value {
            if value.type_url != definition.r#type {
                return Err(Status::invalid_argument(format!(
                    "type of parameter '{}' of template '{}' should be '{}' but it is '{}'",
                    definition.name, template_id, definition.r#type, value.type_url
                )));
            }
        }
    }
    Ok(())
}

/// Walks the definitions in order and emits the effective parameter map:
/// the caller value when supplied, the declared default otherwise.
/// Parameters with neither are omitted.
pub fn process_template_parameters_with_defaults(
    definitions: &[TemplateParameterDefinition],
    parameters: &BTreeMap<String, TypedValue>,
) -> BTreeMap<String, TypedValue> {
    let mut result = BTreeMap::new();
    for definition in definitions {
        if let Some(value) = parameters.get(&definition.name) {
            result.insert(definition.name.clone(), value.clone());
        } else if let Some(default) = &definition.default {
            result.insert(definition.name.clone(), default.clone());
        }
    }
    result
}

/// Checks the node sets supplied on a cluster against the template: every
/// key must exist in the template, host classes must match when supplied,
/// and sizes must be positive.
pub fn validate_cluster_node_sets(
    template_id: &str,
    template_node_sets: &BTreeMap<String, ClusterNodeSet>,
    cluster_node_sets: &BTreeMap<String, ClusterNodeSet>,
) -> Result<(), Status> {
    for key in cluster_node_sets.keys() {
        if !template_node_sets.contains_key(key) {
            let valid = quoted_sorted(template_node_sets.keys().cloned());
            return Err(Status::invalid_argument(format!(
                "node set '{}' doesn't exist, valid values for template '{}' are {}",
                key,
                template_id,
                word_series(&valid, "and")
            )));
        }
    }

    for (key, node_set) in cluster_node_sets {
        if node_set.host_class.is_empty() {
            continue;
        }
        // The key was checked above.
        let Some(template_node_set) = template_node_sets.get(key) else {
            continue;
        };
        if node_set.host_class != template_node_set.host_class {
            return Err(Status::invalid_argument(format!(
                "host class for node set '{}' should be empty or '{}', like in template '{}', \
                 but it is '{}'",
                key, template_node_set.host_class, template_id, node_set.host_class
            )));
        }
    }

    for (key, node_set) in cluster_node_sets {
        if node_set.size <= 0 {
            return Err(Status::invalid_argument(format!(
                "size for node set '{}' should be greater than zero, but it is {}",
                key, node_set.size
            )));
        }
    }
    Ok(())
}

/// The final node-set map: the template's keys, sizes taken from the caller
/// where supplied and from the template otherwise. Host classes always come
/// from the template.
pub fn effective_node_sets(
    template_node_sets: &BTreeMap<String, ClusterNodeSet>,
    cluster_node_sets: &BTreeMap<String, ClusterNodeSet>,
) -> BTreeMap<String, ClusterNodeSet> {
    let mut result = BTreeMap::new();
    for (key, template_node_set) in template_node_sets {
        let size = cluster_node_sets
            .get(key)
            .map(|node_set| node_set.size)
            .unwrap_or(template_node_set.size);
        result.insert(
            key.clone(),
            ClusterNodeSet {
                host_class: template_node_set.host_class.clone(),
                size,
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, required: bool, r#type: &str) -> TemplateParameterDefinition {
        TemplateParameterDefinition {
            name: name.to_string(),
            required,
            r#type: r#type.to_string(),
            ..TemplateParameterDefinition::default()
        }
    }

    const STRING_TYPE: &str = "type.googleapis.com/google.protobuf.StringValue";

    #[test]
    fn valid_parameters_pass() {
        let definitions = vec![
            definition("required_param", true, STRING_TYPE),
            definition("optional_param", false, STRING_TYPE),
        ];
        let mut parameters = BTreeMap::new();
        parameters.insert("required_param".to_string(), TypedValue::string("v"));

        validate_template_parameters("test-template", &definitions, &parameters)
            .expect("required-only parameters should validate");

        parameters.insert("optional_param".to_string(), TypedValue::string("v"));
        validate_template_parameters("test-template", &definitions, &parameters)
            .expect("all parameters should validate");
    }

    #[test]
    fn unknown_parameter_is_rejected_with_valid_values() {
        let definitions = vec![definition("valid_param", true, STRING_TYPE)];
        let mut parameters = BTreeMap::new();
        parameters.insert("invalid_param".to_string(), TypedValue::string("v"));

        let err = validate_template_parameters("test-template", &definitions, &parameters)
            .unwrap_err();
        assert!(err
            .message
            .contains("template parameter 'invalid_param' doesn't exist"));
        assert!(err
            .message
            .contains("valid values for template 'test-template' are 'valid_param'"));
    }

    #[test]
    fn multiple_unknown_parameters_use_the_plural_form() {
        let definitions = vec![definition("valid_param", true, STRING_TYPE)];
        let mut parameters = BTreeMap::new();
        parameters.insert("invalid_param1".to_string(), TypedValue::string("v"));
        parameters.insert("invalid_param2".to_string(), TypedValue::string("v"));

        let err = validate_template_parameters("test-template", &definitions, &parameters)
            .unwrap_err();
        assert!(err
            .message
            .contains("template parameters 'invalid_param1' and 'invalid_param2' don't exist"));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let definitions = vec![definition("valid_param", true, STRING_TYPE)];
        let err = validate_template_parameters("test-template", &definitions, &BTreeMap::new())
            .unwrap_err();
        assert!(err
            .message
            .contains("parameter 'valid_param' of template 'test-template' is mandatory"));
    }

    #[test]
    fn wrong_parameter_type_is_rejected() {
        let definitions = vec![definition("valid_param", true, STRING_TYPE)];
        let mut parameters = BTreeMap::new();
        parameters.insert("valid_param".to_string(), TypedValue::int32(42));

        let err = validate_template_parameters("test-template", &definitions, &parameters)
            .unwrap_err();
        assert!(err.message.contains(
            "type of parameter 'valid_param' of template 'test-template' should be \
             'type.googleapis.com/google.protobuf.StringValue'"
        ));
        assert!(err
            .message
            .contains("but it is 'type.googleapis.com/google.protobuf.Int32Value'"));
    }

    #[test]
    fn empty_template_rejects_any_parameter_but_accepts_none() {
        let mut parameters = BTreeMap::new();
        parameters.insert("any_param".to_string(), TypedValue::string("v"));
        let err =
            validate_template_parameters("empty-template", &[], &parameters).unwrap_err();
        assert_eq!(err.code, foundry_api::rpc::Code::InvalidArgument);

        validate_template_parameters("empty-template", &[], &BTreeMap::new())
            .expect("no parameters should validate");
    }

    #[test]
    fn defaulting_uses_caller_value_then_default_then_omits() {
        let mut with_default = definition("with_default", false, STRING_TYPE);
        with_default.default = Some(TypedValue::string("fallback"));
        let definitions = vec![
            definition("supplied", false, STRING_TYPE),
            with_default,
            definition("absent", false, STRING_TYPE),
        ];
        let mut parameters = BTreeMap::new();
        parameters.insert("supplied".to_string(), TypedValue::string("explicit"));

        let result = process_template_parameters_with_defaults(&definitions, &parameters);
        assert_eq!(result["supplied"].value, serde_json::json!("explicit"));
        assert_eq!(result["with_default"].value, serde_json::json!("fallback"));
        assert!(!result.contains_key("absent"));
        assert_eq!(result.len(), 2);
    }

    fn node_set(host_class: &str, size: i32) -> ClusterNodeSet {
        ClusterNodeSet {
            host_class: host_class.to_string(),
            size,
        }
    }

    #[test]
    fn unknown_node_set_lists_the_valid_keys() {
        let mut template = BTreeMap::new();
        template.insert("worker".to_string(), node_set("standard", 3));
        let mut cluster = BTreeMap::new();
        cluster.insert("foo".to_string(), node_set("", 1));

        let err = validate_cluster_node_sets("t1", &template, &cluster).unwrap_err();
        assert!(err.message.contains("node set 'foo' doesn't exist"));
        assert!(err.message.contains("'worker'"));
    }

    #[test]
    fn mismatched_host_class_is_rejected() {
        let mut template = BTreeMap::new();
        template.insert("worker".to_string(), node_set("standard", 3));
        let mut cluster = BTreeMap::new();
        cluster.insert("worker".to_string(), node_set("gpu", 1));

        let err = validate_cluster_node_sets("t1", &template, &cluster).unwrap_err();
        assert!(err
            .message
            .contains("host class for node set 'worker' should be empty or 'standard'"));
        assert!(err.message.contains("but it is 'gpu'"));
    }

    #[test]
    fn non_positive_size_is_rejected() {
        let mut template = BTreeMap::new();
        template.insert("worker".to_string(), node_set("standard", 3));
        let mut cluster = BTreeMap::new();
        cluster.insert("worker".to_string(), node_set("", 0));

        let err = validate_cluster_node_sets("t1", &template, &cluster).unwrap_err();
        assert!(err
            .message
            .contains("size for node set 'worker' should be greater than zero, but it is 0"));
    }

    #[test]
    fn effective_node_sets_take_sizes_from_caller_and_host_classes_from_template() {
        let mut template = BTreeMap::new();
        template.insert("worker".to_string(), node_set("standard", 3));
        template.insert("infra".to_string(), node_set("small", 1));
        let mut cluster = BTreeMap::new();
        cluster.insert("worker".to_string(), node_set("", 5));

        let result = effective_node_sets(&template, &cluster);
        assert_eq!(result["worker"].size, 5);
        assert_eq!(result["worker"].host_class, "standard");
        assert_eq!(result["infra"].size, 1);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn word_series_joins_with_the_conjunction() {
        assert_eq!(word_series(&[], "and"), "");
        assert_eq!(word_series(&["'a'".to_string()], "and"), "'a'");
        assert_eq!(
            word_series(&["'a'".to_string(), "'b'".to_string()], "and"),
            "'a' and 'b'"
        );
        assert_eq!(
            word_series(
                &["'a'".to_string(), "'b'".to_string(), "'c'".to_string()],
                "and"
            ),
            "'a', 'b' and 'c'"
        );
    }
}
