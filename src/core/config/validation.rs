use crate::core::errors::ApiError;
use serde_json::{Map, Value};

pub fn validate_config(config: &Value) -> Result<(), ApiError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 1, 65535)?;
        validate_string_array_field(
            server,
            "server.cors_allowed_origins",
            "cors_allowed_origins",
        )?;
    }

    if let Some(scheduling) = expect_optional_object(root, "scheduling")? {
        validate_u64_field(
            scheduling,
            "scheduling.default_max_concurrent_jobs",
            "default_max_concurrent_jobs",
            1,
            10_000,
        )?;
        validate_u64_field(
            scheduling,
            "scheduling.default_max_retries",
            "default_max_retries",
            0,
            5,
        )?;
    }

    if let Some(activity_feed) = expect_optional_object(root, "activity_feed")? {
        validate_u64_field(
            activity_feed,
            "activity_feed.max_activities",
            "max_activities",
            1,
            100_000,
        )?;
    }

    if let Some(reports) = expect_optional_object(root, "reports")? {
        validate_u64_field(reports, "reports.max_age_days", "max_age_days", 0, 3_650)?;
    }

    if let Some(secrets) = expect_optional_object(root, "secrets")? {
        validate_u64_field(
            secrets,
            "secrets.failure_threshold",
            "failure_threshold",
            1,
            1_000,
        )?;
        validate_u64_field(
            secrets,
            "secrets.success_threshold",
            "success_threshold",
            1,
            1_000,
        )?;
        validate_u64_field(secrets, "secrets.timeout_ms", "timeout_ms", 1, 3_600_000)?;
    }

    if let Some(pipelines) = expect_optional_object(root, "pipelines")? {
        for (pipeline_id, value) in pipelines {
            let path_prefix = format!("pipelines.{}", pipeline_id);
            let entry = value
                .as_object()
                .ok_or_else(|| config_type_error(&path_prefix, "object"))?;
            validate_u64_field(
                entry,
                &format!("{}.max_concurrent_jobs", path_prefix),
                "max_concurrent_jobs",
                1,
                10_000,
            )?;
        }
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ApiError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_type_error(key, "object")),
        None => Ok(None),
    }
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(ApiError::validation(
            path,
            format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_str().is_none() {
        return Err(config_type_error(path, "string"));
    }
    Ok(())
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    for (index, item) in items.iter().enumerate() {
        if item.as_str().is_none() {
            return Err(config_type_error(&format!("{}[{}]", path, index), "string"));
        }
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> ApiError {
    ApiError::validation(path, format!("expected {}", expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_empty_config() {
        assert!(validate_config(&json!({})).is_ok());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let err = validate_config(&json!({"server": {"port": 0}})).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate_config(&json!({"server": "nope"})).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
