use serde_json::Value;

/// Dot-notation descent into a nested JSON value.
///
/// Returns `None` when any intermediate key is missing or when descent hits
/// a non-object. Absent upstream data is not an error; the caller simply
/// omits the output field.
pub fn extract<'a>(path: &str, values: &'a Value) -> Option<&'a Value> {
    let mut current = values;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// First path segment of a `jira_field` path with the `fields.` prefix
/// stripped. Used to derive the field list requested from the upstream.
pub fn root_segment(path: &str) -> &str {
    let trimmed = path.strip_prefix("fields.").unwrap_or(path);
    trimmed.split('.').next().unwrap_or(trimmed)
}
