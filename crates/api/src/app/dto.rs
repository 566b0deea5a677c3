use serde::Deserialize;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /tasks`. Fields are optional so a missing one is reported
/// as a validation error rather than a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct CreateTaskRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl CreateTaskRequest {
    /// Both fields, if present and non-blank.
    pub fn required_fields(&self) -> Option<(&str, &str)> {
        Some((non_blank(&self.name)?, non_blank(&self.description)?))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
