//! Single-notebook admission.

use serde::Serialize;

/// Whether a notebook may be opened, with a user-facing reason when not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotebookAdmission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NotebookAdmission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

/// Decide whether `notebook_id` may be opened given the notebooks that
/// currently hold a runtime.
///
/// A notebook that already holds a runtime is always allowed; so is any
/// notebook when none holds one. Otherwise the denial names the open
/// notebook, preferring `active`.
pub fn can_open_notebook(
    notebook_id: &str,
    bound: &[String],
    active: Option<&str>,
) -> NotebookAdmission {
    if bound.is_empty() || bound.iter().any(|b| b == notebook_id) {
        return NotebookAdmission::allowed();
    }

    let current = active
        .filter(|a| bound.iter().any(|b| b == *a))
        .or_else(|| bound.iter().map(String::as_str).min())
        .unwrap_or_default();

    NotebookAdmission::denied(format!(
        "Notebook \"{}\" is already running on a cloud runtime. Close it before opening another notebook.",
        current
    ))
}
