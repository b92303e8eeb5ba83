use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostic::Diagnostic;

#[derive(Debug, Clone, Deserialize)]
pub struct PackageImplicitLoad {
    pub load_path: String,
    pub load_symbols: std::collections::HashMap<String, String>,
}

/// One line of the stdin protocol (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    #[serde(rename = "buildFile")]
    pub build_file: String,
    #[serde(rename = "watchRoot")]
    pub watch_root: String,
    #[serde(rename = "projectPrefix")]
    pub project_prefix: String,
    #[serde(rename = "packageImplicitLoad")]
    pub package_implicit_load: Option<PackageImplicitLoad>,
    pub command: Option<String>,
}

/// One line of the response channel (§6).
#[derive(Debug, Clone, Serialize, Default)]
pub struct Response {
    pub values: Vec<Value>,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl Response {
    pub fn encoding_fallback(error: impl std::fmt::Display) -> Self {
        Response {
            values: Vec::new(),
            diagnostics: vec![Diagnostic::fatal(
                "parse",
                format!("failed to encode response: {error}"),
            )],
            profile: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parses_minimal_fields() {
        let q: Query = serde_json::from_str(
            r#"{"buildFile":"/repo/pkg/BUILD","watchRoot":"/repo","projectPrefix":""}"#,
        )
        .unwrap();
        assert_eq!(q.build_file, "/repo/pkg/BUILD");
        assert!(q.package_implicit_load.is_none());
        assert!(q.command.is_none());
    }

    #[test]
    fn response_omits_profile_when_absent() {
        let r = Response::default();
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("profile").is_none());
    }
}
