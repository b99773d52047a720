use std::fmt;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

/// Which of the two server frontends a run launches.
///
/// The mode fixes the Python module handed to the interpreter, the pattern
/// that announces readiness on the output streams, and the path prefix used
/// when composing per-file URLs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    /// Classic notebook server (`/tree` endpoints).
    #[default]
    Notebook,
    /// JupyterLab server (`/lab` endpoints).
    Lab,
}

impl ServerMode {
    /// Python module passed to `<interpreter> -m`.
    pub fn launch_module(self) -> &'static str {
        match self {
            ServerMode::Notebook => "notebook",
            ServerMode::Lab => "jupyterlab",
        }
    }

    /// Path prefix between the host and the relative file path in computed
    /// file URLs.
    pub fn file_url_prefix(self) -> &'static str {
        match self {
            ServerMode::Notebook => "notebooks",
            ServerMode::Lab => "lab/tree",
        }
    }

    /// Pattern the server prints once it is reachable. The first capture is
    /// the port, the second the access token.
    #[expect(clippy::expect_used)]
    pub(crate) fn readiness_pattern(self) -> Regex {
        let pattern = match self {
            ServerMode::Notebook => r"http://localhost:(\d+)/tree\?token=(\w+)",
            ServerMode::Lab => r"http://localhost:(\d+)/lab\?token=(\w+)",
        };
        Regex::new(pattern).expect("readiness patterns are valid")
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Notebook => write!(f, "notebook"),
            ServerMode::Lab => write!(f, "lab"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn launch_modules_differ_per_mode() {
        assert_eq!(ServerMode::Notebook.launch_module(), "notebook");
        assert_eq!(ServerMode::Lab.launch_module(), "jupyterlab");
    }

    #[test]
    fn file_url_prefixes_differ_per_mode() {
        assert_eq!(ServerMode::Notebook.file_url_prefix(), "notebooks");
        assert_eq!(ServerMode::Lab.file_url_prefix(), "lab/tree");
    }

    #[test]
    fn notebook_pattern_captures_port_and_token() {
        let pattern = ServerMode::Notebook.readiness_pattern();
        let captures = pattern
            .captures("[I 12:00:00] http://localhost:8888/tree?token=abc123")
            .expect("pattern should match");
        assert_eq!(&captures[1], "8888");
        assert_eq!(&captures[2], "abc123");
    }

    #[test]
    fn lab_pattern_does_not_match_notebook_banner() {
        let pattern = ServerMode::Lab.readiness_pattern();
        assert!(
            !pattern.is_match("http://localhost:8888/tree?token=abc123"),
            "lab mode must ignore notebook banners"
        );
        assert!(pattern.is_match("http://localhost:9999/lab?token=s3cret"));
    }

    #[test]
    fn serde_names_are_kebab_case() {
        let json = serde_json::to_string(&ServerMode::Lab).expect("serialize");
        assert_eq!(json, "\"lab\"");
        let mode: ServerMode = serde_json::from_str("\"notebook\"").expect("deserialize");
        assert_eq!(mode, ServerMode::Notebook);
    }
}
