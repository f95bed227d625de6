//! Doublestar glob matching for changed-file detection.
//!
//! Patterns and paths are both normalised to rooted, cleaned form before
//! matching (`./envs//dev/../prod` becomes `/envs/prod`). Syntax is
//! `globset`'s with `literal_separator` on:
//!
//! - `**` matches any number of path segments, including none
//! - `*` and `?` never cross a `/`
//! - `{a,b}` alternation and `[...]` classes are supported

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{GateError, GateResult};

/// Rooted, cleaned form of `path` with `/` separators.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// A compiled glob.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    matcher: GlobMatcher,
}

impl Glob {
    pub fn new(pattern: &str) -> GateResult<Self> {
        let matcher = GlobBuilder::new(&normalize_path(pattern))
            .literal_separator(true)
            .build()
            .map_err(|e| GateError::Config(format!("invalid glob pattern '{pattern}': {e}")))?
            .compile_matcher();
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.matcher.is_match(normalize_path(path))
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// True when `file` matches any include pattern and no exclude pattern.
pub fn match_include_exclude(file: &str, include: &[Glob], exclude: &[Glob]) -> bool {
    include.iter().any(|g| g.is_match(file)) && !exclude.iter().any(|g| g.is_match(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, path: &str) -> bool {
        Glob::new(pattern).unwrap().is_match(path)
    }

    #[test]
    fn normalizes_relative_and_windows_paths() {
        assert_eq!(normalize_path("./envs//dev/main.tf"), "/envs/dev/main.tf");
        assert_eq!(normalize_path("envs\\dev\\main.tf"), "/envs/dev/main.tf");
        assert_eq!(normalize_path("envs/dev/../prod"), "/envs/prod");
        assert_eq!(normalize_path("."), "/");
    }

    #[test]
    fn double_star_spans_directories() {
        assert!(m("envs/dev/**/*", "envs/dev/main.tf"));
        assert!(m("envs/dev/**/*", "envs/dev/modules/vpc/main.tf"));
        assert!(!m("envs/dev/**/*", "envs/prod/main.tf"));
        assert!(m("./**/*", "anything/at/all.tf"));
    }

    #[test]
    fn single_star_stays_in_segment() {
        assert!(m("envs/dev/*", "envs/dev/main.tf"));
        assert!(!m("envs/dev/*", "envs/dev/modules/main.tf"));
        assert!(m("envs/*/main.tf", "envs/qa/main.tf"));
    }

    #[test]
    fn alternation_and_classes() {
        assert!(m("modules/{vpc,dns}/**/*", "modules/dns/records.tf"));
        assert!(!m("modules/{vpc,dns}/**/*", "modules/iam/role.tf"));
        assert!(m("envs/dev[0-9]/*", "envs/dev3/main.tf"));
        assert!(m("file?.tf", "file1.tf"));
    }

    #[test]
    fn bracket_first_in_class_is_literal() {
        assert!(m("a/[]x]", "a/]"));
        assert!(m("a/[]x]", "a/x"));
        assert!(!m("a/[]x]", "a/y"));
        assert!(m("envs/[!p]*/main.tf", "envs/dev/main.tf"));
        assert!(!m("envs/[!p]*/main.tf", "envs/prod/main.tf"));
    }

    #[test]
    fn unclosed_class_is_a_config_error() {
        let err = Glob::new("envs/[dev/*").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("envs/[dev/*"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(m("envs/a+b/*.tf", "envs/a+b/x.tf"));
        assert!(!m("envs/a+b/*.tf", "envs/aab/x.tf"));
    }

    #[test]
    fn exclude_overrides_include() {
        let include = vec![Glob::new("envs/dev/**/*").unwrap()];
        let exclude = vec![Glob::new("envs/dev/docs/**/*").unwrap()];
        assert!(match_include_exclude("envs/dev/main.tf", &include, &exclude));
        assert!(!match_include_exclude("envs/dev/docs/readme.md", &include, &exclude));
    }
}
