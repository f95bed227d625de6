//! PR comment commands: `digger <command> [-w <workspace>] [-p <project>]...`

use super::Command;
use crate::error::{GateError, GateResult};

/// A recognised command in a PR comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCommand {
    pub command: Command,
    /// `-w` override for the project workspace.
    pub workspace: Option<String>,
    /// `-p`/`--project` filters, in comment order.
    pub projects: Vec<String>,
}

/// Parse a comment body. `Ok(None)` when the comment is not addressed to
/// us; malformed flags are [`GateError::InvalidCommand`].
pub fn parse_comment(body: &str) -> GateResult<Option<CommentCommand>> {
    let mut words = body.split_whitespace();
    let (Some(prefix), Some(verb)) = (words.next(), words.next()) else {
        return Ok(None);
    };
    if !prefix.eq_ignore_ascii_case("digger") {
        return Ok(None);
    }
    let Some(command) = Command::parse(&format!("digger {verb}")) else {
        return Ok(None);
    };

    let invalid = |reason: &str| GateError::InvalidCommand {
        comment: body.trim().to_string(),
        reason: reason.to_string(),
    };

    // Flag values keep their original case.
    let mut tokens = body.split_whitespace().skip(2);
    let mut workspace = None;
    let mut projects = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            "-w" => {
                if workspace.is_some() {
                    return Err(invalid("more than one -w flag"));
                }
                let value = tokens.next().ok_or_else(|| invalid("-w requires a value"))?;
                workspace = Some(value.to_string());
            }
            "-p" | "--project" => {
                let value = tokens
                    .next()
                    .ok_or_else(|| invalid("-p requires a project name"))?;
                projects.push(value.to_string());
            }
            _ => {}
        }
    }

    Ok(Some(CommentCommand {
        command,
        workspace,
        projects,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_unrelated_comments() {
        assert_eq!(parse_comment("looks good to me").unwrap(), None);
        assert_eq!(parse_comment("please digger plan").unwrap(), None);
    }

    #[test]
    fn command_must_be_a_whole_word() {
        assert_eq!(parse_comment("digger planet").unwrap(), None);
        assert_eq!(parse_comment("digger lockdown now").unwrap(), None);
        assert_eq!(parse_comment("digger").unwrap(), None);
        assert_eq!(parse_comment("diggerplan").unwrap(), None);
    }

    #[test]
    fn extra_whitespace_between_words_is_accepted() {
        assert_eq!(parse_comment("digger   plan").unwrap().unwrap().command, Command::Plan);
        let parsed = parse_comment("digger\tapply\n-p dev").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Apply);
        assert_eq!(parsed.projects, vec!["dev"]);
    }

    #[test]
    fn mixed_case_command_is_recognised() {
        let parsed = parse_comment("  DiGGeR PlAn ").unwrap().unwrap();
        assert_eq!(parsed.command, Command::Plan);
        assert_eq!(parsed.workspace, None);
        assert!(parsed.projects.is_empty());
    }

    #[test]
    fn workspace_and_projects_keep_their_case() {
        let parsed = parse_comment("digger apply -w Staging -p dev --project Prod")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.command, Command::Apply);
        assert_eq!(parsed.workspace.as_deref(), Some("Staging"));
        assert_eq!(parsed.projects, vec!["dev", "Prod"]);
    }

    #[test]
    fn repeated_or_empty_workspace_is_rejected() {
        let err = parse_comment("digger plan -w a -w b").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("more than one -w"));

        let err = parse_comment("digger plan -w").unwrap_err();
        assert!(err.to_string().contains("requires a value"));
    }

    #[test]
    fn drift_detect_and_destroy_are_recognised() {
        assert_eq!(
            parse_comment("digger drift-detect").unwrap().unwrap().command,
            Command::DriftDetect
        );
        assert_eq!(
            parse_comment("digger destroy -p dev").unwrap().unwrap().command,
            Command::Destroy
        );
    }
}
