//! Safety filter for instructions and test commands.
//!
//! A single case-insensitive Aho-Corasick automaton over the blocked shell
//! fragments.  When several fragments occur, the one listed first in
//! [`BLOCKED_KEYWORDS`] is reported.

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use tracing::warn;

use crate::error::{IntentError, Result};

/// Shell fragments that are never allowed in an instruction or test command.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "rm -rf",
    "git push --force",
    "sudo ",
    "mkfs",
    "shutdown",
    "reboot",
];

static AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(BLOCKED_KEYWORDS)
        .expect("blocked keyword automaton builds from static patterns")
});

/// Reject the first part that contains a blocked keyword.
pub fn validate_safety(parts: &[&str]) -> Result<()> {
    for part in parts {
        let first_listed = AUTOMATON
            .find_overlapping_iter(*part)
            .map(|m| m.pattern().as_usize())
            .min();
        if let Some(index) = first_listed {
            let keyword = BLOCKED_KEYWORDS[index];
            warn!(keyword, "blocked keyword found in task input");
            return Err(IntentError::Unsafe {
                keyword: keyword.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_task_passes() {
        assert!(validate_safety(&["normal task", "go test ./..."]).is_ok());
        assert!(validate_safety(&[]).is_ok());
        assert!(validate_safety(&["restart the shut-down handler", "sudo-less"]).is_ok());
    }

    #[test]
    fn dangerous_test_command_is_rejected() {
        let err = validate_safety(&["implement x", "go test ./... && rm -rf /tmp/1"]).unwrap_err();
        assert_eq!(
            err,
            IntentError::Unsafe {
                keyword: "rm -rf".into()
            }
        );
        assert!(err.to_string().contains("rm -rf"));
    }

    #[test]
    fn every_keyword_is_blocked_in_any_case() {
        for keyword in BLOCKED_KEYWORDS {
            let variants = [
                keyword.to_string(),
                keyword.to_uppercase(),
                format!("please {} now", capitalize_alternate(keyword)),
            ];
            for text in variants {
                let err = validate_safety(&[text.as_str()]).unwrap_err();
                assert!(
                    err.to_string().contains(keyword),
                    "`{text}` should be rejected naming `{keyword}`, got `{err}`"
                );
            }
        }
    }

    #[test]
    fn first_listed_keyword_wins() {
        let err = validate_safety(&["reboot after rm -rf build"]).unwrap_err();
        assert_eq!(
            err,
            IntentError::Unsafe {
                keyword: "rm -rf".into()
            }
        );
    }

    #[test]
    fn sudo_requires_trailing_space() {
        assert!(validate_safety(&["pseudocode"]).is_ok());
        assert!(validate_safety(&["run SUDO apt install"]).is_err());
    }

    fn capitalize_alternate(s: &str) -> String {
        s.chars()
            .enumerate()
            .map(|(i, c)| {
                if i % 2 == 0 {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect()
    }
}
