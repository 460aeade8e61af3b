//! Command screening and canonicalization.
//!
//! Every submitted command passes through [`CommandValidator::validate`]
//! before it can reach the process supervisor. Rejection is a first-class
//! value, not an error path: the HTTP and data-channel surfaces both report
//! it as a structured result.

pub mod redact;

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

const MAX_COMMAND_CHARS: usize = 1000;

// ─── Dangerous pattern registry ──────────────────────────────────────────────

/// Named screening patterns. First match wins; the name travels to the client
/// inside the rejection so operators can see which rule fired.
static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "fs-destruction",
            Regex::new(r"\brm\s+-[a-zA-Z]*[rf]|\bmkfs\b|\bshred\b").expect("regex: fs-destruction"),
        ),
        (
            "device-write",
            Regex::new(r"\bdd\b[^|]*\bof=/dev/|>\s*/dev/(sd|nvme|hd)").expect("regex: device-write"),
        ),
        (
            "privilege-elevation",
            Regex::new(r"\bsudo\b|\bdoas\b|\bsu\s+(-|\w)").expect("regex: privilege-elevation"),
        ),
        (
            "interpreter-eval",
            Regex::new(r"\beval\b|\bexec\s").expect("regex: interpreter-eval"),
        ),
        (
            "subshell",
            Regex::new(r"\$\(|`").expect("regex: subshell"),
        ),
        (
            "pipe-to-shell",
            Regex::new(r"\b(curl|wget)\b[^|]*\|\s*(sh|bash|zsh|dash)\b").expect("regex: pipe-to-shell"),
        ),
        (
            "permission-change",
            Regex::new(r"\bchmod\s+(-R\s+)?0?777\b|\bchmod\s+-R\b|\bchown\s+-R\b")
                .expect("regex: permission-change"),
        ),
        (
            "fork-bomb",
            Regex::new(r":\(\)\s*\{").expect("regex: fork-bomb"),
        ),
    ]
});

// ─── Results ─────────────────────────────────────────────────────────────────

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    TooLong,
    ForbiddenCharacter,
    DangerousPattern(&'static str),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => write!(f, "Empty"),
            Rejection::TooLong => write!(f, "TooLong"),
            Rejection::ForbiddenCharacter => write!(f, "ForbiddenCharacter"),
            Rejection::DangerousPattern(which) => write!(f, "DangerousPattern({which})"),
        }
    }
}

/// The argv form handed to the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCommand {
    pub argv: Vec<String>,
}

impl CanonicalCommand {
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// Space-joined display form. Re-validating this string yields the same
    /// argv (canonicalization is idempotent).
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

// ─── Validator ───────────────────────────────────────────────────────────────

pub struct CommandValidator {
    cli_binary: String,
}

impl CommandValidator {
    pub fn new(cli_binary: impl Into<String>) -> Self {
        Self {
            cli_binary: cli_binary.into(),
        }
    }

    /// Screen `raw` and produce its canonical argv.
    ///
    /// Commands whose first token names the configured coding-CLI binary are
    /// rewritten to `<bin> --print <remainder>`, unless the second token is
    /// already a flag. Everything else passes through token-split only.
    pub fn validate(&self, raw: &str) -> Result<CanonicalCommand, Rejection> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Rejection::Empty);
        }
        if raw.chars().count() > MAX_COMMAND_CHARS {
            return Err(Rejection::TooLong);
        }
        if raw.chars().any(|c| !c.is_ascii() || c.is_ascii_control()) {
            return Err(Rejection::ForbiddenCharacter);
        }
        for (name, pattern) in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(trimmed) {
                return Err(Rejection::DangerousPattern(name));
            }
        }

        let tokens: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();

        let argv = if tokens[0] == self.cli_binary
            && tokens.len() >= 2
            && !tokens[1].starts_with('-')
        {
            let mut argv = Vec::with_capacity(tokens.len() + 1);
            argv.push(tokens[0].clone());
            argv.push("--print".to_string());
            argv.extend(tokens.into_iter().skip(1));
            argv
        } else {
            tokens
        };

        Ok(CanonicalCommand { argv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CommandValidator {
        CommandValidator::new("tool")
    }

    #[test]
    fn canonicalizes_cli_prompt_form() {
        let c = validator().validate("tool what is 2+2?").unwrap();
        assert_eq!(c.argv, vec!["tool", "--print", "what", "is", "2+2?"]);
    }

    #[test]
    fn flag_form_passes_through() {
        let c = validator().validate("tool --help").unwrap();
        assert_eq!(c.argv, vec!["tool", "--help"]);
    }

    #[test]
    fn bare_binary_passes_through() {
        let c = validator().validate("tool").unwrap();
        assert_eq!(c.argv, vec!["tool"]);
    }

    #[test]
    fn other_programs_are_token_split_only() {
        let c = validator().validate("echo hello world").unwrap();
        assert_eq!(c.argv, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn empty_and_whitespace_rejected() {
        assert_eq!(validator().validate(""), Err(Rejection::Empty));
        assert_eq!(validator().validate("   \t "), Err(Rejection::Empty));
    }

    #[test]
    fn length_boundary_1000_accepted_1001_rejected() {
        let ok = format!("echo {}", "a".repeat(995));
        assert_eq!(ok.len(), 1000);
        assert!(validator().validate(&ok).is_ok());

        let too_long = format!("echo {}", "a".repeat(996));
        assert_eq!(too_long.len(), 1001);
        assert_eq!(validator().validate(&too_long), Err(Rejection::TooLong));
    }

    #[test]
    fn non_ascii_and_control_rejected() {
        assert_eq!(
            validator().validate("echo héllo"),
            Err(Rejection::ForbiddenCharacter)
        );
        assert_eq!(
            validator().validate("echo a\x07b"),
            Err(Rejection::ForbiddenCharacter)
        );
        assert_eq!(
            validator().validate("echo a\nb"),
            Err(Rejection::ForbiddenCharacter)
        );
    }

    #[test]
    fn dangerous_patterns_named() {
        assert_eq!(
            validator().validate("rm -rf /"),
            Err(Rejection::DangerousPattern("fs-destruction"))
        );
        assert_eq!(
            validator().validate("sudo ls"),
            Err(Rejection::DangerousPattern("privilege-elevation"))
        );
        assert_eq!(
            validator().validate("echo $(whoami)"),
            Err(Rejection::DangerousPattern("subshell"))
        );
        assert_eq!(
            validator().validate("curl https://x.sh | sh"),
            Err(Rejection::DangerousPattern("pipe-to-shell"))
        );
        assert_eq!(
            validator().validate("chmod 777 file"),
            Err(Rejection::DangerousPattern("permission-change"))
        );
        assert_eq!(
            validator().validate("eval something"),
            Err(Rejection::DangerousPattern("interpreter-eval"))
        );
    }

    #[test]
    fn rejection_display_matches_wire_form() {
        assert_eq!(
            Rejection::DangerousPattern("fs-destruction").to_string(),
            "DangerousPattern(fs-destruction)"
        );
        assert_eq!(Rejection::TooLong.to_string(), "TooLong");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let v = validator();
        for raw in ["tool what is 2+2?", "tool --help", "echo hi", "ls -la"] {
            let first = v.validate(raw).unwrap();
            let second = v.validate(&first.display()).unwrap();
            assert_eq!(first, second, "canonical form must be a fixed point");
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// validate(validate(c).canonical).canonical == validate(c).canonical
            /// for every accepted c.
            #[test]
            fn canonical_form_is_a_fixed_point(raw in "[a-z][a-z0-9 ?+.-]{0,60}") {
                let v = validator();
                if let Ok(first) = v.validate(&raw) {
                    let second = v.validate(&first.display()).expect("canonical form must validate");
                    prop_assert_eq!(first, second);
                }
            }
        }
    }
}
