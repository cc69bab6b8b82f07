//! Command policy engine.
//!
//! Classifies each submitted command into allowed / denied under the active
//! permissibility tier. Matching is by effective head token (basename, sudo
//! stripped) against nested allowed sets, followed by a pattern pass that
//! blocks chaining, redirection, and injection. Validation is a pure function
//! of the command string and the engine's configuration.

pub mod tables;

use std::collections::HashSet;
use std::fmt;

use regex::Regex;

use crate::config::Config;
use crate::error::{Error, Result};

/// Process-global security tier. Immutable for the lifetime of the process.
/// Variant order matters: tiers are compared by strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissibilityLevel {
    Low,
    Medium,
    High,
}

impl PermissibilityLevel {
    /// Parse a tier name. Unknown values default to Medium.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => PermissibilityLevel::Low,
            "high" => PermissibilityLevel::High,
            _ => PermissibilityLevel::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissibilityLevel::Low => "low",
            PermissibilityLevel::Medium => "medium",
            PermissibilityLevel::High => "high",
        }
    }
}

impl fmt::Display for PermissibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rule produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedRule {
    NameNotAllowed,
    PatternForbidden,
    AlwaysDenied,
    Ok,
}

/// Result of validating a single command.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: String,
    pub matched_rule: MatchedRule,
}

impl ValidationResult {
    fn deny(rule: MatchedRule, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            matched_rule: rule,
        }
    }

    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "command allowed".to_string(),
            matched_rule: MatchedRule::Ok,
        }
    }
}

struct CompiledPattern {
    regex: Regex,
    label: String,
}

/// The policy engine. Built once at startup from the immutable config;
/// a malformed pattern is a fatal configuration error, never a runtime deny.
pub struct PolicyEngine {
    level: PermissibilityLevel,
    allowed: HashSet<&'static str>,
    always_denied: HashSet<&'static str>,
    always_forbidden: Vec<CompiledPattern>,
    tier_forbidden: Vec<CompiledPattern>,
    extra_forbidden: Vec<CompiledPattern>,
}

/// sudo flags that consume the following token.
const SUDO_ARG_FLAGS: &[&str] = &["-u", "-g", "-p", "-h", "-C", "-r", "-t"];

impl PolicyEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let level = config.level;

        let mut allowed: HashSet<&'static str> =
            tables::LOW_COMMANDS.iter().copied().collect();
        if level >= PermissibilityLevel::Medium {
            allowed.extend(tables::MEDIUM_EXTRA.iter().copied());
        }
        if level == PermissibilityLevel::High {
            allowed.extend(tables::HIGH_EXTRA.iter().copied());
        }

        let always_denied: HashSet<&'static str> =
            tables::ALWAYS_DENIED.iter().copied().collect();

        let always_forbidden = compile_specs(tables::ALWAYS_FORBIDDEN_PATTERNS)?;
        let tier_forbidden = match level {
            PermissibilityLevel::Low => compile_specs(tables::LOW_FORBIDDEN_PATTERNS)?,
            PermissibilityLevel::Medium => compile_specs(tables::MEDIUM_FORBIDDEN_PATTERNS)?,
            PermissibilityLevel::High => Vec::new(),
        };

        let mut extra_forbidden = Vec::with_capacity(config.extra_forbidden_patterns.len());
        for source in &config.extra_forbidden_patterns {
            let regex = Regex::new(source).map_err(|e| {
                Error::config(format!("invalid forbidden pattern '{source}': {e}"))
            })?;
            extra_forbidden.push(CompiledPattern {
                regex,
                label: format!("configured pattern '{source}'"),
            });
        }

        Ok(Self {
            level,
            allowed,
            always_denied,
            always_forbidden,
            tier_forbidden,
            extra_forbidden,
        })
    }

    pub fn level(&self) -> PermissibilityLevel {
        self.level
    }

    /// Number of command names admitted at the active tier.
    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }

    pub fn always_denied_count(&self) -> usize {
        self.always_denied.len()
    }

    /// Number of patterns active at the current tier, including the
    /// always-forbidden set and configured extras.
    pub fn patterns_active(&self) -> usize {
        self.always_forbidden.len() + self.tier_forbidden.len() + self.extra_forbidden.len()
    }

    /// Classify a command. First match wins; order per the tier contract:
    /// empty → denied name → tier name gate → sudo gate → always-forbidden
    /// patterns → tier patterns → allow.
    pub fn validate(&self, command: &str) -> ValidationResult {
        let command = command.trim_start();
        if command.trim().is_empty() {
            return ValidationResult::deny(MatchedRule::NameNotAllowed, "empty command");
        }

        let (head, uses_sudo) = effective_head(command);
        let head = match head {
            Some(h) => h,
            None => {
                return ValidationResult::deny(
                    MatchedRule::NameNotAllowed,
                    "no command after sudo",
                )
            }
        };

        if self.always_denied.contains(head) {
            return ValidationResult::deny(
                MatchedRule::AlwaysDenied,
                format!("command '{head}' is always denied"),
            );
        }

        if !self.allowed.contains(head) {
            return ValidationResult::deny(
                MatchedRule::NameNotAllowed,
                format!(
                    "command '{head}' is not allowed at the {} permissibility level",
                    self.level
                ),
            );
        }

        if uses_sudo && self.level != PermissibilityLevel::High {
            return ValidationResult::deny(
                MatchedRule::NameNotAllowed,
                "sudo is not permitted at this permissibility level",
            );
        }

        for pat in &self.always_forbidden {
            if pat.regex.is_match(command) {
                return ValidationResult::deny(
                    MatchedRule::AlwaysDenied,
                    format!("forbidden pattern: {}", pat.label),
                );
            }
        }

        for pat in self.tier_forbidden.iter().chain(&self.extra_forbidden) {
            if pat.regex.is_match(command) {
                return ValidationResult::deny(
                    MatchedRule::PatternForbidden,
                    format!("forbidden pattern: {}", pat.label),
                );
            }
        }

        // MEDIUM admits a plain pipe only when every segment's head is itself
        // allowed at MEDIUM. (`||` was already rejected by the pattern pass.)
        if self.level == PermissibilityLevel::Medium && command.contains('|') {
            for segment in command.split('|') {
                let (seg_head, _) = effective_head(segment);
                match seg_head {
                    Some(h) if self.allowed.contains(h) => {}
                    Some(h) => {
                        return ValidationResult::deny(
                            MatchedRule::PatternForbidden,
                            format!("pipe to disallowed command '{h}'"),
                        )
                    }
                    None => {
                        return ValidationResult::deny(
                            MatchedRule::PatternForbidden,
                            "empty pipeline segment",
                        )
                    }
                }
            }
        }

        ValidationResult::allow()
    }
}

fn compile_specs(specs: &[tables::PatternSpec]) -> Result<Vec<CompiledPattern>> {
    specs
        .iter()
        .map(|spec| {
            let regex = Regex::new(spec.source).map_err(|e| {
                Error::config(format!("invalid built-in pattern '{}': {e}", spec.source))
            })?;
            Ok(CompiledPattern {
                regex,
                label: spec.label.to_string(),
            })
        })
        .collect()
}

/// Extract the effective head token: skip leading env assignments, strip
/// `/bin/`-style path prefixes to the basename, and if the head is `sudo`,
/// step over its flags to the command actually being elevated.
fn effective_head(command: &str) -> (Option<&str>, bool) {
    let mut tokens = command.split_whitespace().peekable();

    // FOO=bar prefixes
    while let Some(tok) = tokens.peek() {
        if is_env_assignment(tok) {
            tokens.next();
        } else {
            break;
        }
    }

    let first = match tokens.next() {
        Some(t) => basename(t),
        None => return (None, false),
    };

    if first != "sudo" {
        return (Some(first), false);
    }

    // Effective head is the first non-flag token after sudo.
    while let Some(tok) = tokens.next() {
        if tok.starts_with('-') {
            if SUDO_ARG_FLAGS.contains(&tok) {
                tokens.next();
            }
            continue;
        }
        if is_env_assignment(tok) {
            continue;
        }
        return (Some(basename(tok)), true);
    }

    (None, true)
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn is_env_assignment(token: &str) -> bool {
    token.contains('=')
        && token
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine(level: PermissibilityLevel) -> PolicyEngine {
        let config = Config {
            level,
            ..Config::for_tests()
        };
        PolicyEngine::new(&config).unwrap()
    }

    #[test]
    fn test_level_parse_defaults_to_medium() {
        assert_eq!(PermissibilityLevel::parse("low"), PermissibilityLevel::Low);
        assert_eq!(PermissibilityLevel::parse("HIGH"), PermissibilityLevel::High);
        assert_eq!(
            PermissibilityLevel::parse("bogus"),
            PermissibilityLevel::Medium
        );
        assert_eq!(PermissibilityLevel::parse(""), PermissibilityLevel::Medium);
    }

    #[test]
    fn test_allowed_sets_are_nested() {
        let low = engine(PermissibilityLevel::Low);
        let medium = engine(PermissibilityLevel::Medium);
        let high = engine(PermissibilityLevel::High);
        assert!(low.allowed.is_subset(&medium.allowed));
        assert!(medium.allowed.is_subset(&high.allowed));
    }

    #[test]
    fn test_read_command_allowed_at_low() {
        let result = engine(PermissibilityLevel::Low).validate("ls -la /var/log");
        assert!(result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::Ok);
    }

    #[test]
    fn test_empty_command_denied() {
        let result = engine(PermissibilityLevel::High).validate("   ");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::NameNotAllowed);
    }

    #[test]
    fn test_chaining_denied_at_medium() {
        let result = engine(PermissibilityLevel::Medium).validate("ls && rm -rf /tmp/x");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::PatternForbidden);
    }

    #[test]
    fn test_sudo_gated_to_high() {
        let medium = engine(PermissibilityLevel::Medium);
        let result = medium.validate("sudo systemctl status ssh");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::NameNotAllowed);
        assert!(result.reason.contains("sudo"));

        let high = engine(PermissibilityLevel::High);
        assert!(high.validate("sudo systemctl status ssh").allowed);
    }

    #[test]
    fn test_sudo_flag_skipping() {
        let high = engine(PermissibilityLevel::High);
        assert!(high.validate("sudo -n whoami").allowed);
        assert!(high.validate("sudo -u postgres psql").allowed);
        // The elevated command is what gets checked, not the flag argument.
        let result = high.validate("sudo -u root mkfs /dev/sda1");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::AlwaysDenied);
    }

    #[test]
    fn test_rm_rf_root_denied_at_every_tier() {
        for level in [
            PermissibilityLevel::Low,
            PermissibilityLevel::Medium,
            PermissibilityLevel::High,
        ] {
            let result = engine(level).validate("rm -rf /");
            assert!(!result.allowed, "rm -rf / allowed at {level}");
        }
        // At LOW the name gate fires first (rm is not LOW-allowed); from
        // MEDIUM up it is the always-forbidden pattern that matches.
        assert_eq!(
            engine(PermissibilityLevel::Low).validate("rm -rf /").matched_rule,
            MatchedRule::NameNotAllowed
        );
        for level in [PermissibilityLevel::Medium, PermissibilityLevel::High] {
            assert_eq!(
                engine(level).validate("rm -rf /").matched_rule,
                MatchedRule::AlwaysDenied
            );
        }
    }

    #[test]
    fn test_rm_of_subdirectory_allowed_at_medium() {
        let result = engine(PermissibilityLevel::Medium).validate("rm -rf /tmp/build");
        assert!(result.allowed, "{}", result.reason);
    }

    #[test]
    fn test_dd_to_device_always_denied() {
        let result = engine(PermissibilityLevel::High).validate("dd if=/dev/zero of=/dev/sda");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::AlwaysDenied);
    }

    #[test]
    fn test_path_prefix_stripped_to_basename() {
        let low = engine(PermissibilityLevel::Low);
        assert!(low.validate("/bin/ls -la").allowed);
        let result = low.validate("/usr/sbin/shutdown now");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::AlwaysDenied);
    }

    #[test]
    fn test_env_assignment_prefix_skipped() {
        let low = engine(PermissibilityLevel::Low);
        assert!(low.validate("LANG=C ls /etc").allowed);
    }

    #[test]
    fn test_pipe_denied_at_low_allowed_at_medium() {
        let low = engine(PermissibilityLevel::Low);
        let result = low.validate("ps aux | grep ssh");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::PatternForbidden);

        let medium = engine(PermissibilityLevel::Medium);
        assert!(medium.validate("ps aux | grep ssh").allowed);
    }

    #[test]
    fn test_pipe_to_disallowed_head_denied_at_medium() {
        let medium = engine(PermissibilityLevel::Medium);
        let result = medium.validate("cat notes.txt | bash");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::PatternForbidden);
    }

    #[test]
    fn test_redirection_denied_below_high() {
        let medium = engine(PermissibilityLevel::Medium);
        assert!(!medium.validate("echo x > /tmp/f").allowed);
        assert!(!medium.validate("cat < /etc/passwd").allowed);
        let high = engine(PermissibilityLevel::High);
        assert!(high.validate("echo x > /tmp/f").allowed);
    }

    #[test]
    fn test_unknown_command_denied() {
        let result = engine(PermissibilityLevel::High).validate("frobnicate --all");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::NameNotAllowed);
    }

    #[test]
    fn test_bare_sudo_denied() {
        let result = engine(PermissibilityLevel::High).validate("sudo");
        assert!(!result.allowed);
        assert_eq!(result.matched_rule, MatchedRule::NameNotAllowed);
    }

    #[test]
    fn test_fork_bomb_denied_at_high() {
        let result = engine(PermissibilityLevel::High).validate(":(){ :|:& };:");
        assert!(!result.allowed);
    }

    #[test]
    fn test_bad_extra_pattern_is_config_error() {
        let config = Config {
            extra_forbidden_patterns: vec!["[unclosed".to_string()],
            ..Config::for_tests()
        };
        assert!(PolicyEngine::new(&config).is_err());
    }

    #[test]
    fn test_validation_exhaustive_grid() {
        // (command, allowed at low, at medium, at high)
        let grid: &[(&str, bool, bool, bool)] = &[
            ("ls -la", true, true, true),
            ("cat /etc/hostname", true, true, true),
            ("ps aux", true, true, true),
            ("df -h", true, true, true),
            ("cp a b", false, true, true),
            ("mv a b", false, true, true),
            ("mkdir /tmp/d", false, true, true),
            ("kill 1234", false, true, true),
            ("systemctl status ssh", false, true, true),
            ("sudo apt update", false, false, true),
            ("sudo systemctl restart ssh", false, false, true),
            ("apt install htop", false, false, true),
            ("rm -rf /", false, false, false),
            ("dd if=/dev/zero of=/dev/sda", false, false, false),
            ("mkfs.ext4 /dev/sda1", false, false, false),
            ("fdisk /dev/sda", false, false, false),
            ("shutdown now", false, false, false),
            ("ls && echo ok", false, false, true),
            ("ps aux | grep ssh", false, true, true),
        ];
        let low = engine(PermissibilityLevel::Low);
        let medium = engine(PermissibilityLevel::Medium);
        let high = engine(PermissibilityLevel::High);
        for (cmd, at_low, at_medium, at_high) in grid {
            assert_eq!(low.validate(cmd).allowed, *at_low, "low: {cmd}");
            assert_eq!(medium.validate(cmd).allowed, *at_medium, "medium: {cmd}");
            assert_eq!(high.validate(cmd).allowed, *at_high, "high: {cmd}");
        }
    }

    #[test]
    fn test_fork_bomb_fails_fast_on_name_at_low() {
        // At LOW the fork bomb definition is already rejected by the head gate.
        let result = engine(PermissibilityLevel::Low).validate(":(){ :|:& };:");
        assert!(!result.allowed);
    }
}
