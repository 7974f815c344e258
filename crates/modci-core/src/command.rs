//! Build command resolution.
//!
//! A build runs either the per-task override for the project or the
//! default command for its [`BuildKind`]. Both pass through `${NAME}`
//! placeholder substitution.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use modci_state::BuildKind;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

pub const PROJECT_ID: &str = "PROJECT_ID";
pub const PROJECT_NAME: &str = "PROJECT_NAME";
pub const PROJECT_DIR: &str = "PROJECT_DIR";
pub const BRANCH: &str = "BRANCH";
pub const TASK_ID: &str = "TASK_ID";
pub const LOG_FILE: &str = "LOG_FILE";

/// Where the command that ran came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Override,
    Default,
}

/// Values available to `${NAME}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderContext {
    vars: HashMap<String, String>,
}

impl PlaceholderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable, replacing any previous value.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.vars.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern compiles")
    })
}

/// Turns an override (or default template) into a literal command line.
pub struct BuildCommandResolver;

impl BuildCommandResolver {
    /// Resolve an override. `None` when the override is absent or blank,
    /// in which case the caller falls back to the default table.
    pub fn resolve(override_command: Option<&str>, ctx: &PlaceholderContext) -> Option<String> {
        override_command
            .filter(|command| !command.trim().is_empty())
            .map(|command| Self::substitute(command, ctx))
    }

    /// Replace known placeholders. Unknown ones are left as written.
    pub fn substitute(template: &str, ctx: &PlaceholderContext) -> String {
        placeholder_pattern()
            .replace_all(template, |caps: &Captures<'_>| match ctx.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

/// Default build commands indexed by build kind.
#[derive(Debug, Clone)]
pub struct DefaultCommandTable {
    commands: HashMap<BuildKind, String>,
}

impl Default for DefaultCommandTable {
    fn default() -> Self {
        let commands = [
            (BuildKind::Maven, "mvn -B -U clean install -DskipTests"),
            (BuildKind::Gradle, "./gradlew build -x test"),
            (BuildKind::Npm, "npm ci && npm run build"),
            (BuildKind::Cargo, "cargo build --release --locked"),
            (BuildKind::Go, "go build ./..."),
            (BuildKind::Python, "python -m pip wheel --no-deps -w dist ."),
            (
                BuildKind::Docker,
                "docker build -t ${PROJECT_NAME}:${TASK_ID} .",
            ),
        ]
        .into_iter()
        .map(|(kind, command)| (kind, command.to_string()))
        .collect();
        Self { commands }
    }
}

impl DefaultCommandTable {
    /// Built-in defaults with configured replacements applied. Entries whose
    /// key is not a build kind name are ignored; `CiConfig::validate`
    /// reports them.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        for (name, command) in overrides {
            if let Some(kind) = BuildKind::from_name(name) {
                table.commands.insert(kind, command.clone());
            }
        }
        table
    }

    pub fn command_for(&self, kind: BuildKind) -> Option<&str> {
        self.commands.get(&kind).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PlaceholderContext {
        PlaceholderContext::new()
            .with(PROJECT_NAME, "billing")
            .with(BRANCH, "release/2.1")
            .with(TASK_ID, 77)
    }

    #[test]
    fn test_blank_override_falls_back() {
        assert_eq!(BuildCommandResolver::resolve(None, &ctx()), None);
        assert_eq!(BuildCommandResolver::resolve(Some("  \t"), &ctx()), None);
    }

    #[test]
    fn test_override_substitutes_known_placeholders() {
        let resolved =
            BuildCommandResolver::resolve(Some("make ${PROJECT_NAME} BRANCH=${BRANCH}"), &ctx());
        assert_eq!(
            resolved.as_deref(),
            Some("make billing BRANCH=release/2.1")
        );
    }

    #[test]
    fn test_unknown_placeholder_left_literal() {
        let resolved = BuildCommandResolver::substitute("echo ${HOME_DIR} ${TASK_ID}", &ctx());
        assert_eq!(resolved, "echo ${HOME_DIR} 77");
    }

    #[test]
    fn test_bare_dollar_untouched() {
        let resolved = BuildCommandResolver::substitute("echo $PATH ${}", &ctx());
        assert_eq!(resolved, "echo $PATH ${}");
    }

    #[test]
    fn test_extra_variables() {
        let ctx = ctx().with("PROFILE", "prod");
        let resolved = BuildCommandResolver::substitute("mvn -P${PROFILE}", &ctx);
        assert_eq!(resolved, "mvn -Pprod");
    }

    #[test]
    fn test_default_table_covers_kinds_except_custom() {
        let table = DefaultCommandTable::default();
        assert!(table.command_for(BuildKind::Maven).is_some());
        assert!(table.command_for(BuildKind::Cargo).is_some());
        assert!(table.command_for(BuildKind::Custom).is_none());
    }

    #[test]
    fn test_default_table_overrides() {
        let overrides: BTreeMap<String, String> = [
            ("maven".to_string(), "mvn -q package".to_string()),
            ("custom".to_string(), "./build.sh".to_string()),
            ("ant".to_string(), "ant".to_string()),
        ]
        .into_iter()
        .collect();

        let table = DefaultCommandTable::with_overrides(&overrides);
        assert_eq!(table.command_for(BuildKind::Maven), Some("mvn -q package"));
        assert_eq!(table.command_for(BuildKind::Custom), Some("./build.sh"));
        assert_eq!(table.command_for(BuildKind::Npm), Some("npm ci && npm run build"));
    }
}
