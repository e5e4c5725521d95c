//! Test and suite descriptors.
//!
//! These are immutable value types: a [`Test`] identifies one invocation, a [`Suite`] is a
//! named, ordered collection of them. Two suites are allowed to share the same `Test` value;
//! identity is the test's `name`.

use std::collections::BTreeMap;

/// Immutable description of a single test invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Test {
    name: String,
    command: String,
    arguments: Vec<String>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    parallelizable: bool,
}

impl Test {
    /// Creates a new test descriptor.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            arguments: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            parallelizable: false,
        }
    }

    pub fn with_arguments(mut self, arguments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_parallelizable(mut self, parallelizable: bool) -> Self {
        self.parallelizable = parallelizable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn parallelizable(&self) -> bool {
        self.parallelizable
    }

    /// The full shell-ready command line: `command` followed by `arguments`, space joined.
    pub fn full_command(&self) -> String {
        if self.arguments.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.arguments.join(" "))
        }
    }
}

/// A named, ordered list of [`Test`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suite {
    pub name: String,
    pub tests: Vec<Test>,
}

impl Suite {
    pub fn new(name: impl Into<String>, tests: Vec<Test>) -> Self {
        Self {
            name: name.into(),
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_command_joins_arguments() {
        let t = Test::new("t1", "echo").with_arguments(["-n", "ciao"]);
        assert_eq!(t.full_command(), "echo -n ciao");
    }

    #[test]
    fn full_command_without_arguments_is_bare_command() {
        let t = Test::new("t1", "true");
        assert_eq!(t.full_command(), "true");
    }
}
