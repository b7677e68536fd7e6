//! Building shell scripts for backends that only accept a single command line.

use std::collections::BTreeMap;

use crate::sandbox::types::ExecCommand;

/// Quote a word for POSIX shells.
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\"'\"'"))
}

/// Join an argument vector into one shell command line.
pub fn join_argv(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The user's command as shell text: scripts verbatim, argv quoted.
pub fn command_text(command: &ExecCommand) -> String {
    match command {
        ExecCommand::Shell(script) => script.clone(),
        ExecCommand::Argv(args) => join_argv(args),
    }
}

/// Build a script that exports `env` and then runs `command`.
///
/// Names are expected to have passed [`ExecSpec::validate`](crate::sandbox::ExecSpec::validate).
pub fn script_with_env(env: &BTreeMap<String, String>, command: &ExecCommand) -> String {
    env.iter()
        .map(|(key, value)| format!("export {}={}", key, quote(value)))
        .chain(std::iter::once(command_text(command)))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("/tmp/a.txt"), "/tmp/a.txt");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_argv_is_quoted() {
        let command = ExecCommand::Argv(vec!["echo".into(), "Hello from sandbox".into()]);
        assert_eq!(command_text(&command), "echo 'Hello from sandbox'");
    }

    #[test]
    fn test_shell_text_is_verbatim() {
        let command = ExecCommand::Shell("echo 'to-stdout' && echo 'to-stderr' >&2".into());
        assert_eq!(
            command_text(&command),
            "echo 'to-stdout' && echo 'to-stderr' >&2"
        );
    }

    #[test]
    fn test_env_exports_prefix_command() {
        let mut env = BTreeMap::new();
        env.insert("TEST_VAR".to_string(), "test value".to_string());
        env.insert("A".to_string(), "1".to_string());

        let command = ExecCommand::Argv(vec!["printenv".into(), "TEST_VAR".into()]);
        assert_eq!(
            script_with_env(&env, &command),
            "export A=1; export TEST_VAR='test value'; printenv TEST_VAR"
        );
    }
}
