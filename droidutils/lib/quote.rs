//! Shell quoting for command lines that are tunnelled through a remote shell.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Characters that force an argument to be single-quoted.
const SHELL_METACHARACTERS: &[char] = &[
    ' ', '\t', '\n', '$', '`', '"', '\'', '\\', '!', '*', '?', '[', ']', '{', '}', '(', ')', '|',
    '&', ';', '<', '>', '#', '~',
];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns true if `arg` must be quoted to survive a round trip through `sh`.
pub fn needs_quoting(arg: &str) -> bool {
    arg.is_empty() || arg.contains(SHELL_METACHARACTERS)
}

/// Quotes a single argument for `sh` if it contains shell metacharacters.
///
/// Embedded single quotes are closed, escaped and reopened (`'\''`).
pub fn quote_arg(arg: &str) -> String {
    if !needs_quoting(arg) {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Serializes a program and its arguments into one shell command line.
pub fn join_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = quote_arg(program);
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(arg.as_ref()));
    }
    line
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
