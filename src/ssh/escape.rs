//! Shell quoting for remote command lines

/// Quote `s` so a POSIX shell treats it as one literal word.
///
/// The value is wrapped in single quotes; embedded single quotes become
/// `'\''` (close, escaped quote, reopen).
pub fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
