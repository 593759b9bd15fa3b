//! Logging helpers that keep secrets out of log output.
//!
//! Cookies, onion service private keys and stream isolation tokens must never
//! reach a log line. Wrap them in one of the types below before formatting.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact an onion host or service id, showing only the first 4 and last
/// 10 characters.
pub struct RedactedOnion<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedOnion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 16 && s.is_ascii() {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 10..])
        } else {
            write!(f, "[REDACTED ONION]")
        }
    }
}

impl<'a> fmt::Debug for RedactedOnion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Control commands whose arguments carry secrets.
const SECRET_COMMANDS: &[&str] = &["AUTHENTICATE", "ADD_ONION"];

/// Sanitize a control command for logging.
///
/// `AUTHENTICATE` loses its cookie. `ADD_ONION` keeps its port mappings but
/// loses any supplied key blob (`NEW:...` requests carry no secret and are
/// kept as is).
pub fn redact_command(cmd: &str) -> String {
    let mut words = cmd.split(' ');
    let keyword = words.next().unwrap_or_default();
    if !SECRET_COMMANDS.contains(&keyword) {
        return cmd.to_string();
    }

    let mut out = String::from(keyword);
    for word in words {
        out.push(' ');
        let is_secret = match keyword {
            "AUTHENTICATE" => true,
            _ => word.contains(':') && !word.starts_with("NEW:") && !word.starts_with("Port="),
        };
        if is_secret {
            out.push_str("[REDACTED]");
        } else {
            out.push_str(word);
        }
    }
    out
}
