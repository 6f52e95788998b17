//! Small shared helpers.

use std::sync::OnceLock;

use regex::Regex;

static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();

/// Remove ANSI escape sequences from `source`.
///
/// Kernel tracebacks arrive colorized for terminal display; strip the codes
/// before surfacing them in error messages or logs.
pub fn clean_ansi_codes(source: &str) -> String {
    let re = ANSI_ESCAPE.get_or_init(|| {
        Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").expect("static pattern is valid")
    });
    re.replace_all(source, "").into_owned()
}
