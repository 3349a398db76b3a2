use std::fmt::Display;

pub const RESET: u8 = 0;
pub const BOLD: u8 = 1;
pub const RED: u8 = 31;

/// Environment variable that turns colored output off when set to anything non-empty
pub const NO_COLOR: &str = "NO_COLOR";

/// Whether `NO_COLOR` is currently in effect. Read on every call.
pub fn no_color_env() -> bool {
    std::env::var_os(NO_COLOR).map_or(false, |v| !v.is_empty())
}

/// Wrap `value` in the ANSI escape for `code`, resetting afterwards.
///
/// Returns the plain rendering when `disabled`, when `NO_COLOR` is set, or
/// when `code` is zero.
pub fn colorize(value: impl Display, code: u8, disabled: bool) -> String {
    if disabled || code == RESET || no_color_env() {
        return value.to_string();
    }
    format!("\x1b[{}m{}\x1b[{}m", code, value, RESET)
}

// NO_COLOR is process wide, tests touching it take this lock
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
