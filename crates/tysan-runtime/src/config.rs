//! Runtime flags.
//!
//! Flags come from a [`FlagSource`], by default the `TYSAN_OPTIONS`
//! environment variable parsed by [`OptionString`]:
//!
//! ```text
//! TYSAN_OPTIONS="halt_on_error=1:verbosity=1 report_format='json'"
//! ```
//!
//! Entries are separated by `:`, `,` or whitespace, values may be quoted, and
//! a bare name is shorthand for `name=1`. Flags are resolved once during
//! runtime initialization and never change afterwards.

use std::fmt::Write;

use crate::error::FlagError;

/// Environment variable read by [`OptionString::from_env`].
pub const OPTIONS_ENV: &str = "TYSAN_OPTIONS";

/// Key/value lookup consumed by [`Flags::from_source`].
pub trait FlagSource {
    /// The value of `name`, if present. Later definitions win.
    fn get(&self, name: &str) -> Option<&str>;

    /// Every distinct key carried by the source, in first-seen order.
    fn keys(&self) -> Vec<&str>;
}

/// Parsed `name=value` option string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionString {
    entries: Vec<(String, String)>,
}

impl OptionString {
    /// Parse an option string. Never fails: malformed fragments become keys
    /// that [`Flags::from_source`] reports as unrecognized.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut entries = Vec::new();
        let mut chars = input.chars().peekable();
        loop {
            while chars.next_if(|&c| is_separator(c)).is_some() {}
            if chars.peek().is_none() {
                break;
            }
            let mut name = String::new();
            while let Some(c) = chars.next_if(|&c| c != '=' && !is_separator(c)) {
                name.push(c);
            }
            let value = if chars.next_if_eq(&'=').is_some() {
                let mut value = String::new();
                match chars.next_if(|&c| c == '\'' || c == '"') {
                    Some(quote) => {
                        for c in chars.by_ref() {
                            if c == quote {
                                break;
                            }
                            value.push(c);
                        }
                    }
                    None => {
                        while let Some(c) = chars.next_if(|&c| !is_separator(c)) {
                            value.push(c);
                        }
                    }
                }
                value
            } else {
                String::from("1")
            };
            if !name.is_empty() {
                entries.push((name, value));
            }
        }
        Self { entries }
    }

    /// Parse `$TYSAN_OPTIONS`; empty when unset or not UTF-8.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(OPTIONS_ENV)
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_separator(c: char) -> bool {
    c == ':' || c == ',' || c.is_whitespace()
}

impl FlagSource for OptionString {
    fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.entries.len());
        for (k, _) in &self.entries {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }
}

/// When report decoration is emitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// Colour only when stderr is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorMode {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "always" | "on" | "1" => Some(Self::Always),
            "never" | "off" | "0" => Some(Self::Never),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Always => "always",
            Self::Never => "never",
        }
    }

    /// Resolve `Auto` against whether the output is a terminal.
    #[must_use]
    pub const fn enabled(self, is_tty: bool) -> bool {
        match self {
            Self::Auto => is_tty,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Report rendering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl ReportFormat {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Resolved runtime flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub halt_on_error: bool,
    pub exitcode: i32,
    pub verbosity: i32,
    pub print_stacktrace: bool,
    pub color: ColorMode,
    pub report_format: ReportFormat,
    pub print_summary: bool,
    pub strict_flags: bool,
    pub help: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            halt_on_error: false,
            exitcode: 1,
            verbosity: 0,
            print_stacktrace: true,
            color: ColorMode::Auto,
            report_format: ReportFormat::Text,
            print_summary: false,
            strict_flags: false,
            help: false,
        }
    }
}

/// Name and description of every flag, in `describe` order.
const FLAG_HELP: &[(&str, &str)] = &[
    ("halt_on_error", "Exit after the first reported violation."),
    ("exitcode", "Exit status used by halt_on_error and fatal errors."),
    ("verbosity", "Verbosity level (0 - silent, 1 - init banner, 2 - interceptor setup)."),
    ("print_stacktrace", "Print a stack trace with every report."),
    ("color", "Colorize reports: auto, always or never."),
    ("report_format", "Report format: text or json (one object per line)."),
    ("print_summary", "Print per-kind violation counts at exit."),
    ("strict_flags", "Treat unrecognized flags and bad values as fatal."),
    ("help", "Print flag descriptions."),
];

impl Flags {
    /// Resolve flags from `source`, starting from the defaults.
    ///
    /// Unknown keys and unparsable values are returned alongside the flags;
    /// the offending entries leave their defaults untouched.
    #[must_use]
    pub fn from_source(source: &dyn FlagSource) -> (Self, Vec<FlagError>) {
        let mut flags = Self::default();
        let mut errors = Vec::new();
        for key in source.keys() {
            let Some(value) = source.get(key) else {
                continue;
            };
            if let Err(err) = flags.apply(key, value) {
                errors.push(err);
            }
        }
        (flags, errors)
    }

    fn apply(&mut self, name: &str, value: &str) -> Result<(), FlagError> {
        let invalid = || FlagError::InvalidValue {
            name: name.to_owned(),
            value: value.to_owned(),
        };
        match name {
            "halt_on_error" => self.halt_on_error = parse_bool(value).ok_or_else(invalid)?,
            "exitcode" => self.exitcode = value.parse().map_err(|_| invalid())?,
            "verbosity" => self.verbosity = value.parse().map_err(|_| invalid())?,
            "print_stacktrace" => self.print_stacktrace = parse_bool(value).ok_or_else(invalid)?,
            "color" => self.color = ColorMode::from_str_loose(value).ok_or_else(invalid)?,
            "report_format" => {
                self.report_format = ReportFormat::from_str_loose(value).ok_or_else(invalid)?;
            }
            "print_summary" => self.print_summary = parse_bool(value).ok_or_else(invalid)?,
            "strict_flags" => self.strict_flags = parse_bool(value).ok_or_else(invalid)?,
            "help" => self.help = parse_bool(value).ok_or_else(invalid)?,
            _ => return Err(FlagError::Unrecognized(name.to_owned())),
        }
        Ok(())
    }

    fn value_of(&self, name: &str) -> String {
        match name {
            "halt_on_error" => self.halt_on_error.to_string(),
            "exitcode" => self.exitcode.to_string(),
            "verbosity" => self.verbosity.to_string(),
            "print_stacktrace" => self.print_stacktrace.to_string(),
            "color" => self.color.as_str().to_owned(),
            "report_format" => self.report_format.as_str().to_owned(),
            "print_summary" => self.print_summary.to_string(),
            "strict_flags" => self.strict_flags.to_string(),
            "help" => self.help.to_string(),
            _ => String::new(),
        }
    }

    /// Flag descriptions with current values, as printed for `help=1`.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::from("Available flags for TypeSanitizer:\n");
        for (name, help) in FLAG_HELP {
            let _ = writeln!(
                out,
                "\t{name}\n\t\t- {help} (Current Value: {})",
                self.value_of(name)
            );
        }
        out
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixed_separators_and_quotes() {
        let opts = OptionString::parse("a=1:b=two,c='x y' d=\"q:r\"\te");
        assert_eq!(opts.get("a"), Some("1"));
        assert_eq!(opts.get("b"), Some("two"));
        assert_eq!(opts.get("c"), Some("x y"));
        assert_eq!(opts.get("d"), Some("q:r"));
        assert_eq!(opts.get("e"), Some("1"));
        assert_eq!(opts.keys(), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn later_entries_override_earlier_ones() {
        let opts = OptionString::parse("verbosity=1:verbosity=2");
        assert_eq!(opts.get("verbosity"), Some("2"));
        assert_eq!(opts.keys(), vec!["verbosity"]);
    }

    #[test]
    fn empty_input_has_no_entries() {
        assert!(OptionString::parse("").is_empty());
        assert!(OptionString::parse(" :,, ").is_empty());
    }

    #[test]
    fn defaults() {
        let flags = Flags::default();
        assert!(!flags.halt_on_error);
        assert_eq!(flags.exitcode, 1);
        assert_eq!(flags.verbosity, 0);
        assert!(flags.print_stacktrace);
        assert_eq!(flags.color, ColorMode::Auto);
        assert_eq!(flags.report_format, ReportFormat::Text);
        assert!(!flags.print_summary);
        assert!(!flags.strict_flags);
        assert!(!flags.help);
    }

    #[test]
    fn resolves_every_flag() {
        let opts = OptionString::parse(
            "halt_on_error=yes exitcode=-7 verbosity=2 print_stacktrace=false \
             color=never report_format=JSON print_summary strict_flags=1 help=no",
        );
        let (flags, errors) = Flags::from_source(&opts);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(flags.halt_on_error);
        assert_eq!(flags.exitcode, -7);
        assert_eq!(flags.verbosity, 2);
        assert!(!flags.print_stacktrace);
        assert_eq!(flags.color, ColorMode::Never);
        assert_eq!(flags.report_format, ReportFormat::Json);
        assert!(flags.print_summary);
        assert!(flags.strict_flags);
        assert!(!flags.help);
    }

    #[test]
    fn bad_entries_are_reported_and_keep_defaults() {
        let opts = OptionString::parse("bogus=1:exitcode=abc:halt_on_error=maybe:verbosity=3");
        let (flags, errors) = Flags::from_source(&opts);
        assert_eq!(flags.exitcode, 1);
        assert!(!flags.halt_on_error);
        assert_eq!(flags.verbosity, 3);
        assert_eq!(
            errors,
            vec![
                FlagError::Unrecognized("bogus".into()),
                FlagError::InvalidValue {
                    name: "exitcode".into(),
                    value: "abc".into()
                },
                FlagError::InvalidValue {
                    name: "halt_on_error".into(),
                    value: "maybe".into()
                },
            ]
        );
    }

    #[test]
    fn describe_lists_every_flag_with_current_value() {
        let flags = Flags {
            exitcode: 42,
            ..Flags::default()
        };
        let text = flags.describe();
        assert!(text.starts_with("Available flags for TypeSanitizer:\n"));
        for (name, _) in FLAG_HELP {
            assert!(text.contains(&format!("\t{name}\n")), "{name}");
        }
        assert!(text.contains("(Current Value: 42)"));
    }

    #[test]
    fn color_resolution() {
        assert!(ColorMode::Auto.enabled(true));
        assert!(!ColorMode::Auto.enabled(false));
        assert!(ColorMode::Always.enabled(false));
        assert!(!ColorMode::Never.enabled(true));
        assert_eq!(ColorMode::from_str_loose("ALWAYS"), Some(ColorMode::Always));
        assert_eq!(ColorMode::from_str_loose("sometimes"), None);
    }
}
