//! Display-name slugs shared by gear lines and buff-name resolution.
use once_cell::sync::Lazy;
use regex::Regex;

static POSSESSIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"['’]s\b").expect("valid regex"));
static APOSTROPHE: Lazy<Regex> = Lazy::new(|| Regex::new(r"['’]").expect("valid regex"));
static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Convert a display name into `snake_case`.
///
/// Possessives collapse (`Gambler's` → `gamblers`), other apostrophes are
/// dropped, and every run of non-alphanumeric characters (hyphens included)
/// becomes a single underscore. Lower-casing is Unicode-aware but
/// locale independent, so the function is pure.
#[must_use]
pub fn to_snake(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let s = POSSESSIVE.replace_all(&lowered, "s");
    let s = APOSTROPHE.replace_all(&s, "");
    let s = NON_ALNUM.replace_all(&s, "_");
    s.trim_matches('_').to_string()
}
