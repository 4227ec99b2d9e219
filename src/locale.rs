//! Locale-aware package names
//!
//! Package lists may name language packs through a `${LOCALE}` placeholder,
//! e.g. `firefox-i18n-${LOCALE}`. For any locale other than the default the
//! placeholder is replaced; for the default locale such entries are dropped
//! because there is no language pack to install.

use crate::types::PackageEntry;

/// Locale that has no language packs
pub const DEFAULT_LOCALE: &str = "en";

/// Name of the placeholder substituted into package names
pub const PLACEHOLDER: &str = "LOCALE";

/// Resolve the placeholder in every entry for `locale`.
///
/// - `locale != "en"`: `${LOCALE}` and `$LOCALE` become `locale`, any other
///   `$` sequence is left as written
/// - `locale == "en"`: entries whose name contains `LOCALE` are dropped
/// - entries with an empty name are dropped
///
/// Order of the surviving entries is preserved.
pub fn resolve(entries: &[PackageEntry], locale: &str) -> Vec<PackageEntry> {
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.name();
            let resolved = if locale != DEFAULT_LOCALE {
                substitute(name, locale)
            } else if name.contains(PLACEHOLDER) {
                return None;
            } else {
                name.to_string()
            };

            if resolved.is_empty() {
                return None;
            }
            Some(entry.with_name(resolved))
        })
        .collect()
}

/// Template substitution that never fails.
///
/// `$$` is an escaped dollar sign. Placeholders other than `LOCALE` and
/// unterminated braces are copied through unchanged.
fn substitute(template: &str, locale: &str) -> String {
    let mut out = String::with_capacity(template.len() + locale.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(tail) = after
            .strip_prefix('{')
            .and_then(|s| s.strip_prefix(PLACEHOLDER))
            .and_then(|s| s.strip_prefix('}'))
        {
            out.push_str(locale);
            rest = tail;
        } else if let Some(tail) = after.strip_prefix(PLACEHOLDER)
            && !tail.starts_with(is_identifier_char)
        {
            out.push_str(locale);
            rest = tail;
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    out
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
