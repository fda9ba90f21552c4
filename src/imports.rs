//! Import directives of a snippet and what they demand from the workspace.

use crate::config::ImportsConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*(?:import|export)[ \t]+(?:'([^'\n]*)'|"([^"\n]*)")"#)
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDirective {
    pub uri: String,
    /// 1-based line of the directive.
    pub line: usize,
    /// Character offset of the quoted URI, including the opening quote.
    pub char_start: usize,
    /// Length in characters of the quoted URI, quotes included.
    pub char_length: usize,
}

impl ImportDirective {
    /// `http` for `package:http/http.pad`.
    pub fn package_name(&self) -> Option<&str> {
        let rest = self.uri.strip_prefix("package:")?;
        let name = rest.split('/').next()?;
        (!name.is_empty()).then_some(name)
    }

    pub fn is_approved(&self, approved_prefixes: &[String]) -> bool {
        approved_prefixes
            .iter()
            .any(|prefix| self.uri.starts_with(prefix.as_str()))
    }
}

pub fn parse_imports(source: &str) -> Vec<ImportDirective> {
    IMPORT_RE
        .captures_iter(source)
        .filter_map(|caps| {
            let uri = caps.get(1).or_else(|| caps.get(2))?;
            // include the quote characters in the reported span
            let quoted_start = uri.start() - 1;
            let prefix = &source[..quoted_start];
            Some(ImportDirective {
                uri: uri.as_str().to_string(),
                line: prefix.matches('\n').count() + 1,
                char_start: prefix.chars().count(),
                char_length: uri.as_str().chars().count() + 2,
            })
        })
        .collect()
}

/// Dependencies the workspace must provision for these imports: every
/// imported package that appears in the supported table, with its
/// configured constraint. Unknown packages are left out; they are reported
/// by [`unapproved_imports`] instead.
pub fn required_dependencies(
    imports: &[ImportDirective],
    config: &ImportsConfig,
) -> BTreeMap<String, String> {
    imports
        .iter()
        .filter_map(|import| import.package_name())
        .filter_map(|name| {
            config
                .supported_packages
                .get(name)
                .map(|constraint| (name.to_string(), constraint.clone()))
        })
        .collect()
}

pub fn unapproved_imports<'a>(
    imports: &'a [ImportDirective],
    approved_prefixes: &[String],
) -> Vec<&'a ImportDirective> {
    imports
        .iter()
        .filter(|import| !import.is_approved(approved_prefixes))
        .collect()
}
