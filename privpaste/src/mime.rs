//! MIME type overrides applied when items are served.

use std::collections::HashMap;

/// Generic MIME type for dropped or unknown content.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// What to do with a MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeAction {
    Passthrough,
    Rewrite(String),
    Drop,
}

/// Immutable table of MIME overrides, keyed by the essence of the type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeMap {
    actions: HashMap<String, MimeAction>,
}

impl MimeMap {
    /// Build the table; rewrites take precedence over drops.
    pub fn new<'a, D, R>(drop: D, rewrite: R) -> Self
    where
        D: IntoIterator<Item = &'a str>,
        R: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut actions = HashMap::new();
        for from in drop {
            actions.insert(essence(from), MimeAction::Drop);
        }
        for (from, to) in rewrite {
            actions.insert(essence(from), MimeAction::Rewrite(to.to_string()));
        }
        Self { actions }
    }

    pub fn action(&self, mime: &str) -> &MimeAction {
        self.actions
            .get(&essence(mime))
            .unwrap_or(&MimeAction::Passthrough)
    }

    /// Return the MIME type to serve for a stored type.
    pub fn apply(&self, mime: &str) -> String {
        match self.action(mime) {
            MimeAction::Passthrough => mime.to_string(),
            MimeAction::Rewrite(to) => to.clone(),
            MimeAction::Drop => OCTET_STREAM.to_string(),
        }
    }
}

/// `Text/HTML; charset=utf-8` becomes `text/html`.
fn essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_map() {
        let map = MimeMap::new(
            ["text/html", "image/svg+xml"],
            [("text/javascript", "text/plain"), ("image/svg+xml", "text/plain")],
        );

        assert_eq!(map.apply("text/plain"), "text/plain");
        assert_eq!(map.apply("text/html"), OCTET_STREAM);
        assert_eq!(map.apply("Text/HTML; charset=utf-8"), OCTET_STREAM);
        assert_eq!(map.apply("text/javascript"), "text/plain");
        assert_eq!(map.apply("image/svg+xml"), "text/plain");
        assert_eq!(map.action("image/png"), &MimeAction::Passthrough);
    }

    #[test]
    fn test_empty_map() {
        let map = MimeMap::default();
        assert_eq!(map.apply("text/html"), "text/html");
    }
}
