//! Route descriptors and path matching.
//!
//! Patterns are `/`-separated. A segment is either literal, a `:name`
//! parameter matching one non-empty segment, or a trailing `*name` catch-all
//! matching the rest of the path.

use serde::Deserialize;
use std::sync::Arc;

/// Body selector used when a route does not name one.
pub const DEFAULT_BODY_SELECTOR: &str = "main";

fn default_body_selector() -> String {
    DEFAULT_BODY_SELECTOR.to_string()
}

/// A configured route and the augmentation it asks for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    /// Route name (the key of its `[route.<name>]` table).
    #[serde(default)]
    pub name: String,
    /// Path pattern.
    pub path: String,
    /// CSS selector of the element whose rendered content is captured and spliced.
    #[serde(default = "default_body_selector")]
    pub body_selector: String,
    /// Inject Open Graph metadata into `<head>`.
    #[serde(default)]
    pub ogp: bool,
    /// Inject the rendered fragment into the body selector.
    #[serde(default)]
    pub ssr: bool,
}

impl Route {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            body_selector: default_body_selector(),
            ogp: false,
            ssr: false,
        }
    }

    pub fn with_body_selector(mut self, selector: impl Into<String>) -> Self {
        self.body_selector = selector.into();
        self
    }

    pub fn with_ogp(mut self, enabled: bool) -> Self {
        self.ogp = enabled;
        self
    }

    pub fn with_ssr(mut self, enabled: bool) -> Self {
        self.ssr = enabled;
        self
    }

    /// Whether requests on this route go through the render pipeline.
    pub fn renders(&self) -> bool {
        self.ogp || self.ssr
    }

    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.path, path)
    }

    /// Ranks patterns so literal routes beat parameterized ones and
    /// catch-alls lose to everything else.
    fn specificity(&self) -> (bool, usize) {
        let segments: Vec<&str> = segments(&self.path).collect();
        let catch_all = segments.iter().any(|s| s.starts_with('*'));
        let literals = segments
            .iter()
            .filter(|s| !s.starts_with(':') && !s.starts_with('*'))
            .count();
        (!catch_all, literals)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').skip(1)
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }

    let mut wanted = segments(pattern);
    let mut actual = segments(path);
    loop {
        match (wanted.next(), actual.next()) {
            // a catch-all also accepts an empty remainder
            (Some(p), _) if p.starts_with('*') => return true,
            (Some(p), Some(s)) if p.starts_with(':') => {
                if s.is_empty() {
                    return false;
                }
            }
            (Some(p), Some(s)) => {
                if p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Ordered set of routes with most-specific-first lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        // stable: equal specificity keeps insertion order
        routes.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        Self { routes }
    }

    /// Returns the most specific route whose pattern matches `path`.
    pub fn match_path(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(pattern_matches("/", "/"));
        assert!(pattern_matches("/about", "/about"));
        assert!(!pattern_matches("/about", "/about/team"));
        assert!(!pattern_matches("/about", "/"));
    }

    #[test]
    fn parameter_segments_require_a_value() {
        assert!(pattern_matches("/posts/:id", "/posts/42"));
        assert!(!pattern_matches("/posts/:id", "/posts/"));
        assert!(!pattern_matches("/posts/:id", "/posts/42/comments"));
    }

    #[test]
    fn catch_all_matches_remaining_path() {
        assert!(pattern_matches("/docs/*rest", "/docs/a/b/c"));
        assert!(pattern_matches("/docs/*rest", "/docs/"));
        assert!(!pattern_matches("/docs/*rest", "/blog/a"));
    }

    #[test]
    fn table_prefers_specific_routes() {
        let table = RouteTable::new(vec![
            Route::new("fallback", "/*path"),
            Route::new("post", "/posts/:id").with_ogp(true),
            Route::new("featured", "/posts/featured").with_ssr(true),
        ]);

        assert_eq!(table.match_path("/posts/featured").unwrap().name, "featured");
        assert_eq!(table.match_path("/posts/7").unwrap().name, "post");
        assert_eq!(table.match_path("/elsewhere").unwrap().name, "fallback");
    }

    #[test]
    fn route_defaults() {
        let route = Route::new("home", "/");
        assert_eq!(route.body_selector, "main");
        assert!(!route.renders());
        assert!(route.clone().with_ogp(true).renders());
        assert!(route.with_ssr(true).renders());
    }

    #[test]
    fn empty_table_matches_nothing() {
        let table = RouteTable::default();
        assert!(table.is_empty());
        assert!(table.match_path("/").is_none());
    }
}
