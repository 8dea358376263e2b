//! Social-preview derivation from a rendered fragment.
//!
//! Given the title and innerHTML captured by the render worker, this module
//! derives a plain-text description, picks a representative image and writes
//! the Open Graph / Twitter card `<meta>` markup for the page.

use scraper::{Html, Node, Selector};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::cache::{RenderedPage, RequestKey};
use crate::worker::RenderedFragment;

/// Maximum length of the derived description, in characters.
pub const DESCRIPTION_LIMIT: usize = 160;

const IMAGE_SELECTOR: &str = "img, image";

/// Text inside these elements never ends up in a description.
const SILENT_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Values extracted from a rendered fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePreview {
    pub title: String,
    pub description: String,
    pub image: String,
}

impl PagePreview {
    /// Parses `inner_html` and derives description and image.
    ///
    /// HTML parsing is lenient, so malformed fragments still produce a
    /// (possibly empty) preview rather than an error.
    pub fn extract(title: &str, inner_html: &str, default_image: &str) -> Self {
        let fragment = Html::parse_fragment(inner_html);
        Self {
            title: title.trim().to_string(),
            description: truncate_chars(&visible_text(&fragment), DESCRIPTION_LIMIT),
            image: first_image(&fragment).unwrap_or_else(|| default_image.to_string()),
        }
    }
}

/// Elements that start a new line of text; everything else is inline.
const BLOCK_ELEMENTS: [&str; 22] = [
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "li", "p", "section", "tr",
];

/// Concatenates the fragment's text nodes, breaking only at block
/// boundaries, and collapses the result into a single line.
fn visible_text(fragment: &Html) -> String {
    let mut raw = String::new();
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => raw.push(' '),
            Node::Text(chunk) => {
                let silenced = node
                    .parent()
                    .and_then(|parent| parent.value().as_element().map(|el| el.name()))
                    .map(|name| SILENT_ELEMENTS.contains(&name))
                    .unwrap_or(false);
                if !silenced {
                    raw.push_str(chunk);
                }
            }
            _ => {}
        }
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_image(fragment: &Html) -> Option<String> {
    let selector = Selector::parse(IMAGE_SELECTOR).ok()?;
    fragment
        .select(&selector)
        .filter_map(|el| el.value().attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty())
        .map(str::to_string)
}

/// Returns at most `limit` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Site-wide values shared by every preview card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteProfile {
    pub domain: String,
    pub site_name: String,
    pub owner: String,
    /// Image used when a fragment has none.
    pub logo_url: String,
    pub twitter_id: Option<String>,
    pub facebook_app_id: Option<String>,
}

impl SiteProfile {
    /// Writes the `<meta>` tags describing `preview` as an article at `url`.
    pub fn article_markup(
        &self,
        url: &str,
        preview: &PagePreview,
        published: OffsetDateTime,
    ) -> String {
        let mut tags = MetaTags::default();
        tags.property("og:type", "article");
        tags.property("og:url", url);
        tags.property("og:title", &preview.title);
        tags.property("og:description", &preview.description);
        tags.property("og:image", &preview.image);
        tags.property("og:site_name", &self.site_name);
        if let Ok(stamp) = published.format(&Rfc3339) {
            tags.property("article:published_time", &stamp);
        }
        tags.property("article:author", &self.owner);
        tags.property("article:publisher", &self.owner);
        if let Some(app_id) = self.facebook_app_id.as_deref() {
            tags.property("fb:app_id", app_id);
        }

        tags.name("twitter:card", "summary");
        tags.name("twitter:title", &preview.title);
        tags.name("twitter:description", &preview.description);
        tags.name("twitter:image", &preview.image);
        if let Some(handle) = self.twitter_id.as_deref() {
            tags.name("twitter:site", &twitter_handle(handle));
        }
        if !self.domain.is_empty() {
            tags.name("twitter:domain", &self.domain);
        }
        tags.finish()
    }

    /// Turns a worker result into the page stored in the cache.
    pub fn finish(
        &self,
        key: &RequestKey,
        fragment: RenderedFragment,
        published: OffsetDateTime,
    ) -> RenderedPage {
        let preview = PagePreview::extract(&fragment.title, &fragment.inner_html, &self.logo_url);
        let metadata = self.article_markup(key.as_str(), &preview, published);
        RenderedPage {
            inner_html: fragment.inner_html,
            metadata,
        }
    }
}

fn twitter_handle(id: &str) -> String {
    if id.starts_with('@') {
        id.to_string()
    } else {
        format!("@{}", id)
    }
}

#[derive(Default)]
struct MetaTags {
    out: String,
}

impl MetaTags {
    fn property(&mut self, property: &str, content: &str) {
        self.push("property", property, content);
    }

    fn name(&mut self, name: &str, content: &str) {
        self.push("name", name, content);
    }

    fn push(&mut self, attr: &str, key: &str, content: &str) {
        if content.is_empty() {
            return;
        }
        self.out.push_str(&format!(
            "<meta {}=\"{}\" content=\"{}\">\n",
            attr,
            key,
            escape_attr(content)
        ));
    }

    fn finish(self) -> String {
        self.out
    }
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGO: &str = "https://example.com/logo.png";

    fn profile() -> SiteProfile {
        SiteProfile {
            domain: "example.com".to_string(),
            site_name: "Example".to_string(),
            owner: "Jo Writer".to_string(),
            logo_url: LOGO.to_string(),
            twitter_id: Some("example".to_string()),
            facebook_app_id: None,
        }
    }

    #[test]
    fn long_text_is_truncated_to_limit() {
        let html = format!("<p>{}</p>", "a".repeat(500));
        let preview = PagePreview::extract("T", &html, LOGO);
        assert_eq!(preview.description.chars().count(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let text = "é".repeat(200);
        let cut = truncate_chars(&text, DESCRIPTION_LIMIT);
        assert_eq!(cut.chars().count(), DESCRIPTION_LIMIT);
        assert_eq!(truncate_chars("short", DESCRIPTION_LIMIT), "short");
    }

    #[test]
    fn description_collapses_whitespace_and_skips_scripts() {
        let html = "<h1> Hello </h1>\n<p>big\n\n  world</p><script>var x = 1;</script>";
        let preview = PagePreview::extract("T", html, LOGO);
        assert_eq!(preview.description, "Hello big world");
    }

    #[test]
    fn inline_markup_does_not_split_words() {
        let html = r#"<p>un<b>believ</b>able, <a href="/x">click</a>!</p><p>next</p>"#;
        let preview = PagePreview::extract("T", html, LOGO);
        assert_eq!(preview.description, "unbelievable, click! next");
    }

    #[test]
    fn image_falls_back_to_default() {
        let preview = PagePreview::extract("T", "<p>no pictures here</p>", LOGO);
        assert_eq!(preview.image, LOGO);
    }

    #[test]
    fn image_element_source_is_used() {
        let preview = PagePreview::extract("T", r#"<div><image src="/x.png"></div>"#, LOGO);
        assert_eq!(preview.image, "/x.png");

        let preview = PagePreview::extract("T", r#"<img alt="a"><img src="/y.jpg">"#, LOGO);
        assert_eq!(preview.image, "/y.jpg");
    }

    #[test]
    fn markup_contains_article_tags() {
        let preview = PagePreview {
            title: "Hello \"World\"".to_string(),
            description: "A <b> description".to_string(),
            image: "/x.png".to_string(),
        };
        let markup =
            profile().article_markup("http://example.com/a", &preview, OffsetDateTime::UNIX_EPOCH);

        assert!(markup.contains(r#"<meta property="og:type" content="article">"#));
        assert!(markup.contains(r#"<meta property="og:url" content="http://example.com/a">"#));
        assert!(markup.contains(r#"content="Hello &quot;World&quot;""#));
        assert!(markup.contains(r#"content="A &lt;b&gt; description""#));
        assert!(markup.contains(r#"<meta property="og:image" content="/x.png">"#));
        assert!(markup.contains(
            r#"<meta property="article:published_time" content="1970-01-01T00:00:00Z">"#
        ));
        assert!(markup.contains(r#"<meta name="twitter:site" content="@example">"#));
        assert!(!markup.contains("fb:app_id"));
    }

    #[test]
    fn finish_keeps_fragment_and_builds_metadata() {
        let key = RequestKey::parse("http://example.com/posts/1").unwrap();
        let fragment = RenderedFragment {
            title: "Post".to_string(),
            inner_html: "<p>Body text</p>".to_string(),
        };
        let page = profile().finish(&key, fragment, OffsetDateTime::UNIX_EPOCH);

        assert_eq!(page.inner_html, "<p>Body text</p>");
        assert!(page.metadata.contains(r#"content="Body text""#));
        assert!(page.metadata.contains(&format!(r#"content="{}""#, LOGO)));
    }
}
