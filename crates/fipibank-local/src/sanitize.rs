//! HTML sanitization with a degraded regex fallback.

use fipibank_core::{Result, Sanitizer};
use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid regex"));
static EVENT_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid regex")
});

/// Allow-list sanitizer backed by `ammonia`. `class` is kept so formula markup survives.
#[cfg(feature = "ammonia")]
#[derive(Debug, Default, Clone, Copy)]
pub struct AmmoniaSanitizer;

#[cfg(feature = "ammonia")]
impl Sanitizer for AmmoniaSanitizer {
    fn name(&self) -> &'static str {
        "ammonia"
    }

    fn sanitize(&self, html: &str) -> Result<String> {
        Ok(ammonia::Builder::default()
            .add_generic_attributes(&["class"])
            .clean(html)
            .to_string())
    }
}

/// Strips `<script>`/`<style>` blocks and inline `on*` handlers. Not a real sanitizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexFallbackSanitizer;

impl Sanitizer for RegexFallbackSanitizer {
    fn name(&self) -> &'static str {
        "regex-fallback"
    }

    fn sanitize(&self, html: &str) -> Result<String> {
        Ok(strip_unsafe(html))
    }
}

pub fn strip_unsafe(html: &str) -> String {
    let s = SCRIPT_BLOCK.replace_all(html, "");
    let s = STYLE_BLOCK.replace_all(&s, "");
    EVENT_ATTR.replace_all(&s, "").into_owned()
}

/// The best sanitizer compiled into this build.
pub fn default_sanitizer() -> Box<dyn Sanitizer> {
    #[cfg(feature = "ammonia")]
    {
        Box::new(AmmoniaSanitizer)
    }
    #[cfg(not(feature = "ammonia"))]
    {
        tracing::warn!("built without the `ammonia` feature; using the regex fallback sanitizer");
        Box::new(RegexFallbackSanitizer)
    }
}

/// Run `sanitizer`, degrading to [`strip_unsafe`] with a warning when it fails.
pub fn sanitize_or_fallback(sanitizer: &dyn Sanitizer, html: &str) -> String {
    match sanitizer.sanitize(html) {
        Ok(clean) => clean,
        Err(e) => {
            tracing::warn!(sanitizer = sanitizer.name(), error = %e, "sanitizer failed; using regex fallback");
            strip_unsafe(html)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fipibank_core::Error;

    struct Broken;

    impl Sanitizer for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn sanitize(&self, _html: &str) -> Result<String> {
            Err(Error::Sanitize("not installed".to_string()))
        }
    }

    #[test]
    fn fallback_strips_scripts_styles_and_handlers() {
        let dirty = r#"<p onclick="steal()">Найдите <b>x</b></p><SCRIPT type="x">alert(1)</script><style>p{}</style>"#;
        let clean = strip_unsafe(dirty);
        assert_eq!(clean, "<p>Найдите <b>x</b></p>");
    }

    #[test]
    fn failing_sanitizer_degrades_to_fallback() {
        let out = sanitize_or_fallback(&Broken, "<p onload='x()'>1</p><script>x</script>");
        assert_eq!(out, "<p>1</p>");
    }

    #[cfg(feature = "ammonia")]
    #[test]
    fn ammonia_keeps_images_and_class() {
        let s = AmmoniaSanitizer
            .sanitize(r#"<p class="f">a<img src="/img/1.png" onerror="x()"></p><script>1</script>"#)
            .unwrap();
        assert!(s.contains(r#"class="f""#));
        assert!(s.contains(r#"src="/img/1.png""#));
        assert!(!s.contains("onerror"));
        assert!(!s.contains("script"));
    }
}
