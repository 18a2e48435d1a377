//! Element locator: turns a configured selector into a page lookup.
//!
//! Lookups run inside the page and tag the hit with a marker attribute, so
//! follow-up actions can address it with a plain CSS selector.

use regex::Regex;

use crate::models::SelectorType;

/// Attribute set on the element a lookup resolved to.
pub const MARKER_ATTRIBUTE: &str = "data-signin-target";

/// Elements considered clickable by pattern lookups.
pub const CLICKABLE_SELECTOR: &str =
    r#"a, button, input[type="button"], input[type="submit"], [role="button"], [onclick]"#;

/// Strategy + selector used to find an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    /// First node in document order
    XPath(String),
    /// Regex over the visible text of clickable elements
    Pattern(String),
    /// Arbitrary page expression. Executes untrusted code in the page.
    UnsafeExpression(String),
}

/// How a locator is resolved against a page.
#[derive(Debug, Clone)]
pub enum LookupPlan {
    /// Script that finds and marks the element, evaluating to `true` on a hit
    Script(String),
    /// Match the regex against `clickable_texts_script()` output, then mark by index
    Pattern(Regex),
    /// Selector can never match (e.g. a malformed pattern)
    Invalid,
}

impl Locator {
    pub fn new(kind: SelectorType, selector: &str) -> Self {
        let selector = selector.to_string();
        match kind {
            SelectorType::Css => Locator::Css(selector),
            SelectorType::Xpath => Locator::XPath(selector),
            SelectorType::Pattern => Locator::Pattern(selector),
            SelectorType::Expression => Locator::UnsafeExpression(selector),
        }
    }

    pub fn kind(&self) -> SelectorType {
        match self {
            Locator::Css(_) => SelectorType::Css,
            Locator::XPath(_) => SelectorType::Xpath,
            Locator::Pattern(_) => SelectorType::Pattern,
            Locator::UnsafeExpression(_) => SelectorType::Expression,
        }
    }

    pub fn selector(&self) -> &str {
        match self {
            Locator::Css(s) | Locator::XPath(s) | Locator::Pattern(s) | Locator::UnsafeExpression(s) => s,
        }
    }

    pub fn is_unsafe(&self) -> bool {
        matches!(self, Locator::UnsafeExpression(_))
    }

    /// Build the lookup for this locator, tagging hits with `marker`.
    pub fn plan(&self, marker: &str) -> LookupPlan {
        // JSON encoding for safe string escaping
        let quoted = json_str(self.selector());
        let find = match self {
            Locator::Css(_) => format!("document.querySelector({quoted})"),
            Locator::XPath(_) => format!(
                "document.evaluate({quoted}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue"
            ),
            Locator::UnsafeExpression(_) => format!("(new Function('return ' + {quoted}))()"),
            Locator::Pattern(pattern) => {
                return match Regex::new(pattern) {
                    Ok(regex) => LookupPlan::Pattern(regex),
                    Err(e) => {
                        tracing::warn!("Pattern '{}' cannot be compiled, site will not match: {}", pattern, e);
                        LookupPlan::Invalid
                    }
                };
            }
        };
        LookupPlan::Script(mark_script(&find, marker))
    }
}

/// Script evaluating to the trimmed text of every clickable element, in document order.
pub fn clickable_texts_script() -> String {
    format!(
        r#"(() => Array.from(document.querySelectorAll({})).map(el =>
            (el.textContent || el.value || el.getAttribute('title') || '').trim()))()"#,
        json_str(CLICKABLE_SELECTOR)
    )
}

/// Script marking the `index`-th clickable element.
pub fn mark_clickable_script(index: usize, marker: &str) -> String {
    mark_script(
        &format!(
            "document.querySelectorAll({})[{}]",
            json_str(CLICKABLE_SELECTOR),
            index
        ),
        marker,
    )
}

/// Index of the first text the pattern matches.
pub fn first_pattern_match(regex: &Regex, texts: &[String]) -> Option<usize> {
    texts.iter().position(|text| regex.is_match(text.trim()))
}

/// CSS selector addressing a marked element.
pub fn marker_selector(marker: &str) -> String {
    format!("[{}={}]", MARKER_ATTRIBUTE, json_str(marker))
}

fn mark_script(find: &str, marker: &str) -> String {
    format!(
        r#"(() => {{
            try {{
                const el = {find};
                if (!(el instanceof Element)) return false;
                el.setAttribute({attr}, {marker});
                return true;
            }} catch (_) {{
                return false;
            }}
        }})()"#,
        find = find,
        attr = json_str(MARKER_ATTRIBUTE),
        marker = json_str(marker),
    )
}

fn json_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
