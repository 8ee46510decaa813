//! Pulls markup, styles and scripts out of free-form model replies and wraps
//! the markup in the fixed responsive page shell.

use std::sync::LazyLock;

use regex::Regex;

static RE_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body(?:\s[^>]*)?>(.*)</body>").unwrap());
static RE_HTML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<html(?:\s[^>]*)?>(.*)</html>").unwrap());
static RE_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<head(?:\s[^>]*)?>.*?</head>").unwrap());
static RE_FENCE_HTML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```html[^\n]*\n(.*?)```").unwrap());
static RE_FENCE_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*\n(.*?)```").unwrap());
static RE_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style(?:\s[^>]*)?>(.*?)</style>").unwrap());
static RE_FENCE_CSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```css[^\n]*\n(.*?)```").unwrap());
static RE_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script(\s[^>]*)?>(.*?)</script>").unwrap());
static RE_FENCE_JS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:javascript|js)[^\n]*\n(.*?)```").unwrap());
static RE_SRC_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bsrc\s*=\s*["']?([^"'\s>]+)"#).unwrap());

pub const STYLESHEET_FILE: &str = "styles.css";
pub const SCRIPT_FILE: &str = "script.js";

const DOCUMENT_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Generated UI</title>
    <script src="https://cdn.tailwindcss.com"></script>
    <link rel="stylesheet" href="styles.css">
    <style>
        *, *::before, *::after { box-sizing: border-box; }
        html { -webkit-text-size-adjust: 100%; }
        body {
            margin: 0;
            font-size: clamp(14px, 2.5vw, 16px);
            line-height: 1.5;
        }
        h1 { font-size: clamp(1.75rem, 5vw, 2.5rem); }
        h2 { font-size: clamp(1.5rem, 4vw, 2rem); }
        h3 { font-size: clamp(1.25rem, 3vw, 1.5rem); }
        img, video { max-width: 100%; height: auto; }
        button, a, input, select, textarea, [role="button"] {
            min-height: 44px;
            min-width: 44px;
            touch-action: manipulation;
        }
        @media (max-width: 640px) {
            .container { padding-left: 1rem; padding-right: 1rem; }
        }
        @media (min-width: 641px) and (max-width: 1024px) {
            .container { padding-left: 2rem; padding-right: 2rem; }
        }
        @media (min-width: 1025px) {
            .container { max-width: 1200px; margin-left: auto; margin-right: auto; }
        }
    </style>
</head>
<body>
"#;

const DOCUMENT_TAIL: &str = "</body>\n</html>\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedCode {
    pub html: String,
    pub css: String,
    pub js: Option<String>,
    /// `<script src>` tags found outside the extracted fragment, such as
    /// libraries loaded from a document head.
    pub external_scripts: Vec<String>,
}

/// Splits a model reply into markup, styles and scripts.
///
/// When the reply carries an html fence, everything is read from inside that
/// block so prose around it can mention tags freely. Otherwise tags are
/// matched across the whole reply, then a plain fence is tried, and finally
/// the reply is used verbatim.
pub fn extract_code(response: &str) -> ExtractedCode {
    let scope = code_scope(response);
    let fragment = document_inner(scope).unwrap_or_else(|| scope.to_string());
    let html = strip_embedded_assets(&fragment).trim().to_string();

    ExtractedCode {
        external_scripts: external_scripts(scope, &html),
        css: extract_css(scope, response),
        js: extract_js(scope, response),
        html,
    }
}

fn code_scope(response: &str) -> &str {
    if let Some(block) = RE_FENCE_HTML.captures(response).and_then(|caps| caps.get(1)) {
        return block.as_str();
    }
    if RE_BODY.is_match(response) || RE_HTML.is_match(response) {
        return response;
    }
    RE_FENCE_PLAIN
        .captures(response)
        .and_then(|caps| caps.get(1))
        .map_or(response, |block| block.as_str())
}

/// Inner markup of a `<body>`, or of an `<html>` without a body.
fn document_inner(text: &str) -> Option<String> {
    if let Some(caps) = RE_BODY.captures(text) {
        return Some(caps[1].to_string());
    }
    RE_HTML
        .captures(text)
        .map(|caps| RE_HEAD.replace_all(&caps[1], "").into_owned())
}

fn script_src(attrs: Option<regex::Match<'_>>) -> Option<String> {
    let attrs = attrs?;
    RE_SRC_ATTR
        .captures(attrs.as_str())
        .map(|caps| caps[1].to_string())
}

fn extract_css(scope: &str, response: &str) -> String {
    let inline = RE_STYLE
        .captures_iter(scope)
        .map(|caps| caps[1].trim().to_string())
        .filter(|css| !css.is_empty())
        .collect::<Vec<_>>();
    if !inline.is_empty() {
        return inline.join("\n\n");
    }

    RE_FENCE_CSS
        .captures_iter(response)
        .map(|caps| caps[1].trim().to_string())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn extract_js(scope: &str, response: &str) -> Option<String> {
    let inline = RE_SCRIPT
        .captures_iter(scope)
        .filter(|caps| script_src(caps.get(1)).is_none())
        .map(|caps| caps[2].trim().to_string())
        .filter(|js| !js.is_empty())
        .collect::<Vec<_>>();
    if !inline.is_empty() {
        return Some(inline.join("\n\n"));
    }

    let fenced = RE_FENCE_JS
        .captures_iter(response)
        .map(|caps| caps[1].trim().to_string())
        .filter(|js| !js.is_empty())
        .collect::<Vec<_>>();
    (!fenced.is_empty()).then(|| fenced.join("\n\n"))
}

/// External script tags the fragment lost, minus what the page shell
/// already loads.
fn external_scripts(scope: &str, fragment: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for caps in RE_SCRIPT.captures_iter(scope) {
        let Some(src) = script_src(caps.get(1)) else {
            continue;
        };
        let tag = caps[0].trim().to_string();
        let shell_loads = DOCUMENT_HEAD.contains(&format!("src=\"{src}\""));
        if shell_loads || fragment.contains(&tag) || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    tags
}

/// Drops `<style>` blocks and inline scripts; `<script src>` tags stay put.
fn strip_embedded_assets(fragment: &str) -> String {
    let without_styles = RE_STYLE.replace_all(fragment, "");
    RE_SCRIPT
        .replace_all(&without_styles, |caps: &regex::Captures<'_>| {
            if script_src(caps.get(1)).is_some() {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Wraps an extracted fragment in the fixed page shell.
pub fn assemble_document(code: &ExtractedCode) -> String {
    let mut document = String::with_capacity(DOCUMENT_HEAD.len() + code.html.len() + 128);
    document.push_str(DOCUMENT_HEAD);
    document.push_str(&code.html);
    document.push('\n');
    for tag in &code.external_scripts {
        document.push_str(tag);
        document.push('\n');
    }
    if code.js.is_some() {
        document.push_str(&format!("<script src=\"{SCRIPT_FILE}\"></script>\n"));
    }
    document.push_str(DOCUMENT_TAIL);
    document
}

/// True when the reply carries markup beyond prose: a document, a body, or
/// a fenced html block.
pub fn contains_code(response: &str) -> bool {
    RE_BODY.is_match(response) || RE_HTML.is_match(response) || RE_FENCE_HTML.is_match(response)
}

/// Self-contained document with styles and scripts inlined, used when the
/// current markup is shown back to the model.
pub fn inline_document(code: &ExtractedCode) -> String {
    let mut document = String::from("<!DOCTYPE html>\n<html>\n<head>\n");
    for tag in &code.external_scripts {
        document.push_str(tag);
        document.push('\n');
    }
    if !code.css.is_empty() {
        document.push_str(&format!("<style>\n{}\n</style>\n", code.css));
    }
    document.push_str("</head>\n<body>\n");
    document.push_str(&code.html);
    document.push('\n');
    if let Some(js) = &code.js {
        document.push_str(&format!("<script>\n{js}\n</script>\n"));
    }
    document.push_str(DOCUMENT_TAIL);
    document
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document_yields_body_fragment() {
        let code = extract_code("<html><body><p>Hi</p></body></html>");
        assert_eq!(code.html, "<p>Hi</p>");

        let document = assemble_document(&code);
        assert!(document.starts_with(DOCUMENT_HEAD));
        assert!(document.contains("<p>Hi</p>"));
        assert!(document.contains(r#"name="viewport""#));
        assert!(document.contains("cdn.tailwindcss.com"));
        assert!(document.contains(r#"href="styles.css""#));
        assert!(!document.contains(SCRIPT_FILE));
    }

    #[test]
    fn unrecognized_text_is_used_verbatim() {
        let text = "Sorry, I can only describe this design in words.";
        let code = extract_code(text);
        assert_eq!(code.html, text);
        assert_eq!(code.css, "");
        assert_eq!(code.js, None);
    }

    #[test]
    fn styles_and_scripts_are_split_out() {
        let reply = r#"Here you go:
<!DOCTYPE html>
<html>
<head><style>.card { color: red; }</style></head>
<body>
  <div class="card">Card</div>
  <script src="https://cdn.example.com/lib.js"></script>
  <script>document.querySelector('.card').addEventListener('click', () => {});</script>
</body>
</html>"#;
        let code = extract_code(reply);
        assert_eq!(
            code.html,
            "<div class=\"card\">Card</div>\n  <script src=\"https://cdn.example.com/lib.js\"></script>"
        );
        assert!(code.external_scripts.is_empty());
        assert_eq!(code.css, ".card { color: red; }");
        assert_eq!(
            code.js.as_deref(),
            Some("document.querySelector('.card').addEventListener('click', () => {});")
        );
        let document = assemble_document(&code);
        assert!(document.contains(r#"<script src="script.js"></script>"#));
        assert!(document.contains("cdn.example.com/lib.js"));
    }

    #[test]
    fn prose_around_fence_does_not_leak_into_code() {
        let critique = "MATCH: NO\nThe inline <style> block uses the wrong heading colour.\n```html\n<html><head><style>h1{color:red}</style></head><body><h1>Title</h1></body></html>\n```";
        let code = extract_code(critique);
        assert_eq!(code.css, "h1{color:red}");
        assert_eq!(code.html, "<h1>Title</h1>");

        let reply = "```html\n<html><body><h1>X</h1></body></html>\n```\nI placed the script right before the closing </body> tag.";
        let code = extract_code(reply);
        assert_eq!(code.html, "<h1>X</h1>");
        assert_eq!(code.css, "");
        assert_eq!(code.js, None);
    }

    #[test]
    fn library_scripts_survive_extraction() {
        let reply = r#"<body><canvas id=c></canvas><script src="https://cdn.jsdelivr.net/npm/chart.js"></script><script>new Chart(c)</script></body>"#;
        let code = extract_code(reply);
        assert_eq!(
            code.html,
            r#"<canvas id=c></canvas><script src="https://cdn.jsdelivr.net/npm/chart.js"></script>"#
        );
        assert_eq!(code.js.as_deref(), Some("new Chart(c)"));

        let document = assemble_document(&code);
        let library = document.find("npm/chart.js").expect("library kept");
        let script = document.find(r#"src="script.js""#).expect("script linked");
        assert!(library < script);
    }

    #[test]
    fn head_libraries_are_carried_without_duplicating_the_shell() {
        let reply = r#"<html><head><script src="https://cdn.jsdelivr.net/npm/chart.js"></script><script src="https://cdn.tailwindcss.com"></script></head><body><canvas></canvas></body></html>"#;
        let code = extract_code(reply);
        assert_eq!(code.html, "<canvas></canvas>");
        assert_eq!(
            code.external_scripts,
            vec![r#"<script src="https://cdn.jsdelivr.net/npm/chart.js"></script>"#.to_string()]
        );
        let document = assemble_document(&code);
        assert_eq!(document.matches("cdn.tailwindcss.com").count(), 1);
        assert!(document.contains("npm/chart.js"));
    }

    #[test]
    fn fenced_blocks_are_used_when_no_tags() {
        let reply = "```html\n<main>Hello</main>\n```\n\n```css\nmain { margin: 0; }\n```\n\n```javascript\nconsole.log(1);\n```";
        let code = extract_code(reply);
        assert_eq!(code.html, "<main>Hello</main>");
        assert_eq!(code.css, "main { margin: 0; }");
        assert_eq!(code.js.as_deref(), Some("console.log(1);"));
    }

    #[test]
    fn inline_document_round_trips_through_extraction() {
        let code = ExtractedCode {
            html: "<nav>Menu</nav>".into(),
            css: "nav { display: flex; }".into(),
            js: Some("console.log('nav');".into()),
            external_scripts: vec![
                r#"<script src="https://cdn.jsdelivr.net/npm/chart.js"></script>"#.into(),
            ],
        };
        let document = inline_document(&code);
        assert!(contains_code(&document));
        assert_eq!(extract_code(&document), code);
        assert!(!contains_code("The layout looks right."));
    }

    #[test]
    fn html_without_body_drops_head() {
        let code = extract_code("<html><head><title>x</title></head><section>Only</section></html>");
        assert_eq!(code.html, "<section>Only</section>");
    }
}
