//! Browser side of live reload: the client script and its injection.

/// Route serving the reload client.
pub const RELOAD_SCRIPT_PATH: &str = "/__kiln/reload.js";

/// Tag injected into HTML pages.
pub const RELOAD_SCRIPT_TAG: &str = r#"<script src="/__kiln/reload.js"></script>"#;

const RELOAD_CLIENT: &str = include_str!("../assets/reload-client.js");
const WS_PATH_PLACEHOLDER: &str = "__KILN_WS_PATH__";

/// Reload client source wired to `ws_path`.
pub fn reload_client_script(ws_path: &str) -> String {
    let escaped = ws_path.replace('\\', "\\\\").replace('"', "\\\"");
    RELOAD_CLIENT.replace(WS_PATH_PLACEHOLDER, &escaped)
}

/// Whether a `Content-Type` value denotes an HTML document.
pub fn is_html(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("text/html")
}

/// Inject the reload script tag into an HTML document.
///
/// The tag goes before the last `</body>`, or at the end when there is none.
/// Content that is not HTML, or not UTF-8, is returned unchanged.
pub fn inject_reload_script(content: &[u8], content_type: &str) -> Vec<u8> {
    if !is_html(content_type) {
        return content.to_vec();
    }

    let Ok(html) = std::str::from_utf8(content) else {
        return content.to_vec();
    };
    if html.contains(RELOAD_SCRIPT_TAG) {
        return content.to_vec();
    }

    if let Some(pos) = rfind_ignore_case(&html, "</body>") {
        let mut result = String::with_capacity(html.len() + RELOAD_SCRIPT_TAG.len() + 4);
        result.push_str(&html[..pos]);
        result.push_str(RELOAD_SCRIPT_TAG);
        result.push('\n');
        result.push_str(&html[pos..]);
        return result.into_bytes();
    }

    let mut result = html.to_owned();
    result.push('\n');
    result.push_str(RELOAD_SCRIPT_TAG);
    result.into_bytes()
}

fn rfind_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets stable.
    haystack.to_ascii_lowercase().rfind(needle)
}
