//! Preview handlers for Component and Kit mode.
//!
//! The dev server only needs one thing from a preview: turn a request path
//! into a response. [`PreviewHandler`] is that seam. The built-in handlers
//! render component templates with minijinja and serve static files from the
//! project root; a handler that failed to build is replaced by an
//! [`ErrorHandler`] that shows the failure on every request.
//!
//! Manifests and templates are re-read per request, so edits show up on the
//! next reload without rebuilding the handler.

use crate::error::{DevError, Result, ResultExt};
use crate::mode::{COMPONENT_MANIFEST, COMPONENT_TEMPLATE, KIT_MANIFEST, Mode};
use crate::reload;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Turns request paths into responses for a preview mode.
#[async_trait]
pub trait PreviewHandler: Send + Sync {
    /// Respond to a GET of `path` (always starts with `/`).
    async fn handle(&self, path: &str) -> Response;
}

/// `component.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ComponentManifest {
    /// Display name
    pub name: Option<String>,
    /// Template path relative to the component directory
    pub template: Option<String>,
    /// Sample values for template placeholders
    pub props: BTreeMap<String, serde_json::Value>,
}

impl ComponentManifest {
    /// Read the manifest in `dir`, or defaults when there is none.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(COMPONENT_MANIFEST);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).with_path(&path)?;
        serde_yaml::from_str(&content).map_err(|e| DevError::ModeInit {
            mode: Mode::Component,
            message: format!("invalid {}: {}", path.display(), e),
        })
    }

    fn template_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.template.as_deref().unwrap_or(COMPONENT_TEMPLATE))
    }
}

/// `kit.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KitManifest {
    /// Display name
    pub name: Option<String>,
    /// Short description shown on the index page
    pub description: Option<String>,
    /// Component directories, relative to the kit root
    pub components: Vec<String>,
}

impl KitManifest {
    /// Read the manifest in `dir`, or defaults when there is none.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(KIT_MANIFEST);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).with_path(&path)?;
        serde_yaml::from_str(&content).map_err(|e| DevError::ModeInit {
            mode: Mode::Kit,
            message: format!("invalid {}: {}", path.display(), e),
        })
    }
}

/// Previews a single component.
#[derive(Debug, Clone)]
pub struct ComponentPreview {
    root: PathBuf,
    live_reload: bool,
}

impl ComponentPreview {
    /// Build a preview for the component at `root`.
    ///
    /// Fails when the manifest does not parse or the template is missing.
    pub fn new(root: impl Into<PathBuf>, live_reload: bool) -> Result<Self> {
        let root = root.into();
        render_component(&root).map_err(|e| mode_init(Mode::Component, e))?;
        Ok(Self { root, live_reload })
    }
}

#[async_trait]
impl PreviewHandler for ComponentPreview {
    async fn handle(&self, path: &str) -> Response {
        if path == "/" || path == "/index.html" {
            return match render_component(&self.root) {
                Ok(html) => html_response(StatusCode::OK, html, self.live_reload),
                Err(e) => error_response(Mode::Component, &e.to_string(), self.live_reload),
            };
        }
        serve_static(&self.root, path, self.live_reload).await
    }
}

/// Previews a kit: an index page plus one preview per component.
#[derive(Debug, Clone)]
pub struct KitPreview {
    root: PathBuf,
    live_reload: bool,
}

impl KitPreview {
    /// Build a preview for the kit at `root`.
    pub fn new(root: impl Into<PathBuf>, live_reload: bool) -> Result<Self> {
        let root = root.into();
        let manifest = KitManifest::load(&root).map_err(|e| mode_init(Mode::Kit, e))?;
        for name in &manifest.components {
            if safe_join(&root, name).is_none_or(|dir| !dir.is_dir()) {
                return Err(DevError::ModeInit {
                    mode: Mode::Kit,
                    message: format!("component directory '{}' listed in {} does not exist", name, KIT_MANIFEST),
                });
            }
        }
        Ok(Self { root, live_reload })
    }

    /// Component directories, from the manifest or discovered.
    pub fn components(&self) -> Result<Vec<String>> {
        let manifest = KitManifest::load(&self.root)?;
        if !manifest.components.is_empty() {
            return Ok(manifest.components);
        }

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let dir = entry.path();
            let is_component = dir.join(COMPONENT_MANIFEST).is_file()
                || dir.join(COMPONENT_TEMPLATE).is_file();
            if dir.is_dir() && is_component {
                found.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        found.sort();
        Ok(found)
    }

    fn render_index(&self) -> Result<String> {
        let manifest = KitManifest::load(&self.root)?;
        let title = manifest
            .name
            .clone()
            .unwrap_or_else(|| dir_name(&self.root));

        let mut items = String::new();
        for name in self.components()? {
            items.push_str(&format!(
                "    <li><a href=\"/{0}/\">{0}</a></li>\n",
                html_escape(&name)
            ));
        }
        let description = manifest
            .description
            .as_deref()
            .map(|d| format!("  <p>{}</p>\n", html_escape(d)))
            .unwrap_or_default();

        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head>\n  <meta charset=\"utf-8\">\n  <title>{title}</title>\n</head>\n<body>\n  <h1>{title}</h1>\n{description}  <ul>\n{items}  </ul>\n</body>\n</html>\n",
            title = html_escape(&title),
        ))
    }
}

#[async_trait]
impl PreviewHandler for KitPreview {
    async fn handle(&self, path: &str) -> Response {
        if path == "/" || path == "/index.html" {
            return match self.render_index() {
                Ok(html) => html_response(StatusCode::OK, html, self.live_reload),
                Err(e) => error_response(Mode::Kit, &e.to_string(), self.live_reload),
            };
        }

        // `/<component>/` previews that component.
        let trimmed = path.trim_matches('/');
        if !trimmed.is_empty() && !trimmed.contains('/') && path.ends_with('/') {
            if let Some(dir) = safe_join(&self.root, trimmed) {
                if dir.is_dir() {
                    return match render_component(&dir) {
                        Ok(html) => html_response(StatusCode::OK, html, self.live_reload),
                        Err(e) => error_response(Mode::Kit, &e.to_string(), self.live_reload),
                    };
                }
            }
        }

        serve_static(&self.root, path, self.live_reload).await
    }
}

/// Answers every request with the error that prevented a mode from starting.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    mode: Mode,
    message: String,
    live_reload: bool,
}

impl ErrorHandler {
    /// Handler reporting `error` for `mode`.
    pub fn new(mode: Mode, error: &DevError, live_reload: bool) -> Self {
        Self {
            mode,
            message: error.to_string(),
            live_reload,
        }
    }

    /// The reported message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
impl PreviewHandler for ErrorHandler {
    async fn handle(&self, _path: &str) -> Response {
        error_response(self.mode, &self.message, self.live_reload)
    }
}

fn mode_init(mode: Mode, err: DevError) -> DevError {
    match err {
        DevError::ModeInit { .. } => err,
        other => DevError::ModeInit {
            mode,
            message: other.to_string(),
        },
    }
}

fn render_component(dir: &Path) -> Result<String> {
    let manifest = ComponentManifest::load(dir)?;
    let template_path = manifest.template_path(dir);
    let source = std::fs::read_to_string(&template_path).map_err(|e| DevError::ModeInit {
        mode: Mode::Component,
        message: format!("cannot read template {}: {}", template_path.display(), e),
    })?;

    let env = minijinja::Environment::new();
    let body = env
        .render_str(&source, &manifest.props)
        .map_err(|e| DevError::ModeInit {
            mode: Mode::Component,
            message: format!("failed to render {}: {}", template_path.display(), e),
        })?;

    if body.to_ascii_lowercase().contains("<html") {
        return Ok(body);
    }

    let title = manifest.name.unwrap_or_else(|| dir_name(dir));
    Ok(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n  <meta charset=\"utf-8\">\n  <title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        html_escape(&title),
        body
    ))
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "preview".to_string())
}

/// Join a URL path onto `root`, refusing anything that escapes it.
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim_start_matches('/'));
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

async fn serve_static(root: &Path, path: &str, live_reload: bool) -> Response {
    let Some(file_path) = safe_join(root, path) else {
        return not_found(path);
    };

    let file_path = if file_path.is_dir() {
        file_path.join("index.html")
    } else {
        file_path
    };
    if !file_path.is_file() {
        return not_found(path);
    }

    match tokio::fs::read(&file_path).await {
        Ok(content) => {
            let content_type = determine_content_type(&file_path);
            let content = if live_reload {
                reload::inject_reload_script(&content, content_type)
            } else {
                content
            };
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from(content),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(path = %file_path.display(), error = %e, "failed to read file");
            not_found(path)
        }
    }
}

fn not_found(path: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("File not found: {}", path),
    )
        .into_response()
}

fn html_response(status: StatusCode, html: String, live_reload: bool) -> Response {
    let body = if live_reload {
        reload::inject_reload_script(html.as_bytes(), "text/html")
    } else {
        html.into_bytes()
    };
    (
        status,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from(body),
    )
        .into_response()
}

fn error_response(mode: Mode, message: &str, live_reload: bool) -> Response {
    tracing::debug!(%mode, %message, "serving preview error");
    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n  <meta charset=\"utf-8\">\n  <title>{mode} preview error</title>\n  <style>\n    body {{ background: #1e1e1e; color: #f48771; font-family: ui-monospace, monospace; padding: 2rem; }}\n    pre {{ white-space: pre-wrap; }}\n  </style>\n</head>\n<body>\n  <h1>{mode} preview failed</h1>\n  <pre>{}</pre>\n</body>\n</html>\n",
        html_escape(message),
    );
    html_response(StatusCode::INTERNAL_SERVER_ERROR, html, live_reload)
}

/// HTML-escape a string.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Determine content type from file extension.
pub fn determine_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match extension.as_str() {
        "wasm" => "application/wasm",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape("<a href=\"x\">'&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_safe_join_rejects_escape() {
        let root = Path::new("/srv/kit");
        assert_eq!(safe_join(root, "/a/b.css"), Some(root.join("a/b.css")));
        assert_eq!(safe_join(root, "/../etc/passwd"), None);
        assert_eq!(safe_join(root, "/a/../../x"), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(determine_content_type(Path::new("a.CSS")), "text/css");
        assert_eq!(determine_content_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(determine_content_type(Path::new("a")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_component_renders_props() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(COMPONENT_MANIFEST),
            "name: Button\nprops:\n  label: Save\n",
        )
        .unwrap();
        fs::write(
            temp.path().join(COMPONENT_TEMPLATE),
            "<button>{{ label }}</button>",
        )
        .unwrap();

        let preview = ComponentPreview::new(temp.path(), true).unwrap();
        let response = preview.handle("/").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert!(body.contains("<button>Save</button>"));
        assert!(body.contains("<title>Button</title>"));
        assert!(body.contains(reload::RELOAD_SCRIPT_TAG));
    }

    #[test]
    fn test_component_missing_template_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(COMPONENT_MANIFEST), "name: Card\n").unwrap();

        let err = ComponentPreview::new(temp.path(), false).unwrap_err();
        assert!(matches!(err, DevError::ModeInit { mode: Mode::Component, .. }));
    }

    #[test]
    fn test_component_bad_manifest_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(COMPONENT_MANIFEST), "props: [unclosed\n").unwrap();
        fs::write(temp.path().join(COMPONENT_TEMPLATE), "<p></p>").unwrap();

        assert!(ComponentPreview::new(temp.path(), false).is_err());
    }

    #[tokio::test]
    async fn test_component_serves_static() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(COMPONENT_TEMPLATE), "<p>x</p>").unwrap();
        fs::write(temp.path().join("style.css"), "p { color: red }").unwrap();

        let preview = ComponentPreview::new(temp.path(), false).unwrap();
        let response = preview.handle("/style.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");

        let response = preview.handle("/missing.css").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kit_index_discovers_components() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(KIT_MANIFEST), "name: Acme UI\n").unwrap();
        fs::create_dir(temp.path().join("button")).unwrap();
        fs::write(temp.path().join("button").join(COMPONENT_TEMPLATE), "<button>ok</button>").unwrap();
        fs::create_dir(temp.path().join("assets")).unwrap();

        let preview = KitPreview::new(temp.path(), false).unwrap();
        assert_eq!(preview.components().unwrap(), vec!["button"]);

        let body = body_string(preview.handle("/").await).await;
        assert!(body.contains("<h1>Acme UI</h1>"));
        assert!(body.contains("href=\"/button/\""));

        let body = body_string(preview.handle("/button/").await).await;
        assert!(body.contains("<button>ok</button>"));
    }

    #[test]
    fn test_kit_missing_listed_component_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(KIT_MANIFEST), "components: [ghost]\n").unwrap();

        let err = KitPreview::new(temp.path(), false).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_error_handler_reports_every_request() {
        let err = DevError::ModeInit {
            mode: Mode::Kit,
            message: "bad <yaml>".to_string(),
        };
        let handler = ErrorHandler::new(Mode::Kit, &err, false);

        for path in ["/", "/anything.css"] {
            let response = handler.handle(path).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body_string(response).await.contains("bad &lt;yaml&gt;"));
        }
    }
}
