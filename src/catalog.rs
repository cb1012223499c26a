use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SCRIPT_EXTENSIONS: &[&str] = &["mjs", "mts", "js", "ts", "md"];
const SCRIPT_MARKER: &str = ".genai.";
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptScript {
    pub id: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub filename: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub scripts: Vec<PromptScript>,
    pub diagnostics: Vec<Diagnostic>,
}

/// `poem.genai.mjs` -> `poem`
pub fn script_id(filename: &str) -> Option<&str> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if !SCRIPT_EXTENSIONS.contains(&ext) {
        return None;
    }
    let id = stem.strip_suffix(SCRIPT_MARKER.trim_end_matches('.'))?;
    (!id.is_empty()).then_some(id)
}

/// Scans a directory tree for prompt scripts.
#[derive(Debug, Clone)]
pub struct ScriptCatalog {
    root: PathBuf,
}

impl ScriptCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A missing root is an empty project, not an error.
    pub async fn project(&self) -> Project {
        let mut project = Project::default();
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == self.root => break,
                Err(e) => {
                    project.diagnostics.push(Diagnostic {
                        filename: self.relative(&dir),
                        severity: Severity::Error,
                        message: format!("cannot read directory: {e}"),
                    });
                    continue;
                }
            };
            loop {
                let entry = match rd.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "directory listing interrupted");
                        break;
                    }
                };
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    if !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_str()) {
                        pending.push(path);
                    }
                    continue;
                }
                let Some(id) = script_id(&name) else { continue };
                let filename = self.relative(&path);
                if let Some(first) = seen.get(id) {
                    project.diagnostics.push(Diagnostic {
                        filename: filename.clone(),
                        severity: Severity::Warning,
                        message: format!("duplicate script id '{id}', already defined in {first}"),
                    });
                    continue;
                }
                seen.insert(id.to_string(), filename.clone());
                let title = match tokio::fs::read_to_string(&path).await {
                    Ok(source) => extract_title(&source),
                    Err(e) => {
                        project.diagnostics.push(Diagnostic {
                            filename: filename.clone(),
                            severity: Severity::Error,
                            message: format!("cannot read script: {e}"),
                        });
                        None
                    }
                };
                project.scripts.push(PromptScript { id: id.to_string(), filename, title });
            }
        }
        project.scripts.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::debug!(
            root = %self.root.display(),
            scripts = project.scripts.len(),
            diagnostics = project.diagnostics.len(),
            "scanned scripts"
        );
        project
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root).unwrap_or(path).to_string_lossy().replace('\\', "/")
    }
}

/// `title: "..."` in a script call, or the first markdown heading.
fn extract_title(source: &str) -> Option<String> {
    for line in source.lines() {
        let line = line.trim();
        if let Some(heading) = line.strip_prefix("# ") {
            return Some(heading.trim().to_string());
        }
        if let Some(rest) = line.split_once("title:").map(|(_, rest)| rest.trim_start()) {
            let quote = rest.chars().next().filter(|c| matches!(c, '"' | '\'' | '`'))?;
            let body = &rest[quote.len_utf8()..];
            return body.split_once(quote).map(|(title, _)| title.to_string());
        }
    }
    None
}
