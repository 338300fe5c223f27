//! Tera rendering of cycle summaries.
//!
//! | Template            | Used for                                        |
//! |---------------------|-------------------------------------------------|
//! | `headline.txt.tera` | one-line log entry, webhook `text` field        |
//! | `body.txt.tera`     | full report, webhook `body` field               |
//!
//! Either can be overridden by a same-named file in the configured
//! `template_dir`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use slotsync_core::CycleSummary;

use crate::context::SummaryContext;
use crate::error::RenderError;

// ---------------------------------------------------------------------------
// Embedded templates, baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

pub const HEADLINE_TEMPLATE: &str = "headline.txt.tera";
pub const BODY_TEMPLATE: &str = "body.txt.tera";

const TPLS: &[(&str, &str)] = &[
    (HEADLINE_TEMPLATE, include_str!("templates/headline.txt.tera")),
    (BODY_TEMPLATE, include_str!("templates/body.txt.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io { path: path.into(), source }
}

/// Overrides for the embedded names only; anything else in the directory is
/// ignored.
fn load_overrides(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    let mut templates = Vec::new();
    for (name, _) in TPLS {
        let path = dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::debug!(template = %path.display(), "using template override");
                templates.push(((*name).to_string(), contents));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }
    }
    Ok(templates)
}

fn build_tera(template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = TPLS
        .iter()
        .map(|(name, content)| ((*name).to_string(), (*content).to_string()))
        .collect();
    if let Some(dir) = template_dir {
        for (name, content) in load_overrides(dir)? {
            templates.insert(name, content);
        }
    }

    let mut tera = Tera::default();
    tera.add_raw_templates(templates)?;
    Ok(tera)
}

// ---------------------------------------------------------------------------
// SummaryRenderer
// ---------------------------------------------------------------------------

/// Rendered text for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSummary {
    pub headline: String,
    pub body: String,
}

/// Tera renderer for cycle summaries. Build once and share.
pub struct SummaryRenderer {
    tera: Tera,
}

impl SummaryRenderer {
    /// Embedded templates only.
    pub fn new() -> Result<Self, RenderError> {
        Self::with_template_dir(None)
    }

    /// Embedded templates plus overrides found in `template_dir`.
    pub fn with_template_dir(template_dir: Option<&Path>) -> Result<Self, RenderError> {
        Ok(SummaryRenderer { tera: build_tera(template_dir)? })
    }

    pub fn render(&self, summary: &CycleSummary) -> Result<RenderedSummary, RenderError> {
        let ctx = SummaryContext::from_summary(summary).to_tera_context()?;
        Ok(RenderedSummary {
            headline: self.tera.render(HEADLINE_TEMPLATE, &ctx)?.trim_end().to_string(),
            body: self.tera.render(BODY_TEMPLATE, &ctx)?,
        })
    }
}

impl std::fmt::Debug for SummaryRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryRenderer").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
