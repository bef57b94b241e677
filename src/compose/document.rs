//! Compose document: the raw source text plus its parsed form
//!
//! The source is kept verbatim. Edits made through this type touch only
//! the bytes they are about, so unrelated formatting and comments in the
//! operator's file survive.

use super::config::ComposeConfig;
use super::graph;
use super::labels;
use super::parser::{ComposeParser, DEFAULT_COMPOSE_FILES};
use super::project::Project;
use crate::container::Container;
use crate::error::{KeelError, Result};
use std::path::{Path, PathBuf};

/// A parsed and validated compose file
#[derive(Debug, Clone)]
pub struct ComposeDocument {
    source: String,
    config: ComposeConfig,
    warnings: Vec<String>,
}

impl ComposeDocument {
    /// Parse and validate compose text
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let config = ComposeParser::parse_str(&source)?;
        let warnings = ComposeParser::validate(&config)?;
        Ok(Self {
            source,
            config,
            warnings,
        })
    }

    /// Read and parse a compose file
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            KeelError::ComposeFileUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Self::parse(source)
    }

    /// Write the source text to `path`, creating parent directories.
    ///
    /// The text goes to a sibling temp file first and is renamed into
    /// place so a reader never sees a half-written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("yml.keel-tmp");
        std::fs::write(&tmp, self.source.as_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// Validation warnings for accepted but ignored settings
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Top-level `name:` if the document declares one
    pub fn declared_name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn deploy_order(&self) -> Result<Vec<String>> {
        graph::deploy_order(&self.config)
    }

    /// Resolve against a project name and the directory of its file
    pub fn project(&self, name: &str, working_dir: &Path, config_file: &Path) -> Result<Project> {
        Project::resolve(
            &self.config,
            name,
            working_dir,
            vec![config_file.to_path_buf()],
        )
    }

    /// Replace one service's `image:` value in the raw text.
    ///
    /// Only the value on that line changes; its quoting and any trailing
    /// comment are kept. Flow-style (`{ ... }`) service maps are rejected.
    pub fn set_service_image(&self, service: &str, image: &str) -> Result<Self> {
        if image.trim().is_empty() || image.contains(['\n', '#']) {
            return Err(KeelError::ComposeParse(format!(
                "invalid image reference '{}'",
                image
            )));
        }

        let lines: Vec<&str> = self.source.split_inclusive('\n').collect();
        let index = find_image_line(&lines, service)?;

        let mut edited = String::with_capacity(self.source.len() + image.len());
        for (i, line) in lines.iter().enumerate() {
            if i == index {
                edited.push_str(&replace_value(line, image));
            } else {
                edited.push_str(line);
            }
        }

        let updated = Self::parse(edited)?;
        let current = updated
            .config
            .services
            .get(service)
            .and_then(|s| s.image.as_deref());
        if current != Some(image) {
            return Err(KeelError::ComposeParse(format!(
                "could not update image of service '{}' in place",
                service
            )));
        }
        Ok(updated)
    }
}

/// Where the compose file for a compose-managed container lives
pub fn compose_file_for(container: &Container) -> Result<PathBuf> {
    if container.started_with.project().is_none() {
        return Err(KeelError::NotComposeManaged(container.name.clone()));
    }

    if let Some(files) = container.labels.get(labels::CONFIG_FILES) {
        let found = files
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .find(|p| p.is_file());
        if let Some(path) = found {
            return Ok(path);
        }
    }

    if let Some(dir) = container.labels.get(labels::WORKING_DIR) {
        if let Some(path) = ComposeParser::find_compose_file(Path::new(dir)) {
            return Ok(path);
        }
        return Err(KeelError::ComposeFileUnavailable(format!(
            "none of {} found in {}",
            DEFAULT_COMPOSE_FILES.join(", "),
            dir
        )));
    }

    Err(KeelError::ComposeFileUnavailable(format!(
        "container '{}' carries no compose file location",
        container.name
    )))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_content(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Mapping key on a block-style line, unquoted
fn key_of(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let (key, _) = trimmed.split_once(':')?;
    let key = key.trim();
    Some(
        key.strip_prefix('"')
            .and_then(|k| k.strip_suffix('"'))
            .or_else(|| key.strip_prefix('\'').and_then(|k| k.strip_suffix('\'')))
            .unwrap_or(key),
    )
}

fn flow_style(line: &str) -> bool {
    line.split_once(':')
        .map(|(_, rest)| rest.trim_start().starts_with('{'))
        .unwrap_or(false)
}

/// Index of the end of a block: the first content line at or above `indent`
fn block_end(lines: &[&str], start: usize, indent: usize) -> usize {
    lines
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, l)| is_content(l) && indent_of(l) <= indent)
        .map(|(i, _)| i)
        .unwrap_or(lines.len())
}

fn find_image_line(lines: &[&str], service: &str) -> Result<usize> {
    let not_editable = |why: &str| {
        KeelError::ComposeParse(format!(
            "cannot edit image of service '{}': {}",
            service, why
        ))
    };

    let services = lines
        .iter()
        .position(|l| indent_of(l) == 0 && key_of(l) == Some("services"))
        .ok_or_else(|| not_editable("no top-level services block"))?;
    if flow_style(lines[services]) {
        return Err(not_editable("services is written in flow style"));
    }
    let services_end = block_end(lines, services + 1, 0);

    let service_indent = (services + 1..services_end)
        .find(|&i| is_content(lines[i]))
        .map(|i| indent_of(lines[i]))
        .ok_or_else(|| not_editable("services block is empty"))?;
    let service_line = (services + 1..services_end)
        .find(|&i| {
            is_content(lines[i])
                && indent_of(lines[i]) == service_indent
                && key_of(lines[i]) == Some(service)
        })
        .ok_or_else(|| not_editable("service not found"))?;
    if flow_style(lines[service_line]) {
        return Err(not_editable("service is written in flow style"));
    }
    let service_end = block_end(lines, service_line + 1, service_indent);

    let field_indent = (service_line + 1..service_end)
        .find(|&i| is_content(lines[i]))
        .map(|i| indent_of(lines[i]))
        .ok_or_else(|| not_editable("service has no fields"))?;

    (service_line + 1..service_end)
        .find(|&i| indent_of(lines[i]) == field_indent && key_of(lines[i]) == Some("image"))
        .ok_or_else(|| not_editable("no image line"))
}

/// Swap the scalar after `image:` keeping quotes, comment and line ending
fn replace_value(line: &str, image: &str) -> String {
    let (body, ending) = match line.strip_suffix("\r\n") {
        Some(b) => (b, "\r\n"),
        None => match line.strip_suffix('\n') {
            Some(b) => (b, "\n"),
            None => (line, ""),
        },
    };

    let Some(colon) = body.find(':') else {
        return line.to_string();
    };
    let (head, rest) = body.split_at(colon + 1);
    let value_start = rest.len() - rest.trim_start().len();
    let (gap, value) = rest.split_at(value_start);

    let (quote, tail) = match value.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let inner = &value[1..];
            match inner.find(q) {
                Some(end) => (Some(q), &inner[end + 1..]),
                None => (Some(q), ""),
            }
        }
        _ => {
            let end = value.find(" #").unwrap_or(value.len());
            let scalar = value[..end].trim_end();
            (None, &value[scalar.len()..])
        }
    };

    let gap = if gap.is_empty() { " " } else { gap };
    match quote {
        Some(q) => format!("{}{}{}{}{}{}{}", head, gap, q, image, q, tail, ending),
        None => format!("{}{}{}{}{}", head, gap, image, tail, ending),
    }
}
