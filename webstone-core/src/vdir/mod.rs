//! Virtual directory tree
//!
//! The resolver's unit of configuration. At load time the flat list of
//! configured directories is folded into a map keyed by full virtual
//! path: children concatenate their segment onto the parent's path,
//! inherit browsing/charset/templates, merge default-document
//! add/remove rules and pick up the parent's handler registrations.
//! The tree is immutable once built; a reload constructs a fresh tree
//! and swaps it in between requests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;

use crate::config::{DirectoryConfig, DocumentAction};
use crate::error::{Result, WebstoneError};
use crate::http::constants;

/// Default charset assumed by clients when none is negotiated
/// (HTTP/1.1 defaults `Accept-Charset` handling to ISO-8859-1).
pub const DEFAULT_CHARSET: &str = constants::DEFAULT_CONTENT_CHARSET;

/// Resolved runtime form of one configured directory.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub parent_name: String,
    /// Segment under the parent, as configured (listing label for
    /// linked directories)
    pub relative_path: String,
    /// Full virtual path; always slash-terminated
    pub virtual_path: String,
    /// Real filesystem location
    pub real_path: PathBuf,
    /// Real path lies outside the parent's subtree
    pub is_linked_directory: bool,
    pub browsing_enabled: bool,
    pub charset: String,
    /// Merged default-document names, in add order
    pub default_documents: Vec<String>,
    /// `(extension, handler name)` registrations, insertion-ordered;
    /// `*` matches every extension
    pub handlers: Vec<(String, String)>,
    /// URL rewrite rules, tried in order against the original relative
    /// path; the last matching rule wins
    pub mappings: Vec<(Regex, String)>,

    pub header_template: String,
    pub parent_directory_template: String,
    pub virtual_directory_template: String,
    pub directory_template: String,
    pub file_template: String,
    pub footer_template: String,
}

/// Map of full virtual path to directory entry.
#[derive(Debug, Default)]
pub struct DirectoryTree {
    entries: BTreeMap<String, DirectoryEntry>,
}

impl DirectoryTree {
    /// Build the tree from the configured directory list.
    pub fn build(configs: &[DirectoryConfig]) -> Result<Self> {
        let roots: Vec<&DirectoryConfig> =
            configs.iter().filter(|c| c.parent.is_none()).collect();
        if roots.len() != 1 {
            return Err(WebstoneError::SettingsLoad(format!(
                "exactly one root directory record is required, found {}",
                roots.len()
            )));
        }
        let root_config = roots[0];

        let root_path = root_config.path.clone().ok_or_else(|| {
            WebstoneError::SettingsLoad(format!(
                "root directory \"{}\" needs an absolute path",
                root_config.name
            ))
        })?;
        check_directory(&root_path, &root_config.name)?;

        let root = DirectoryEntry {
            name: root_config.name.clone(),
            parent_name: String::new(),
            relative_path: String::new(),
            virtual_path: constants::SLASH.to_string(),
            real_path: root_path,
            is_linked_directory: false,
            // an unset flag on the root allows browsing
            browsing_enabled: root_config.browsing_enabled.unwrap_or(true),
            charset: root_config
                .charset
                .clone()
                .unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
            default_documents: merge_default_documents(&[], root_config)?,
            handlers: root_config
                .handlers
                .iter()
                .map(|h| (h.ext.clone(), h.handler.clone()))
                .collect(),
            mappings: compile_mappings(root_config)?,
            header_template: root_config.templates.header.clone().unwrap_or_default(),
            parent_directory_template: root_config
                .templates
                .parent_directory
                .clone()
                .unwrap_or_default(),
            virtual_directory_template: root_config
                .templates
                .virtual_directory
                .clone()
                .unwrap_or_default(),
            directory_template: root_config.templates.directory.clone().unwrap_or_default(),
            file_template: root_config.templates.file.clone().unwrap_or_default(),
            footer_template: root_config.templates.footer.clone().unwrap_or_default(),
        };

        let mut tree = DirectoryTree::default();
        tree.entries.insert(root.virtual_path.clone(), root.clone());
        tree.fill_children(configs, &root)?;
        Ok(tree)
    }

    fn fill_children(
        &mut self,
        configs: &[DirectoryConfig],
        parent: &DirectoryEntry,
    ) -> Result<()> {
        for config in configs {
            if config.parent.as_deref() != Some(parent.name.as_str()) {
                continue;
            }

            let segment = config
                .virtual_path
                .clone()
                .or_else(|| config.relative_path.clone())
                .ok_or_else(|| {
                    WebstoneError::SettingsLoad(format!(
                        "nested directory \"{}\" needs a virtual path segment",
                        config.name
                    ))
                })?;
            if segment.is_empty() {
                return Err(WebstoneError::SettingsLoad(format!(
                    "empty virtual path segment for nested directory: {}",
                    config.name
                )));
            }

            let mut virtual_path = format!("{}{}", parent.virtual_path, segment);
            if !virtual_path.ends_with(constants::SLASH) {
                virtual_path.push('/');
            }

            // an own absolute path makes this a linked directory
            let (real_path, is_linked, relative_path) = match &config.path {
                Some(path) => (path.clone(), true, segment.clone()),
                None => {
                    let rel = config.relative_path.clone().ok_or_else(|| {
                        WebstoneError::SettingsLoad(format!(
                            "directory \"{}\" needs either a path or a relative_path",
                            config.name
                        ))
                    })?;
                    (parent.real_path.join(&rel), false, rel)
                }
            };
            check_directory(&real_path, &config.name)?;

            let entry = DirectoryEntry {
                name: config.name.clone(),
                parent_name: parent.name.clone(),
                relative_path,
                virtual_path: virtual_path.clone(),
                real_path,
                is_linked_directory: is_linked,
                browsing_enabled: config.browsing_enabled.unwrap_or(parent.browsing_enabled),
                charset: config.charset.clone().unwrap_or_else(|| parent.charset.clone()),
                default_documents: merge_default_documents(&parent.default_documents, config)?,
                handlers: merge_handlers(&parent.handlers, config),
                mappings: compile_mappings(config)?,
                header_template: inherit(&config.templates.header, &parent.header_template),
                parent_directory_template: inherit(
                    &config.templates.parent_directory,
                    &parent.parent_directory_template,
                ),
                virtual_directory_template: inherit(
                    &config.templates.virtual_directory,
                    &parent.virtual_directory_template,
                ),
                directory_template: inherit(
                    &config.templates.directory,
                    &parent.directory_template,
                ),
                file_template: inherit(&config.templates.file, &parent.file_template),
                footer_template: inherit(&config.templates.footer, &parent.footer_template),
            };

            if self.entries.insert(virtual_path, entry.clone()).is_some() {
                return Err(WebstoneError::SettingsLoad(format!(
                    "duplicate virtual path: {}",
                    entry.virtual_path
                )));
            }
            self.fill_children(configs, &entry)?;
        }
        Ok(())
    }

    pub fn get(&self, virtual_path: &str) -> Option<&DirectoryEntry> {
        self.entries.get(virtual_path)
    }

    pub fn root(&self) -> Option<&DirectoryEntry> {
        self.entries.get(constants::SLASH)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Deepest configured entry whose virtual path prefixes
    /// `virtual_path`, walking `/`-separated prefixes from the root.
    pub fn nearest_ancestor(&self, virtual_path: &str) -> Option<&DirectoryEntry> {
        let mut found = self.root()?;
        if virtual_path == constants::SLASH {
            return Some(found);
        }

        let mut slash_pos = 0;
        while let Some(next) = virtual_path[slash_pos + 1..].find('/') {
            slash_pos += next + 1;
            let prefix = &virtual_path[..slash_pos + 1];
            match self.entries.get(prefix) {
                Some(entry) => found = entry,
                None => break,
            }
        }
        Some(found)
    }
}

fn inherit(own: &Option<String>, parent: &str) -> String {
    match own {
        Some(t) if !t.is_empty() => t.clone(),
        _ => parent.to_string(),
    }
}

fn check_directory(path: &PathBuf, name: &str) -> Result<()> {
    if !path.exists() {
        return Err(WebstoneError::SettingsLoad(format!(
            "path does not exist for directory record \"{name}\": {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(WebstoneError::SettingsLoad(format!(
            "target of directory record \"{name}\" is not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

fn compile_mappings(config: &DirectoryConfig) -> Result<Vec<(Regex, String)>> {
    config
        .mappings
        .iter()
        .map(|rule| {
            let regex = Regex::new(&rule.regex).map_err(|e| {
                WebstoneError::SettingsLoad(format!(
                    "invalid mapping regex \"{}\" in directory \"{}\": {}",
                    rule.regex, config.name, e
                ))
            })?;
            Ok((regex, rule.url.clone()))
        })
        .collect()
}

/// Parent's merged list plus this directory's adds, minus its removes.
/// Removing a name the parent never declared is a configuration error.
fn merge_default_documents(
    parent_docs: &[String],
    config: &DirectoryConfig,
) -> Result<Vec<String>> {
    let mut docs: Vec<String> = parent_docs.to_vec();

    for rule in &config.default_documents {
        match rule.action {
            DocumentAction::Add => {
                if !docs.contains(&rule.name) {
                    docs.push(rule.name.clone());
                }
            }
            DocumentAction::Remove => {
                let pos = docs.iter().position(|d| d == &rule.name).ok_or_else(|| {
                    WebstoneError::SettingsLoad(format!(
                        "cannot remove default document \"{}\" in directory \"{}\" - \
                         it is not declared in a parent directory record",
                        rule.name, config.name
                    ))
                })?;
                docs.remove(pos);
            }
        }
    }

    Ok(docs)
}

/// Child bindings first, then parent registrations for extensions the
/// child did not bind itself.
fn merge_handlers(
    parent_handlers: &[(String, String)],
    config: &DirectoryConfig,
) -> Vec<(String, String)> {
    let mut handlers: Vec<(String, String)> = config
        .handlers
        .iter()
        .map(|h| (h.ext.clone(), h.handler.clone()))
        .collect();

    for (ext, name) in parent_handlers {
        if !handlers.iter().any(|(e, _)| e == ext) {
            handlers.push((ext.clone(), name.clone()));
        }
    }

    handlers
}
