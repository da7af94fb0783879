// Language runtime registry: language -> source filename + invocation
use crate::error::SandboxError;
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tanuki_common::types::Language;

/// Writable scratch directory inside the container for build artifacts.
/// The workspace itself is mounted read-only.
pub const BUILD_DIR: &str = "/tmp/build";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    pub source_filename: String,
    /// Full argv; compiled languages fold the compile step into a `sh -c` line
    pub command: Vec<String>,
}

impl LanguageProfile {
    fn shell(language: Language, source_filename: &str, script: String) -> Self {
        Self {
            language,
            source_filename: source_filename.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script],
        }
    }

    fn builtin(language: Language) -> Self {
        match language {
            Language::Python => Self {
                language,
                source_filename: "main.py".to_string(),
                command: vec!["python3".to_string(), "-u".to_string(), "main.py".to_string()],
            },
            Language::JavaScript => Self {
                language,
                source_filename: "main.js".to_string(),
                command: vec!["node".to_string(), "main.js".to_string()],
            },
            Language::Java => Self::shell(
                language,
                "Main.java",
                format!(
                    "mkdir -p {dir} && javac -d {dir} Main.java && java -cp {dir} Main",
                    dir = BUILD_DIR
                ),
            ),
            Language::Cpp => Self::shell(
                language,
                "main.cpp",
                format!(
                    "mkdir -p {dir} && g++ -O2 -o {dir}/main main.cpp && {dir}/main",
                    dir = BUILD_DIR
                ),
            ),
            Language::Go => Self::shell(
                language,
                "main.go",
                format!(
                    "mkdir -p {dir} && go build -o {dir}/main main.go && {dir}/main",
                    dir = BUILD_DIR
                ),
            ),
            Language::Rust => Self::shell(
                language,
                "main.rs",
                format!(
                    "mkdir -p {dir} && rustc -O -o {dir}/main main.rs && {dir}/main",
                    dir = BUILD_DIR
                ),
            ),
        }
    }
}

lazy_static! {
    static ref BUILTIN_PROFILES: HashMap<Language, LanguageProfile> = Language::ALL
        .iter()
        .map(|lang| (*lang, LanguageProfile::builtin(*lang)))
        .collect();
}

/// Entry of a languages.json override file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageEntry {
    pub name: String,
    pub source_filename: String,
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageEntry>,
}

/// Maps a language identifier to its [`LanguageProfile`].
/// Built once at startup and shared read-only between requests.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LanguageRegistry {
    /// The built-in table for all six languages
    pub fn builtin() -> Self {
        Self {
            profiles: BUILTIN_PROFILES.clone(),
        }
    }

    /// Built-in table with entries from a languages.json file layered on top
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;

        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        let mut registry = Self::builtin();
        for entry in languages_json.languages {
            let language = match Language::from_str(&entry.name) {
                Some(lang) => lang,
                None => bail!("Unknown language '{}' in languages.json", entry.name),
            };
            if entry.source_filename.is_empty() || entry.command.is_empty() {
                bail!(
                    "Language '{}' needs a source_filename and a non-empty command",
                    entry.name
                );
            }
            registry.profiles.insert(
                language,
                LanguageProfile {
                    language,
                    source_filename: entry.source_filename,
                    command: entry.command,
                },
            );
        }

        Ok(registry)
    }

    /// Resolve a caller-supplied language identifier.
    /// Touches neither the filesystem nor the container runtime.
    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile, SandboxError> {
        Language::from_str(language)
            .and_then(|lang| self.profiles.get(&lang))
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.profiles.keys().copied().collect();
        languages.sort_by_key(|lang| lang.as_str());
        languages
    }
}
