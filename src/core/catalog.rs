use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("../../assets/storybooks.yml");

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Story {
    pub id: String,
    pub emoji: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default = "default_color")]
    pub color: String,
    pub character: String,
    pub end_message: String,
    pub pages: Vec<Page>,
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Page {
    pub text: String,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(default = "default_color")]
    pub background_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

/// A reflective question. An empty option list means free-text answers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<AnswerOption>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnswerOption {
    pub id: String,
    pub emoji: String,
    pub label: String,
}

fn default_color() -> String {
    "#FFFFFF".to_string()
}

impl Story {
    pub fn last_page_index(&self) -> usize {
        self.pages.len().saturating_sub(1)
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.emoji, self.title)
    }
}

impl Question {
    pub fn is_free_text(&self) -> bool {
        self.options.is_empty()
    }

    /// Renders a stored answer for display. Option ids become `emoji label`,
    /// anything else is shown verbatim.
    pub fn answer_label(&self, value: &str) -> String {
        self.options
            .iter()
            .find(|o| o.id == value)
            .map(|o| format!("{} {}", o.emoji, o.label))
            .unwrap_or_else(|| value.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    stories: Vec<Story>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG).context("Failed to parse built-in story catalog")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let stories: Vec<Story> = serde_yaml_ng::from_str(content)?;
        Self::from_stories(stories)
    }

    pub fn from_stories(stories: Vec<Story>) -> Result<Self> {
        let mut seen = HashSet::new();
        for story in &stories {
            if story.pages.is_empty() {
                anyhow::bail!("Story '{}' has no pages", story.id);
            }
            if !seen.insert(story.id.as_str()) {
                anyhow::bail!("Duplicate story id '{}'", story.id);
            }
        }
        Ok(Self { stories })
    }

    /// Loads the catalog from `path` when it exists, otherwise the built-in one.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read catalog {:?}", p))?;
                Self::from_yaml(&content).with_context(|| format!("Failed to parse catalog {:?}", p))
            }
            _ => Self::builtin(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stories.iter().map(|s| s.id.as_str())
    }
}
