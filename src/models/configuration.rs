//! Test configuration and test case models
//!
//! A `TestConfiguration` describes the matrix of models, user types, think
//! modes and questions to run. It is validated when loaded and never mutated
//! once a run has started.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Configuration name must not be empty")]
    EmptyName,

    #[error("Invalid configuration name '{0}': only letters, digits, '_', '-' and '.' are allowed")]
    InvalidName(String),

    #[error("Configuration '{config}' has an empty {field} list")]
    EmptyList {
        config: String,
        field: &'static str,
    },

    #[error("Configuration '{config}' lists {field} '{value}' more than once")]
    Duplicate {
        config: String,
        field: &'static str,
        value: String,
    },

    #[error("questions_per_combination must be at least 1 (got {0})")]
    InvalidRepetitions(u32),

    #[error("delay_between_tests_secs must be a finite, non-negative number (got {0})")]
    InvalidDelay(String),

    #[error("Configuration '{0}' produces an empty test matrix")]
    EmptyTestMatrix(String),
}

/// Kind of configuration, mostly informational
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    #[default]
    Custom,
    ModelComparison,
    ThinkModeComparison,
    UserTypeComparison,
    Comprehensive,
    CategorySpecific,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Custom => "custom",
            ConfigKind::ModelComparison => "model_comparison",
            ConfigKind::ThinkModeComparison => "think_mode_comparison",
            ConfigKind::UserTypeComparison => "user_type_comparison",
            ConfigKind::Comprehensive => "comprehensive",
            ConfigKind::CategorySpecific => "category_specific",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

fn default_questions_per_combination() -> u32 {
    1
}

fn default_delay_secs() -> f64 {
    5.0
}

/// A named A/B test configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfiguration {
    /// Unique configuration name
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub kind: ConfigKind,

    /// Question category for category specific configurations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Model identifiers, in enumeration order
    pub models: Vec<String>,

    /// User type labels (response styles)
    pub user_types: Vec<String>,

    /// Think mode options
    pub think_mode_options: Vec<bool>,

    /// Questions, in enumeration order
    pub questions: Vec<String>,

    /// How many times each question is asked per combination
    #[serde(default = "default_questions_per_combination")]
    pub questions_per_combination: u32,

    /// Delay between two consecutive calls to the target service
    #[serde(default = "default_delay_secs")]
    pub delay_between_tests_secs: f64,

    /// Shuffle the whole test matrix once before batching
    #[serde(default)]
    pub randomize_order: bool,

    /// Model id fragments that support think mode. Empty means every model does.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub think_mode_models: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TestConfiguration {
    /// Create a configuration with the four matrix dimensions
    pub fn new(
        name: impl Into<String>,
        models: Vec<String>,
        user_types: Vec<String>,
        think_mode_options: Vec<bool>,
        questions: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: ConfigKind::Custom,
            category: None,
            models,
            user_types,
            think_mode_options,
            questions,
            questions_per_combination: default_questions_per_combination(),
            delay_between_tests_secs: default_delay_secs(),
            randomize_order: false,
            think_mode_models: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_kind(mut self, kind: ConfigKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_repetitions(mut self, questions_per_combination: u32) -> Self {
        self.questions_per_combination = questions_per_combination;
        self
    }

    pub fn with_delay_secs(mut self, secs: f64) -> Self {
        self.delay_between_tests_secs = secs;
        self
    }

    pub fn randomized(mut self) -> Self {
        self.randomize_order = true;
        self
    }

    pub fn with_think_mode_models(mut self, models: Vec<String>) -> Self {
        self.think_mode_models = models;
        self
    }

    /// Load a configuration from a JSON or YAML file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML configuration: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON configuration: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Inter-request delay as a `Duration`
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_between_tests_secs.max(0.0))
    }

    /// Whether `model` may be asked to run in think mode
    pub fn supports_think_mode(&self, model: &str) -> bool {
        self.think_mode_models.is_empty()
            || self.think_mode_models.iter().any(|m| model.contains(m.as_str()))
    }

    /// Validate field invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;

        self.check_list("models", &self.models)?;
        self.check_list("user_types", &self.user_types)?;
        self.check_list("questions", &self.questions)?;

        let think_labels: Vec<String> = self
            .think_mode_options
            .iter()
            .map(|t| t.to_string())
            .collect();
        self.check_list("think_mode_options", &think_labels)?;

        if self.questions_per_combination < 1 {
            return Err(ValidationError::InvalidRepetitions(
                self.questions_per_combination,
            ));
        }

        if !self.delay_between_tests_secs.is_finite() || self.delay_between_tests_secs < 0.0 {
            return Err(ValidationError::InvalidDelay(
                self.delay_between_tests_secs.to_string(),
            ));
        }

        Ok(())
    }

    fn check_list(&self, field: &'static str, values: &[String]) -> Result<(), ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::EmptyList {
                config: self.name.clone(),
                field,
            });
        }

        let mut seen = HashSet::new();
        for value in values {
            if !seen.insert(value.as_str()) {
                return Err(ValidationError::Duplicate {
                    config: self.name.clone(),
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Enumerate the full test matrix in canonical order:
    /// model, user type, think mode, question, repetition.
    pub fn test_cases(&self) -> Result<Vec<TestCase>, ValidationError> {
        self.validate()?;

        let mut cases = Vec::with_capacity(self.matrix_upper_bound());
        for model in &self.models {
            for user_type in &self.user_types {
                for &think_mode in &self.think_mode_options {
                    if think_mode && !self.supports_think_mode(model) {
                        continue;
                    }
                    for question in &self.questions {
                        for repetition in 0..self.questions_per_combination {
                            cases.push(TestCase {
                                model: model.clone(),
                                user_type: user_type.clone(),
                                think_mode,
                                question: question.clone(),
                                repetition,
                            });
                        }
                    }
                }
            }
        }

        if cases.is_empty() {
            return Err(ValidationError::EmptyTestMatrix(self.name.clone()));
        }

        Ok(cases)
    }

    /// Matrix size before think mode filtering
    pub fn matrix_upper_bound(&self) -> usize {
        self.models.len()
            * self.user_types.len()
            * self.think_mode_options.len()
            * self.questions.len()
            * self.questions_per_combination as usize
    }
}

/// Check a configuration name (also used as a storage key)
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if !valid {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// One concrete (model, user type, think mode, question, repetition) tuple
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestCase {
    pub model: String,
    pub user_type: String,
    pub think_mode: bool,
    pub question: String,
    pub repetition: u32,
}

impl TestCase {
    /// Stable identity of the case, used as the idempotency key for results
    pub fn key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.model, self.user_type, self.think_mode, self.repetition, self.question
        )
    }

    pub fn think_mode_label(&self) -> &'static str {
        think_mode_label(self.think_mode)
    }
}

pub fn think_mode_label(think_mode: bool) -> &'static str {
    if think_mode {
        "enabled"
    } else {
        "disabled"
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | think:{} | #{}",
            self.model,
            self.user_type,
            self.think_mode_label(),
            self.repetition + 1
        )
    }
}
