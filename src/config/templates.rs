//! Built-in test configuration templates
//!
//! Templates are generated from a bundled model catalogue and a sample
//! question bank. Questions are sorted into categories by keyword.

use rand::Rng;
use std::fmt;

use crate::models::{ConfigKind, TestConfiguration};

/// A model the target service can route to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub supports_think_mode: bool,
}

/// Known models, most capable first
pub const MODEL_CATALOGUE: &[ModelInfo] = &[
    ModelInfo {
        id: "gemini-2.5-pro",
        name: "Gemini 2.5 Pro",
        supports_think_mode: true,
    },
    ModelInfo {
        id: "gemini-2.5-flash",
        name: "Gemini 2.5 Flash",
        supports_think_mode: true,
    },
    ModelInfo {
        id: "gemini-2.5-flash-lite",
        name: "Gemini 2.5 Flash Lite",
        supports_think_mode: true,
    },
    ModelInfo {
        id: "gemini-2.0-flash",
        name: "Gemini 2.0 Flash",
        supports_think_mode: false,
    },
    ModelInfo {
        id: "gemini-2.0-flash-lite",
        name: "Gemini 2.0 Flash Lite",
        supports_think_mode: false,
    },
    ModelInfo {
        id: "gemini-1.5-flash",
        name: "Gemini 1.5 Flash",
        supports_think_mode: false,
    },
    ModelInfo {
        id: "gemini-1.5-pro",
        name: "Gemini 1.5 Pro",
        supports_think_mode: false,
    },
];

pub const USER_TYPES: &[&str] = &["business", "technical"];

pub const SAMPLE_QUESTIONS: &[&str] = &[
    "How to identify Dental Claim?",
    "How to identify supplies Claim?",
    "How to identify workers comp Claim?",
    "How to identify subrogation Claim?",
    "How to identify in-house/340b Claim?",
    "How to identify supplies, workers comp claims, subrogation claims, and in-house/340b claims?",
    "How to identify indemnity Claim?",
    "What is field 15 in the Universal file?",
    "Explain External Stop Loss reporting requirements",
    "What are the capitation payment file specifications?",
    "Where can I find provider identification fields?",
    "What is ICD9_DX_CD?",
    "Present on Admission Code",
    "Explain Aexcel Designated Provider Specialty",
    "How does the graph database enhance document processing?",
    "What are the key features of Graph RAG v3.0?",
    "How does Neo4j integration improve search results?",
    "Explain the confidence scoring system",
    "What types of documents can be processed?",
    "How does iterative extraction work?",
    "What is the relationship between entities in the graph?",
    "How are embedded Excel files handled?",
    "What validation methods are used?",
    "How does the system handle older MS Office formats?",
    "Explain the multi-layer validation process",
    "What are the performance optimizations?",
    "How does error handling work?",
    "What is the graph schema flexibility?",
];

/// Topic of a sample question
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuestionCategory {
    ClaimsProcessing,
    TechnicalFeatures,
    DataFields,
    Compliance,
    SystemArchitecture,
}

impl QuestionCategory {
    pub const ALL: [QuestionCategory; 5] = [
        QuestionCategory::ClaimsProcessing,
        QuestionCategory::TechnicalFeatures,
        QuestionCategory::DataFields,
        QuestionCategory::Compliance,
        QuestionCategory::SystemArchitecture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionCategory::ClaimsProcessing => "claims_processing",
            QuestionCategory::TechnicalFeatures => "technical_features",
            QuestionCategory::DataFields => "data_fields",
            QuestionCategory::Compliance => "compliance",
            QuestionCategory::SystemArchitecture => "system_architecture",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.to_lowercase().replace('-', "_"))
    }

    /// Keyword lists are checked in `ALL` order; the first hit wins
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            QuestionCategory::ClaimsProcessing => {
                &["claim", "dental", "workers comp", "subrogation", "indemnity"]
            }
            QuestionCategory::TechnicalFeatures => {
                &["graph", "neo4j", "database", "extraction", "processing"]
            }
            QuestionCategory::DataFields => &["field", "icd9", "admission", "universal file"],
            QuestionCategory::Compliance => &["stop loss", "capitation", "aexcel"],
            QuestionCategory::SystemArchitecture => &[],
        }
    }

    /// Category of one question
    pub fn classify(question: &str) -> Self {
        let lower = question.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.keywords().iter().any(|k| lower.contains(k)))
            .unwrap_or(QuestionCategory::SystemArchitecture)
    }

    /// Sample questions in this category, in bank order
    pub fn questions(&self) -> Vec<&'static str> {
        SAMPLE_QUESTIONS
            .iter()
            .copied()
            .filter(|q| Self::classify(q) == *self)
            .collect()
    }
}

impl fmt::Display for QuestionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

fn model_ids(models: &[ModelInfo]) -> Vec<String> {
    models.iter().map(|m| m.id.to_string()).collect()
}

fn think_mode_ids() -> Vec<String> {
    MODEL_CATALOGUE
        .iter()
        .filter(|m| m.supports_think_mode)
        .map(|m| m.id.to_string())
        .collect()
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// `amount` distinct questions picked at random, kept in bank order
fn sample_questions<R: Rng + ?Sized>(rng: &mut R, amount: usize) -> Vec<String> {
    let amount = amount.min(SAMPLE_QUESTIONS.len());
    let mut picked = rand::seq::index::sample(rng, SAMPLE_QUESTIONS.len(), amount).into_vec();
    picked.sort_unstable();
    picked
        .into_iter()
        .map(|i| SAMPLE_QUESTIONS[i].to_string())
        .collect()
}

/// Compare the first four catalogue models on business answers without think mode
pub fn model_comparison<R: Rng + ?Sized>(rng: &mut R) -> TestConfiguration {
    TestConfiguration::new(
        "model_comparison",
        model_ids(&MODEL_CATALOGUE[..4]),
        owned(&["business"]),
        vec![false],
        sample_questions(rng, 15),
    )
    .with_description("Compare performance across different LLM models")
    .with_kind(ConfigKind::ModelComparison)
    .randomized()
}

/// Think mode on and off for the models that support it
pub fn think_mode_comparison<R: Rng + ?Sized>(rng: &mut R) -> TestConfiguration {
    TestConfiguration::new(
        "think_mode_comparison",
        think_mode_ids(),
        owned(&["technical"]),
        vec![true, false],
        sample_questions(rng, 12),
    )
    .with_description("Compare performance with think mode on vs off")
    .with_kind(ConfigKind::ThinkModeComparison)
    .with_think_mode_models(think_mode_ids())
    .randomized()
}

pub fn user_type_comparison<R: Rng + ?Sized>(rng: &mut R) -> TestConfiguration {
    TestConfiguration::new(
        "user_type_comparison",
        owned(&["gemini-2.0-flash"]),
        owned(USER_TYPES),
        vec![false],
        sample_questions(rng, 10),
    )
    .with_description("Compare responses for business vs technical user types")
    .with_kind(ConfigKind::UserTypeComparison)
    .randomized()
}

/// Every model, user type, think mode and question, three times each
pub fn comprehensive() -> TestConfiguration {
    TestConfiguration::new(
        "comprehensive",
        model_ids(MODEL_CATALOGUE),
        owned(USER_TYPES),
        vec![true, false],
        owned(SAMPLE_QUESTIONS),
    )
    .with_description("Test all combinations of models, user types and think modes")
    .with_kind(ConfigKind::Comprehensive)
    .with_repetitions(3)
    .with_think_mode_models(think_mode_ids())
    .randomized()
}

pub fn category_specific(category: QuestionCategory) -> TestConfiguration {
    let mut config = TestConfiguration::new(
        format!("{}_test", category.as_str()),
        model_ids(&MODEL_CATALOGUE[..3]),
        owned(USER_TYPES),
        vec![false],
        owned(&category.questions()),
    )
    .with_description(format!("Test performance on {category} questions"))
    .with_kind(ConfigKind::CategorySpecific)
    .randomized();
    config.category = Some(category.as_str().to_string());
    config
}

/// Every template, skipping categories without questions
pub fn default_templates<R: Rng + ?Sized>(rng: &mut R) -> Vec<TestConfiguration> {
    let mut templates = vec![
        model_comparison(rng),
        think_mode_comparison(rng),
        user_type_comparison(rng),
        comprehensive(),
    ];
    templates.extend(
        QuestionCategory::ALL
            .into_iter()
            .filter(|c| !c.questions().is_empty())
            .map(category_specific),
    );
    templates
}

/// Template by name, as accepted on the command line
pub fn by_name<R: Rng + ?Sized>(name: &str, rng: &mut R) -> Option<TestConfiguration> {
    match name {
        "model_comparison" => Some(model_comparison(rng)),
        "think_mode_comparison" => Some(think_mode_comparison(rng)),
        "user_type_comparison" => Some(user_type_comparison(rng)),
        "comprehensive" => Some(comprehensive()),
        other => QuestionCategory::from_str(other.strip_suffix("_test").unwrap_or(other))
            .map(category_specific),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_classify() {
        assert_eq!(
            QuestionCategory::classify("How to identify Dental Claim?"),
            QuestionCategory::ClaimsProcessing
        );
        assert_eq!(
            QuestionCategory::classify("How does Neo4j integration improve search results?"),
            QuestionCategory::TechnicalFeatures
        );
        assert_eq!(
            QuestionCategory::classify("Present on Admission Code"),
            QuestionCategory::DataFields
        );
        assert_eq!(
            QuestionCategory::classify("Explain External Stop Loss reporting requirements"),
            QuestionCategory::Compliance
        );
        assert_eq!(
            QuestionCategory::classify("How does error handling work?"),
            QuestionCategory::SystemArchitecture
        );
    }

    #[test]
    fn test_every_question_has_one_category() {
        let total: usize = QuestionCategory::ALL
            .iter()
            .map(|c| c.questions().len())
            .sum();
        assert_eq!(total, SAMPLE_QUESTIONS.len());
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!(
            QuestionCategory::from_str("data-fields"),
            Some(QuestionCategory::DataFields)
        );
        assert!(QuestionCategory::from_str("billing").is_none());
    }

    #[test]
    fn test_model_comparison_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = model_comparison(&mut rng);
        assert_eq!(config.models.len(), 4);
        assert_eq!(config.questions.len(), 15);
        assert_eq!(config.test_cases().unwrap().len(), 60);
        assert_eq!(config.kind, ConfigKind::ModelComparison);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let a = model_comparison(&mut StdRng::seed_from_u64(42));
        let b = model_comparison(&mut StdRng::seed_from_u64(42));
        assert_eq!(a.questions, b.questions);
    }

    #[test]
    fn test_comprehensive_skips_unsupported_think_mode() {
        let config = comprehensive();
        let cases = config.test_cases().unwrap();
        // 3 think models x 2 modes + 4 models x 1 mode, two user types, 28 questions, 3 times
        assert_eq!(cases.len(), (3 * 2 + 4) * 2 * 28 * 3);
        assert!(cases
            .iter()
            .filter(|c| c.think_mode)
            .all(|c| c.model.starts_with("gemini-2.5")));
    }

    #[test]
    fn test_default_templates_are_valid() {
        let mut rng = StdRng::seed_from_u64(1);
        let templates = default_templates(&mut rng);
        assert_eq!(templates.len(), 4 + QuestionCategory::ALL.len());
        for template in &templates {
            template.validate().unwrap();
        }
        let category = templates
            .iter()
            .find(|t| t.name == "compliance_test")
            .unwrap();
        assert_eq!(category.category.as_deref(), Some("compliance"));
    }

    #[test]
    fn test_by_name() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(by_name("comprehensive", &mut rng).is_some());
        assert_eq!(
            by_name("data_fields", &mut rng).unwrap().name,
            "data_fields_test"
        );
        assert!(by_name("unknown", &mut rng).is_none());
    }
}
