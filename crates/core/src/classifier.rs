//! Maps product or plan names to conversion campaigns by ordered substring
//! rules. Earlier rules win, so specific terms must precede broad ones.

use serde::{Deserialize, Serialize};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::normalize::ConversionStage;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRule {
    pub term: String,
    pub campaign: String,
}

impl ConversionRule {
    pub fn new(term: impl Into<String>, campaign: impl Into<String>) -> Self {
        Self { term: term.into(), campaign: campaign.into() }
    }
}

/// A conversion campaign as configured in the CRM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub label: String,
    pub identifier: String,
}

impl Campaign {
    fn from_label(label: &str) -> Self {
        Self { label: label.to_string(), identifier: slugify(label) }
    }

    /// Identifier sent to the CRM for this campaign at the given funnel stage.
    pub fn stage_identifier(&self, stage: ConversionStage) -> String {
        slugify(&format!("{} {}", self.label, stage.label()))
    }
}

#[derive(Clone, Debug)]
pub struct ConversionClassifier {
    rules: Vec<(String, Campaign)>,
}

pub fn default_rules() -> Vec<ConversionRule> {
    vec![
        ConversionRule::new("infecção hospitalar", "Pós-graduação ccih"),
        ConversionRule::new("ortoped", "Pós-graduação Orto"),
        ConversionRule::new("imunodeprimido", "Pós-graduação Imuno"),
        ConversionRule::new("inunodeprimido", "Pós-graduação Imuno"),
        ConversionRule::new("pediatria", "Pós-graduação Pediatria"),
        ConversionRule::new("multi-r", "Jornada Multi-R"),
        ConversionRule::new("ccih", "Pós-graduação ccih"),
    ]
}

impl Default for ConversionClassifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ConversionClassifier {
    /// Builds a classifier; rule terms go through the same text normalization
    /// as classified input. Blank terms are dropped.
    pub fn new(rules: impl IntoIterator<Item = ConversionRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|rule| {
                let term = normalize_text(&rule.term);
                (!term.trim().is_empty()).then(|| (term, Campaign::from_label(&rule.campaign)))
            })
            .collect();
        Self { rules }
    }

    pub fn classify(&self, text: &str) -> Option<&Campaign> {
        let normalized = normalize_text(text);
        self.rules
            .iter()
            .find(|(term, _)| normalized.contains(term.as_str()))
            .map(|(_, campaign)| campaign)
    }

    /// CRM identifier for `text` at `stage`, or `None` when nothing matches.
    pub fn conversion_identifier(&self, text: &str, stage: ConversionStage) -> Option<String> {
        self.classify(text).map(|campaign| campaign.stage_identifier(stage))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Lower-cases and strips diacritics.
pub fn normalize_text(text: &str) -> String {
    text.nfd().filter(|ch| !is_combining_mark(*ch)).collect::<String>().to_lowercase()
}

/// `"Pós-graduação ccih"` -> `"pos-graduacao-ccih"`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for ch in normalize_text(text).chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }

    slug
}
