//! Keyword relevance matching
//!
//! Pure and deterministic: the same keywords, operator and text always
//! produce the same result.
//! - Text and keywords are lowercased and stripped of Spanish diacritics
//! - Each keyword expands to a synonym group from a fixed domain table
//! - Matching is whole-word over title, description and organization
//! - Score rewards coverage, title presence and repetition, clamped to 1.0

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::error::MonitorError;
use crate::schemas::CandidateRecord;

/// Domain synonym table, already normalized. Lookup order matters.
const SYNONYM_GROUPS: &[(&str, &[&str])] = &[
    (
        "forense",
        &["forense", "forenses", "pericia", "pericias", "criminalistica"],
    ),
    ("laboratorio", &["laboratorio", "laboratorios", "lab"]),
    ("dna", &["adn", "dna", "genetico", "genomica"]),
    ("balistica", &["balistica", "proyectil", "armas"]),
    (
        "software",
        &["software", "sistema", "aplicacion", "plataforma", "programa"],
    ),
    (
        "caligrafo",
        &["caligrafo", "grafologo", "grafologia", "caligrafia"],
    ),
    ("investigacion", &["investigacion", "indagatoria"]),
];

const TITLE_BONUS_PER_KEYWORD: f64 = 0.10;
const FREQUENCY_BONUS_PER_HIT: f64 = 0.02;
const MAX_FREQUENCY_BONUS: f64 = 0.20;
const HIGHLIGHT_RADIUS: usize = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchOperator {
    And,
    #[default]
    Or,
}

impl FromStr for MatchOperator {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AND" => Ok(MatchOperator::And),
            "OR" => Ok(MatchOperator::Or),
            other => Err(MonitorError::InvalidConfig(format!(
                "unknown match operator: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Keywords found, as configured (not normalized)
    pub keywords_found: Vec<String>,
    pub score: f64,
    /// Context windows around title hits
    pub highlights: Vec<String>,
}

impl MatchResult {
    fn empty() -> Self {
        Self {
            matched: false,
            keywords_found: Vec::new(),
            score: 0.0,
            highlights: Vec::new(),
        }
    }
}

/// Lowercases and folds á é í ó ú ü ñ to their plain forms
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Synonyms for an already-normalized keyword, excluding the keyword itself
fn synonyms_for(keyword: &str) -> Vec<&'static str> {
    SYNONYM_GROUPS
        .iter()
        .find(|(key, group)| group.contains(&keyword) || keyword.contains(key))
        .map(|(_, group)| group.iter().copied().filter(|s| *s != keyword).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
enum Pattern {
    Words(Regex),
    /// Used when the word pattern cannot be compiled
    Substring(String),
}

impl Pattern {
    fn find(&self, text: &str) -> Option<(usize, usize)> {
        match self {
            Pattern::Words(re) => re.find(text).map(|m| (m.start(), m.end())),
            Pattern::Substring(term) => text.find(term.as_str()).map(|s| (s, s + term.len())),
        }
    }

    fn count(&self, text: &str) -> usize {
        match self {
            Pattern::Words(re) => re.find_iter(text).count(),
            Pattern::Substring(term) => text.matches(term.as_str()).count(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledKeyword {
    keyword: String,
    pattern: Pattern,
}

impl CompiledKeyword {
    fn compile(keyword: &str, normalized: &str) -> Self {
        let mut terms: Vec<String> = std::iter::once(normalized.to_string())
            .chain(synonyms_for(normalized).into_iter().map(str::to_string))
            .collect();
        terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        terms.dedup();

        let alternation = terms
            .iter()
            .map(|t| format!(r"\b{}\b", regex::escape(t)))
            .collect::<Vec<_>>()
            .join("|");

        let pattern = match Regex::new(&format!("(?i){alternation}")) {
            Ok(re) => Pattern::Words(re),
            Err(e) => {
                warn!(keyword = %keyword, error = %e, "Keyword pattern rejected, using substring search");
                Pattern::Substring(normalized.to_string())
            }
        };

        Self {
            keyword: keyword.to_string(),
            pattern,
        }
    }
}

/// Matcher built once per run from the run's keyword snapshot
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<CompiledKeyword>,
    operator: MatchOperator,
}

impl KeywordMatcher {
    /// Builds a matcher. Blank keywords are ignored and keywords that
    /// normalize to the same text collapse onto the first occurrence.
    pub fn new<S: AsRef<str>>(keywords: &[S], operator: MatchOperator) -> Self {
        let mut seen = std::collections::HashSet::new();
        let keywords = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .filter_map(|k| {
                let normalized = normalize(k);
                seen.insert(normalized.clone())
                    .then(|| CompiledKeyword::compile(k, &normalized))
            })
            .collect();

        Self { keywords, operator }
    }

    pub fn operator(&self) -> MatchOperator {
        self.operator
    }

    /// Number of distinct keywords in play
    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Evaluates a record's text against the configured keywords
    pub fn evaluate(
        &self,
        title: &str,
        description: Option<&str>,
        organization: Option<&str>,
    ) -> MatchResult {
        if self.keywords.is_empty() {
            return MatchResult::empty();
        }

        let title_norm = normalize(title);
        let full_text = [
            title_norm.clone(),
            normalize(description.unwrap_or_default()),
            normalize(organization.unwrap_or_default()),
        ]
        .join(" ");

        let mut keywords_found = Vec::new();
        let mut highlights = Vec::new();
        let mut title_hits = 0usize;
        let mut total_hits = 0usize;

        for kw in &self.keywords {
            if kw.pattern.find(&full_text).is_none() {
                continue;
            }
            keywords_found.push(kw.keyword.clone());
            total_hits += kw.pattern.count(&full_text);

            if let Some((start, end)) = kw.pattern.find(&title_norm) {
                title_hits += 1;
                highlights.push(context_window(&title_norm, start, end, HIGHLIGHT_RADIUS));
            }
        }

        let matched = match self.operator {
            MatchOperator::And => keywords_found.len() == self.keywords.len(),
            MatchOperator::Or => !keywords_found.is_empty(),
        };

        let score = if keywords_found.is_empty() {
            0.0
        } else {
            let base = keywords_found.len() as f64 / self.keywords.len().max(1) as f64;
            let title_bonus = TITLE_BONUS_PER_KEYWORD * title_hits as f64;
            let freq_bonus = (FREQUENCY_BONUS_PER_HIT * total_hits as f64).min(MAX_FREQUENCY_BONUS);
            (base + title_bonus + freq_bonus).min(1.0)
        };

        MatchResult {
            matched,
            keywords_found,
            score,
            highlights,
        }
    }

    /// Evaluates a candidate's title, description and organization
    pub fn evaluate_candidate(&self, candidate: &CandidateRecord) -> MatchResult {
        self.evaluate(
            &candidate.title,
            candidate.description.as_deref(),
            candidate.organization.as_deref(),
        )
    }
}

/// Window of `radius` chars around a byte span, with "..." where cut
fn context_window(text: &str, start: usize, end: usize, radius: usize) -> String {
    let prefix_chars = text[..start].chars().count();
    let match_chars = text[start..end].chars().count();
    let total_chars = prefix_chars + text[start..].chars().count();

    let from = prefix_chars.saturating_sub(radius);
    let to = (prefix_chars + match_chars + radius).min(total_chars);
    let window: String = text.chars().skip(from).take(to - from).collect();

    format!(
        "{}{}{}",
        if from > 0 { "..." } else { "" },
        window,
        if to < total_chars { "..." } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(keywords: &[&str], operator: MatchOperator) -> KeywordMatcher {
        KeywordMatcher::new(keywords, operator)
    }

    #[test]
    fn test_normalize_folds_diacritics() {
        assert_eq!(normalize("Balística y Dactiloscopía"), "balistica y dactiloscopia");
        assert_eq!(normalize("ÑANDÚ Pingüino"), "nandu pinguino");
    }

    #[test]
    fn test_or_matches_any_keyword() {
        let m = matcher(&["luminol", "microscopio"], MatchOperator::Or);
        let result = m.evaluate("Compra de microscopio", None, None);
        assert!(result.matched);
        assert_eq!(result.keywords_found, vec!["microscopio"]);
    }

    #[test]
    fn test_and_requires_every_keyword() {
        let m = matcher(&["forense", "ADN"], MatchOperator::And);
        let result = m.evaluate("Equipamiento forense para laboratorio", None, None);
        assert!(!result.matched);
        assert_eq!(result.keywords_found, vec!["forense"]);

        let m = matcher(&["forense", "ADN"], MatchOperator::Or);
        assert!(m.evaluate("Equipamiento forense para laboratorio", None, None).matched);
    }

    #[test]
    fn test_synonyms_expand_keyword() {
        let m = matcher(&["ADN"], MatchOperator::Or);
        let result = m.evaluate("Secuenciador genético", None, None);
        assert!(result.matched);
        assert_eq!(result.keywords_found, vec!["ADN"]);

        // group key contained in a multi-word keyword
        let m = matcher(&["laboratorio forense"], MatchOperator::Or);
        assert!(m.evaluate("Servicio de pericias", None, None).matched);
    }

    #[test]
    fn test_whole_word_only() {
        let m = matcher(&["lab"], MatchOperator::Or);
        assert!(!m.evaluate("Labores de limpieza", None, None).matched);
        assert!(m.evaluate("Insumos de lab central", None, None).matched);
    }

    #[test]
    fn test_description_and_organization_are_searched() {
        let m = matcher(&["toxicologia"], MatchOperator::Or);
        let result = m.evaluate(
            "Licitación pública 12/2024",
            Some("Reactivos para toxicología"),
            None,
        );
        assert!(result.matched);
        assert!(result.highlights.is_empty());

        let result = m.evaluate("Compra", None, Some("Instituto de Toxicología"));
        assert!(result.matched);
    }

    #[test]
    fn test_score_components() {
        // one of two keywords, only in description, one hit:
        // 0.5 + 0 + 0.02
        let m = matcher(&["luminol", "microscopio"], MatchOperator::Or);
        let result = m.evaluate("Licitación", Some("provisión de luminol"), None);
        assert!((result.score - 0.52).abs() < 1e-9);

        // same keyword in the title adds the title bonus and a second hit
        let result = m.evaluate("Luminol", Some("provisión de luminol"), None);
        assert!((result.score - (0.5 + 0.1 + 0.04)).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_monotonic_and_clamped() {
        let m = matcher(&["luminol", "microscopio", "balistica"], MatchOperator::Or);
        let one = m.evaluate("luminol", None, None).score;
        let two = m.evaluate("luminol y microscopio", None, None).score;
        let three = m
            .evaluate(
                "luminol microscopio balística",
                Some("luminol ".repeat(30).as_str()),
                None,
            )
            .score;

        assert!(one < two);
        assert!(two <= three);
        assert!(three <= 1.0);
        assert_eq!(three, 1.0);
    }

    #[test]
    fn test_no_match_scores_zero() {
        let m = matcher(&["luminol"], MatchOperator::Or);
        let result = m.evaluate("Compra de resmas", Some("papel A4"), None);
        assert!(!result.matched);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_empty_keyword_list_never_matches() {
        let m = matcher(&[], MatchOperator::And);
        let result = m.evaluate("forense forense forense", None, None);
        assert!(!result.matched);
        assert_eq!(result.score, 0.0);

        let m = matcher(&["   "], MatchOperator::Or);
        assert!(m.is_empty());
    }

    #[test]
    fn test_duplicate_keywords_collapse() {
        let m = matcher(&["Balística", "balistica"], MatchOperator::And);
        assert_eq!(m.len(), 1);
        let result = m.evaluate("Peritaje de balística", None, None);
        assert!(result.matched);
        assert_eq!(result.keywords_found, vec!["Balística"]);
    }

    #[test]
    fn test_highlight_window() {
        let m = matcher(&["luminol"], MatchOperator::Or);
        let title = format!("{} luminol {}", "a".repeat(60), "b".repeat(60));
        let result = m.evaluate(&title, None, None);
        let hl = &result.highlights[0];
        assert!(hl.starts_with("..."));
        assert!(hl.ends_with("..."));
        assert!(hl.contains("luminol"));
        assert_eq!(hl.chars().count(), 3 + 40 + 7 + 40 + 3);

        let result = m.evaluate("Luminol", None, None);
        assert_eq!(result.highlights, vec!["luminol"]);
    }

    #[test]
    fn test_deterministic() {
        let m = matcher(&["software forense", "pericias"], MatchOperator::Or);
        let a = m.evaluate("Software de pericias informáticas", Some("plataforma"), None);
        let b = m.evaluate("Software de pericias informáticas", Some("plataforma"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("and".parse::<MatchOperator>().unwrap(), MatchOperator::And);
        assert_eq!(" OR ".parse::<MatchOperator>().unwrap(), MatchOperator::Or);
        assert!("xor".parse::<MatchOperator>().is_err());
    }
}
