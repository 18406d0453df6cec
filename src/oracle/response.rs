//! Oracle Response Schema
//!
//! The oracle's text is untrusted. It is parsed into a lenient wire struct,
//! then validated into [`OracleResponse`], whose [`OracleTurn`] only carries
//! the fields that make sense for its status. Safe repairs (recovered
//! message text, options derived from subcategories, field truncation)
//! happen here; anything else is an enumerated [`ValidationError`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::funnel::{DichotomyNode, DichotomyPool};
use crate::utils::truncate_chars;

pub const MESSAGE_MAX: usize = 120;
pub const QUESTION_MAX: usize = 100;
pub const SUBCATEGORY_MAX: usize = 40;
pub const OPTION_MAX: usize = 60;
pub const MAX_SUBCATEGORIES: usize = 8;

const FALLBACK_MESSAGE: &str = "Voyons voir…";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no JSON object found in oracle output")]
    NoJson,
    #[error("oracle output is not valid JSON: {0}")]
    Json(String),
    #[error("unknown statut {0:?}")]
    UnknownStatut(String),
    #[error("statut missing and not inferable")]
    MissingStatut,
    #[error("en_cours response without a question")]
    MissingQuestion,
    #[error("en_cours response without options or subcategories")]
    MissingOptions,
    #[error("finalized response without recommandation_finale")]
    MissingRecommendation,
    #[error("dichotomy pool has no usable duel")]
    EmptyDichotomy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statut {
    #[serde(rename = "en_cours")]
    EnCours,
    #[serde(rename = "finalisé")]
    Finalise,
    #[serde(rename = "épuisé")]
    Epuise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Questionnement,
    Pivot,
    Breakout,
    Resultat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelOptions {
    #[serde(rename = "A", alias = "a", default)]
    pub a: String,
    #[serde(rename = "B", alias = "b", default)]
    pub b: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default)]
    pub titre: String,
    #[serde(default)]
    pub explication: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub pivot_count: u32,
    #[serde(default)]
    pub current_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

/// What the oracle asked for this turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleTurn {
    /// Keep narrowing. `subcategories` is the sibling pool when the oracle
    /// enumerated one; otherwise the pool is just `options`.
    Question {
        question: String,
        options: DuelOptions,
        subcategories: Vec<String>,
    },
    Finalized { recommendation: Recommendation },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawResponse", try_from = "RawResponse")]
pub struct OracleResponse {
    pub message: String,
    pub phase: Phase,
    pub metadata: Metadata,
    pub turn: OracleTurn,
}

impl OracleResponse {
    pub fn statut(&self) -> Statut {
        match self.turn {
            OracleTurn::Question { .. } => Statut::EnCours,
            OracleTurn::Finalized { .. } => Statut::Finalise,
            OracleTurn::Exhausted => Statut::Epuise,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self.turn, OracleTurn::Finalized { .. })
    }

    pub fn recommendation(&self) -> Option<&Recommendation> {
        match &self.turn {
            OracleTurn::Finalized { recommendation } => Some(recommendation),
            _ => None,
        }
    }

    /// Labels to duel over locally: the subcategories when present, else A/B.
    pub fn pool(&self) -> Vec<String> {
        match &self.turn {
            OracleTurn::Question { options, subcategories, .. } => {
                if subcategories.len() >= 2 {
                    subcategories.clone()
                } else {
                    vec![options.a.clone(), options.b.clone()]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Compact JSON form used when replaying the conversation to the oracle.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Wire shape, every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    statut: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mogogo_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subcategories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<DuelOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recommandation_finale: Option<Recommendation>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

fn fold(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .replace(['é', 'è', 'ê'], "e")
        .replace(' ', "_")
}

fn parse_statut(raw: &str) -> Result<Statut, ValidationError> {
    match fold(raw).as_str() {
        "en_cours" => Ok(Statut::EnCours),
        "finalise" => Ok(Statut::Finalise),
        "epuise" => Ok(Statut::Epuise),
        _ => Err(ValidationError::UnknownStatut(raw.to_string())),
    }
}

fn parse_phase(raw: &str) -> Option<Phase> {
    match fold(raw).as_str() {
        "questionnement" => Some(Phase::Questionnement),
        "pivot" => Some(Phase::Pivot),
        "breakout" => Some(Phase::Breakout),
        "resultat" => Some(Phase::Resultat),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn clean_subcategories(raw: Option<Vec<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let labels: Vec<String> = raw
        .unwrap_or_default()
        .into_iter()
        .map(|s| truncate_chars(&s, SUBCATEGORY_MAX))
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(MAX_SUBCATEGORIES)
        .collect();
    if labels.len() < 2 {
        Vec::new()
    } else {
        labels
    }
}

fn clean_recommendation(rec: Recommendation) -> Option<Recommendation> {
    let titre = rec.titre.trim().to_string();
    if titre.is_empty() {
        return None;
    }
    let actions = rec
        .actions
        .into_iter()
        .filter(|a| !a.label.trim().is_empty() && !a.query.trim().is_empty())
        .collect();
    let tags = rec
        .tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    Some(Recommendation { titre, explication: rec.explication.trim().to_string(), actions, tags })
}

impl TryFrom<RawResponse> for OracleResponse {
    type Error = ValidationError;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let message = non_empty(raw.mogogo_message);
        let question = non_empty(raw.question);
        let subcategories = clean_subcategories(raw.subcategories);

        let statut = match raw.statut.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => parse_statut(s)?,
            None if raw.recommandation_finale.is_some() => Statut::Finalise,
            None if question.is_some() || raw.options.is_some() || !subcategories.is_empty() => Statut::EnCours,
            None => return Err(ValidationError::MissingStatut),
        };

        let turn = match statut {
            Statut::Finalise => {
                let recommendation = raw
                    .recommandation_finale
                    .and_then(clean_recommendation)
                    .ok_or(ValidationError::MissingRecommendation)?;
                OracleTurn::Finalized { recommendation }
            }
            Statut::Epuise => OracleTurn::Exhausted,
            Statut::EnCours => {
                let question = question
                    .clone()
                    .or_else(|| message.clone())
                    .ok_or(ValidationError::MissingQuestion)?;

                let from_pool = |i: usize| subcategories.get(i).cloned();
                let (a, b) = match raw.options {
                    Some(opts) => (non_empty(Some(opts.a)), non_empty(Some(opts.b))),
                    None => (None, None),
                };
                let a = a.or_else(|| from_pool(0));
                let b = b.or_else(|| from_pool(1));
                let options = match (a, b) {
                    (Some(a), Some(b)) => DuelOptions {
                        a: truncate_chars(&a, OPTION_MAX),
                        b: truncate_chars(&b, OPTION_MAX),
                    },
                    (Some(a), None) => DuelOptions {
                        a: truncate_chars(&a, OPTION_MAX),
                        b: "Autre chose".to_string(),
                    },
                    (None, Some(b)) => DuelOptions {
                        a: "Autre chose".to_string(),
                        b: truncate_chars(&b, OPTION_MAX),
                    },
                    (None, None) => return Err(ValidationError::MissingOptions),
                };

                OracleTurn::Question {
                    question: truncate_chars(&question, QUESTION_MAX),
                    options,
                    subcategories,
                }
            }
        };

        let message = message
            .or(question)
            .or_else(|| match &turn {
                OracleTurn::Finalized { recommendation } => Some(recommendation.titre.clone()),
                _ => None,
            })
            .unwrap_or_else(|| FALLBACK_MESSAGE.to_string());

        let phase = raw.phase.as_deref().and_then(parse_phase).unwrap_or(match turn {
            OracleTurn::Finalized { .. } => Phase::Resultat,
            _ => Phase::Questionnement,
        });

        Ok(OracleResponse {
            message: truncate_chars(&message, MESSAGE_MAX),
            phase,
            metadata: raw.metadata.unwrap_or_default(),
            turn,
        })
    }
}

impl From<OracleResponse> for RawResponse {
    fn from(response: OracleResponse) -> Self {
        let statut = match response.statut() {
            Statut::EnCours => "en_cours",
            Statut::Finalise => "finalisé",
            Statut::Epuise => "épuisé",
        };
        let phase = serde_json::to_value(response.phase)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));

        let mut raw = RawResponse {
            statut: Some(statut.to_string()),
            phase,
            mogogo_message: Some(response.message),
            metadata: Some(response.metadata),
            ..RawResponse::default()
        };
        match response.turn {
            OracleTurn::Question { question, options, subcategories } => {
                raw.question = Some(question);
                raw.options = Some(options);
                if !subcategories.is_empty() {
                    raw.subcategories = Some(subcategories);
                }
            }
            OracleTurn::Finalized { recommendation } => raw.recommandation_finale = Some(recommendation),
            OracleTurn::Exhausted => {}
        }
        raw
    }
}

/// Find the first balanced `{...}` block that parses as JSON. Braces inside
/// string literals are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, &c) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Some(end) = end {
            let candidate = &text[start..end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

fn parse_lenient<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ValidationError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }
    let json = extract_json_object(trimmed).ok_or(ValidationError::NoJson)?;
    serde_json::from_str::<T>(json).map_err(|e| ValidationError::Json(e.to_string()))
}

/// Parse and validate one oracle reply.
pub fn parse_oracle_output(text: &str) -> Result<OracleResponse, ValidationError> {
    let raw: RawResponse = parse_lenient(text)?;
    OracleResponse::try_from(raw)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDichotomyNode {
    #[serde(default)]
    question: String,
    #[serde(default)]
    label_a: String,
    #[serde(default)]
    label_b: String,
    #[serde(default)]
    ids_a: Vec<String>,
    #[serde(default)]
    ids_b: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDichotomyPool {
    #[serde(default)]
    mogogo_message: Option<String>,
    #[serde(default)]
    duels: Vec<RawDichotomyNode>,
}

/// Parse a dichotomy pool, keeping only ids in `known_ids` and dropping
/// duels left with an empty label or side.
pub fn parse_dichotomy_pool(text: &str, known_ids: &HashSet<String>) -> Result<DichotomyPool, ValidationError> {
    let raw: RawDichotomyPool = parse_lenient(text)?;

    let keep = |ids: Vec<String>| -> Vec<String> {
        let mut seen = HashSet::new();
        ids.into_iter()
            .filter(|id| known_ids.contains(id) && seen.insert(id.clone()))
            .collect()
    };

    let duels: Vec<DichotomyNode> = raw
        .duels
        .into_iter()
        .filter_map(|d| {
            let label_a = truncate_chars(&d.label_a, OPTION_MAX);
            let label_b = truncate_chars(&d.label_b, OPTION_MAX);
            let ids_a = keep(d.ids_a);
            let ids_b = keep(d.ids_b);
            if label_a.is_empty() || label_b.is_empty() || ids_a.is_empty() || ids_b.is_empty() {
                return None;
            }
            let question = non_empty(Some(d.question))
                .unwrap_or_else(|| format!("{} ou {} ?", label_a, label_b));
            Some(DichotomyNode {
                question: truncate_chars(&question, QUESTION_MAX),
                label_a,
                label_b,
                ids_a,
                ids_b,
            })
        })
        .collect();

    if duels.is_empty() {
        return Err(ValidationError::EmptyDichotomy);
    }

    let message = non_empty(raw.mogogo_message).unwrap_or_else(|| FALLBACK_MESSAGE.to_string());
    Ok(DichotomyPool { message: truncate_chars(&message, MESSAGE_MAX), duels })
}
