//! Facet enumeration and the facet generator.
//!
//! A visual description is expanded into exactly N captions, one per facet
//! name, in a single structured prompt round-trip. The result is all or
//! nothing: anything short of N non-empty captions is a parse failure.

use crate::error::IndexError;
use crate::llm::{LlmProvider, LlmRequest};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Default facet labels, in prompt order.
pub const DEFAULT_FACETS: &[&str] = &[
    "broad_concept",
    "broad_activity",
    "specific_entity",
    "spatial_description",
    "integrated_summary",
    "search_phrase",
    "alternate_search_phrase",
];

fn facet_guidance(name: &str) -> &'static str {
    match name {
        "broad_concept" => "A short, high-level caption summarizing the main idea or scene.",
        "broad_activity" => "A short caption describing the primary action or context.",
        "specific_entity" => {
            "A detailed caption (at least 50 words) on the key subject or object and its identifying traits."
        }
        "spatial_description" => {
            "A detailed caption on body position, layout and the physical arrangement of elements."
        }
        "integrated_summary" => {
            "A fluent summary (at least 50 words) combining subject, action and contextual details."
        }
        "mood" => "A short caption on the mood or atmosphere.",
        "color_style" => "A short caption on the dominant colors and visual style.",
        "notable_text" => "Any text visible in the image, or the word none.",
        "search_phrase" => "A very short phrase a user would likely type to find this image.",
        "alternate_search_phrase" => "Another, different very short phrase a user would likely search.",
        _ => "A caption describing the image from this perspective.",
    }
}

/// Lowercase, with spaces and hyphens folded to underscores.
pub fn normalize_facet_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// The fixed, ordered facet enumeration shared by the whole process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetNames(Vec<String>);

impl FacetNames {
    /// Validate an ordered list of labels: non-empty, snake_case, unique.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        if names.is_empty() {
            return Err("at least one facet name is required".to_string());
        }

        let mut seen = HashSet::new();
        let mut labels = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid {
                return Err(format!("facet name '{}' must be snake_case", name));
            }
            if !seen.insert(name.to_string()) {
                return Err(format!("duplicate facet name '{}'", name));
            }
            labels.push(name.to_string());
        }
        Ok(Self(labels))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }
}

impl Default for FacetNames {
    fn default() -> Self {
        Self(DEFAULT_FACETS.iter().map(|s| s.to_string()).collect())
    }
}

/// Exactly one caption per facet name, in facet order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetSet {
    captions: Vec<(String, String)>,
}

impl FacetSet {
    /// Build from (facet, caption) pairs, checking them against `names`.
    pub fn from_pairs(names: &FacetNames, pairs: Vec<(String, String)>) -> Result<Self, IndexError> {
        let mut by_name: BTreeMap<String, String> = BTreeMap::new();
        for (facet, caption) in pairs {
            if !names.contains(&facet) {
                return Err(IndexError::FacetParse(format!("unknown facet '{}'", facet)));
            }
            if caption.trim().is_empty() {
                return Err(IndexError::FacetParse(format!("facet '{}' is empty", facet)));
            }
            if by_name.insert(facet.clone(), caption.trim().to_string()).is_some() {
                return Err(IndexError::FacetParse(format!("facet '{}' appears twice", facet)));
            }
        }

        let mut captions = Vec::with_capacity(names.len());
        for name in names.iter() {
            match by_name.remove(name) {
                Some(caption) => captions.push((name.to_string(), caption)),
                None => return Err(IndexError::FacetParse(format!("missing facet '{}'", name))),
            }
        }
        Ok(Self { captions })
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    pub fn get(&self, facet: &str) -> Option<&str> {
        self.captions
            .iter()
            .find(|(name, _)| name == facet)
            .map(|(_, caption)| caption.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.captions.iter().map(|(n, c)| (n.as_str(), c.as_str()))
    }
}

/// Expands a description into a [`FacetSet`] through one LLM round-trip
pub struct FacetGenerator {
    llm: Arc<dyn LlmProvider>,
    names: FacetNames,
}

impl FacetGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, names: FacetNames) -> Self {
        Self { llm, names }
    }

    pub fn names(&self) -> &FacetNames {
        &self.names
    }

    pub async fn generate(&self, description: &str) -> Result<FacetSet, IndexError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(IndexError::FacetParse("description is empty".to_string()));
        }

        let request = LlmRequest::new(self.system_prompt(), format!(
            "Here is the description of the image:\n{}",
            description
        ))
        .json();

        // Transport failures on the captioning model count as describe errors
        let raw = self
            .llm
            .complete(&request)
            .await
            .map_err(IndexError::Describe)?;
        parse_facets(&raw, &self.names)
    }

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You generate {} semantically distinct captions for a vector search database from a detailed \
image description. The captions capture different levels of generality and perspective.\n\n\
Answer with a single JSON object with exactly these keys, each mapped to a non-empty string:\n",
            self.names.len()
        );
        for name in self.names.iter() {
            prompt.push_str(&format!("- \"{}\": {}\n", name, facet_guidance(name)));
        }
        prompt.push_str("Do not add other keys and do not number the captions.");
        prompt
    }
}

/// Validate raw model output into a [`FacetSet`].
///
/// Accepts a JSON object keyed by facet name or a JSON array of exactly N
/// strings in facet order, optionally wrapped in a markdown code fence.
pub fn parse_facets(raw: &str, names: &FacetNames) -> Result<FacetSet, IndexError> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| IndexError::FacetParse(format!("response is not JSON: {}", e)))?;

    let pairs = match value {
        Value::Object(map) => {
            if map.len() != names.len() {
                return Err(IndexError::FacetParse(format!(
                    "expected {} facets, got {}",
                    names.len(),
                    map.len()
                )));
            }
            map.into_iter()
                .map(|(key, value)| Ok((normalize_facet_name(&key), caption_text(&key, value)?)))
                .collect::<Result<Vec<_>, IndexError>>()?
        }
        Value::Array(items) => {
            if items.len() != names.len() {
                return Err(IndexError::FacetParse(format!(
                    "expected {} captions, got {}",
                    names.len(),
                    items.len()
                )));
            }
            names
                .iter()
                .zip(items)
                .map(|(name, value)| Ok((name.to_string(), caption_text(name, value)?)))
                .collect::<Result<Vec<_>, IndexError>>()?
        }
        other => {
            return Err(IndexError::FacetParse(format!(
                "expected a JSON object or array, got {}",
                other
            )))
        }
    };

    FacetSet::from_pairs(names, pairs)
}

fn caption_text(facet: &str, value: Value) -> Result<String, IndexError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(IndexError::FacetParse(format!(
            "facet '{}' is not a string: {}",
            facet, other
        ))),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
