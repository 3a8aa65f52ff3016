//! Collaborator mention detection inside review comments.
//!
//! Three detection tiers, all case-insensitive: the active roster (full names
//! and aliases), a curated name list from `rules/matcher.yaml`, and a generic
//! two-capitalized-word pattern for names nobody registered yet. Detected
//! names canonicalize to the closest roster entry when the spelling is an
//! accent or transliteration variant.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use revmon_core::{CollaboratorMention, CollaboratorProfile};
use serde::Deserialize;
use strsim::jaro_winkler;

/// Comments shorter than this carry too little signal to match against.
const MIN_COMMENT_CHARS: usize = 10;

/// Similarity floor for collapsing a detected name onto a roster entry.
const CANONICALIZE_THRESHOLD: f64 = 0.90;

const BASE_CONFIDENCE: f64 = 0.5;
const KNOWN_NAME_BONUS: f64 = 0.3;
const POSITIVE_CONTEXT_BONUS: f64 = 0.2;
const SHORT_MATCH_PENALTY: f64 = 0.1;
const SHORT_MATCH_CHARS: usize = 6;

const SNIPPET_CONTEXT_CHARS: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    curated_names: Vec<String>,
    #[serde(default)]
    positive_keywords: Vec<String>,
}

/// Matching knobs that live outside the database. Curated names cover staff
/// the roster does not track yet; positive keywords raise confidence when
/// the comment praises someone.
#[derive(Debug, Clone)]
pub struct MatcherRules {
    pub curated_names: Vec<String>,
    pub positive_keywords: Vec<String>,
}

impl Default for MatcherRules {
    fn default() -> Self {
        Self {
            curated_names: Vec::new(),
            positive_keywords: [
                "excelente",
                "ótimo",
                "muito bom",
                "profissional",
                "atencioso",
                "eficiente",
                "competente",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl MatcherRules {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: MatcherRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let defaults = Self::default();
        Ok(Self {
            curated_names: file.curated_names,
            positive_keywords: if file.positive_keywords.is_empty() {
                defaults.positive_keywords
            } else {
                file.positive_keywords
            },
        })
    }

    /// File rules when the path exists, built-in defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

pub struct CollaboratorMatcher {
    rules: MatcherRules,
    name_pattern: Regex,
}

impl CollaboratorMatcher {
    pub fn new(rules: MatcherRules) -> Self {
        // Two consecutive capitalized words, Portuguese letters included.
        let name_pattern = Regex::new(
            r"\b[A-ZÁÀÂÃÉÊÍÓÔÕÚÜÇ][a-záàâãéêíóôõúüç]+\s+[A-ZÁÀÂÃÉÊÍÓÔÕÚÜÇ][a-záàâãéêíóôõúüç]+",
        )
        .expect("name pattern is valid");
        Self { rules, name_pattern }
    }

    /// Detect mentions in one comment against the active roster. Each
    /// distinct person yields at most one mention.
    pub fn find_mentions(
        &self,
        comment: &str,
        roster: &[CollaboratorProfile],
    ) -> Vec<CollaboratorMention> {
        if comment.chars().count() < MIN_COMMENT_CHARS {
            return Vec::new();
        }
        let lowered = comment.to_lowercase();
        let positive_context = self
            .rules
            .positive_keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()));

        let mut seen: HashSet<String> = HashSet::new();
        let mut mentions = Vec::new();

        // Tier 1: roster full names and aliases.
        for profile in roster.iter().filter(|p| p.is_active) {
            let candidates = std::iter::once(profile.full_name.as_str())
                .chain(profile.aliases.iter().map(String::as_str));
            for candidate in candidates {
                if let Some(start) = find_ci(comment, &lowered, candidate) {
                    self.push_mention(
                        &mut mentions,
                        &mut seen,
                        comment,
                        start,
                        candidate,
                        profile.full_name.clone(),
                        true,
                        positive_context,
                    );
                    break;
                }
            }
        }

        // Tier 2: curated names not (yet) on the roster.
        for name in &self.rules.curated_names {
            if let Some(start) = find_ci(comment, &lowered, name) {
                let canonical = self.canonicalize(name, roster).unwrap_or_else(|| name.clone());
                self.push_mention(
                    &mut mentions,
                    &mut seen,
                    comment,
                    start,
                    name,
                    canonical,
                    true,
                    positive_context,
                );
            }
        }

        // Tier 3: generic capitalized-pair candidates.
        for found in self.name_pattern.find_iter(comment) {
            let candidate = found.as_str();
            let (canonical, known) = match self.canonicalize(candidate, roster) {
                Some(full_name) => (full_name, true),
                None => (candidate.to_string(), false),
            };
            self.push_mention(
                &mut mentions,
                &mut seen,
                comment,
                found.start(),
                candidate,
                canonical,
                known,
                positive_context,
            );
        }

        mentions
    }

    #[allow(clippy::too_many_arguments)]
    fn push_mention(
        &self,
        mentions: &mut Vec<CollaboratorMention>,
        seen: &mut HashSet<String>,
        comment: &str,
        match_start: usize,
        matched_text: &str,
        canonical_name: String,
        known: bool,
        positive_context: bool,
    ) {
        if !seen.insert(canonical_name.to_lowercase()) {
            return;
        }
        let mut confidence = BASE_CONFIDENCE;
        if known {
            confidence += KNOWN_NAME_BONUS;
        }
        if positive_context {
            confidence += POSITIVE_CONTEXT_BONUS;
        }
        if matched_text.chars().count() < SHORT_MATCH_CHARS {
            confidence -= SHORT_MATCH_PENALTY;
        }
        mentions.push(CollaboratorMention {
            name: canonical_name,
            snippet: snippet_around(comment, match_start, match_start + matched_text.len()),
            confidence: confidence.clamp(0.0, 1.0),
        });
    }

    /// Collapse a detected name onto a roster full name when the folded
    /// spellings are near-identical ("Ana Sofia" vs "Ana Sophia").
    fn canonicalize(&self, name: &str, roster: &[CollaboratorProfile]) -> Option<String> {
        let folded = fold_for_compare(name);
        roster
            .iter()
            .filter(|p| p.is_active)
            .map(|p| (jaro_winkler(&folded, &fold_for_compare(&p.full_name)), p))
            .filter(|(score, _)| *score >= CANONICALIZE_THRESHOLD)
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, profile)| profile.full_name.clone())
    }
}

/// Byte offset of a case-insensitive occurrence, or None. `lowered` must be
/// `haystack.to_lowercase()`; offsets in the lowered string are only used
/// after snapping to a char boundary of the original.
fn find_ci(haystack: &str, lowered: &str, needle: &str) -> Option<usize> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let pos = lowered.find(&needle)?;
    Some(snap_to_boundary(haystack, pos))
}

fn snap_to_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Context window around a match, expanded to char boundaries so accented
/// text never splits mid-codepoint.
pub fn snippet_around(text: &str, start: usize, end: usize) -> String {
    let start = snap_to_boundary(text, start);
    let end = snap_to_boundary(text, end.min(text.len()));

    let snippet_start = text[..start]
        .char_indices()
        .rev()
        .nth(SNIPPET_CONTEXT_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let snippet_end = text[end..]
        .char_indices()
        .nth(SNIPPET_CONTEXT_CHARS)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());

    text[snippet_start..snippet_end].trim().to_string()
}

/// Lowercase and strip the diacritics common in Portuguese so accent
/// variants compare equal.
pub fn fold_for_compare(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<CollaboratorProfile> {
        vec![
            CollaboratorProfile {
                id: Some(1),
                full_name: "Ana Sophia".to_string(),
                department: "E-notariado".to_string(),
                position: Some("Escrevente".to_string()),
                is_active: true,
                aliases: vec!["Ana Sophia".to_string(), "Ana S.".to_string()],
            },
            CollaboratorProfile {
                id: Some(2),
                full_name: "Karen Figueiredo".to_string(),
                department: "Atendimento".to_string(),
                position: None,
                is_active: true,
                aliases: vec![],
            },
            CollaboratorProfile {
                id: Some(3),
                full_name: "Pedro Inativo".to_string(),
                department: "Atendimento".to_string(),
                position: None,
                is_active: false,
                aliases: vec![],
            },
        ]
    }

    fn matcher() -> CollaboratorMatcher {
        CollaboratorMatcher::new(MatcherRules::default())
    }

    #[test]
    fn roster_name_with_praise_scores_high() {
        let mentions = matcher().find_mentions("Ana Sophia foi excelente!", &roster());
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].name, "Ana Sophia");
        assert!(mentions[0].confidence >= 0.8, "got {}", mentions[0].confidence);
        assert!(mentions[0].snippet.contains("Ana Sophia"));
    }

    #[test]
    fn no_names_means_no_mentions() {
        let mentions = matcher().find_mentions("Ótimo atendimento, sem menção a ninguém.", &roster());
        assert!(mentions.is_empty());
    }

    #[test]
    fn comment_below_minimum_length_is_skipped() {
        // "Ana S." is a roster alias but the comment is too short to trust.
        let mentions = matcher().find_mentions("Ana S.", &roster());
        assert!(mentions.is_empty());
    }

    #[test]
    fn accent_variant_canonicalizes_to_roster_name() {
        let mentions = matcher().find_mentions("A Ana Sofia resolveu tudo rapidamente.", &roster());
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].name, "Ana Sophia");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mentions = matcher().find_mentions("atendido pela KAREN FIGUEIREDO hoje", &roster());
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].name, "Karen Figueiredo");
    }

    #[test]
    fn inactive_roster_entries_get_no_known_bonus() {
        // The capitalized pair is still detected, but it must not count as a
        // known name while the profile is inactive.
        let mentions = matcher().find_mentions("O Pedro Inativo me atendeu hoje cedo.", &roster());
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].name, "Pedro Inativo");
        assert!(mentions[0].confidence <= 0.5);
    }

    #[test]
    fn unknown_capitalized_pair_is_a_low_confidence_mention() {
        let mentions = matcher().find_mentions("Fui atendido por Carlos Mendes ontem.", &roster());
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].name, "Carlos Mendes");
        assert!(mentions[0].confidence < 0.8);
    }

    #[test]
    fn each_person_yields_one_mention() {
        let mentions = matcher().find_mentions(
            "Ana Sophia é excelente. A Ana Sophia merece elogios.",
            &roster(),
        );
        assert_eq!(mentions.len(), 1);
    }

    #[test]
    fn confidence_stays_within_bounds() {
        let rules = MatcherRules {
            curated_names: vec!["Ana Sophia".to_string()],
            ..MatcherRules::default()
        };
        let mentions = CollaboratorMatcher::new(rules)
            .find_mentions("Ana Sophia foi excelente e muito profissional!", &roster());
        assert_eq!(mentions.len(), 1);
        assert!(mentions[0].confidence <= 1.0);
        assert!(mentions[0].confidence >= 0.0);
    }

    #[test]
    fn snippet_is_char_boundary_safe() {
        let comment = "ÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓó Ana Sophia atendeu ÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓóÓó";
        let mentions = matcher().find_mentions(comment, &roster());
        assert_eq!(mentions.len(), 1);
        assert!(mentions[0].snippet.contains("Ana Sophia"));
    }

    #[test]
    fn fold_strips_portuguese_diacritics() {
        assert_eq!(fold_for_compare("Letícia Andreza"), "leticia andreza");
        assert_eq!(fold_for_compare("João"), "joao");
        assert_eq!(fold_for_compare("atenção"), "atencao");
    }

    #[test]
    fn rules_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matcher.yaml");
        std::fs::write(
            &path,
            "version: 1\ncurated_names:\n  - Kaio Gomes\npositive_keywords:\n  - excelente\n",
        )
        .unwrap();
        let rules = MatcherRules::from_file(&path).unwrap();
        assert_eq!(rules.curated_names, vec!["Kaio Gomes".to_string()]);
        assert_eq!(rules.positive_keywords, vec!["excelente".to_string()]);

        let missing = MatcherRules::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert!(missing.curated_names.is_empty());
        assert!(!missing.positive_keywords.is_empty());
    }
}
