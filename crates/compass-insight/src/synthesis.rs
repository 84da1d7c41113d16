//! Cross-domain pattern synthesis.
//!
//! Groups the pattern observations a user has accumulated by theme and
//! promotes themes seen in more than one life domain to synthesis records.

use std::collections::{BTreeMap, BTreeSet};

use compass_core::types::{Confidence, Domain, SynthesisRecord, Timestamp, UserId};
use compass_storage::PatternObservation;

use crate::limiter::normalize_theme;

/// Maximum evidence snippets kept per record.
const MAX_EVIDENCE: usize = 5;

/// Builds synthesis records from pattern observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesisAnalyzer;

impl SynthesisAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Confidence grows with repetition and with the number of domains
    /// the theme spans.
    pub fn confidence(occurrences: usize, domains: usize) -> Confidence {
        let value = 0.5 + 0.1 * occurrences as f64 + 0.1 * domains.saturating_sub(1) as f64;
        Confidence::new(value.min(1.0))
    }

    /// Records for every theme observed in at least two domains, highest
    /// confidence first. Observations without a domain count toward
    /// occurrences but not toward domain spread.
    pub fn analyze(
        &self,
        user: &UserId,
        observations: &[PatternObservation],
    ) -> Vec<SynthesisRecord> {
        struct Group<'a> {
            display: &'a str,
            occurrences: usize,
            domains: BTreeSet<Domain>,
            evidence: Vec<String>,
        }

        let mut groups: BTreeMap<String, Group<'_>> = BTreeMap::new();
        for observation in observations {
            let key = normalize_theme(&observation.theme);
            if key.is_empty() {
                continue;
            }
            let group = groups.entry(key).or_insert_with(|| Group {
                display: observation.theme.trim(),
                occurrences: 0,
                domains: BTreeSet::new(),
                evidence: Vec::new(),
            });
            group.occurrences += 1;
            if let Some(domain) = observation.domain {
                if group.domains.insert(domain) && group.evidence.len() < MAX_EVIDENCE {
                    group.evidence.push(format!(
                        "{} (conversation {})",
                        domain, observation.conversation_id
                    ));
                }
            }
        }

        let computed_at = Timestamp::now();
        let mut records: Vec<SynthesisRecord> = groups
            .into_values()
            .filter(|g| g.domains.len() >= SynthesisRecord::MIN_DOMAINS)
            .map(|g| SynthesisRecord {
                user_id: user.clone(),
                theme: g.display.to_string(),
                confidence: Self::confidence(g.occurrences, g.domains.len()),
                domains: g.domains.into_iter().collect(),
                evidence: g.evidence,
                last_surfaced_at: None,
                surface_count: 0,
                computed_at,
            })
            .collect();

        records.sort_by(|a, b| {
            b.confidence
                .0
                .partial_cmp(&a.confidence.0)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }
}
