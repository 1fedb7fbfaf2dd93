//! k-NN identity resolution with majority vote and distance gating.

use crate::forest::Neighbor;
use crate::store::{Generation, IdentityIndex};
use crate::types::{Embedding, IdentificationResult, IdentityRecord, MemberId};
use serde::Deserialize;

/// Which neighbours contribute to the gating distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceAveraging {
    /// Sum over every returned neighbour divided by `k`. A unanimous vote
    /// of distant neighbours is still rejected; when fewer than `k`
    /// neighbours exist the missing ones count as distance zero.
    #[default]
    AllNeighbors,
    /// Mean over the neighbours that carry the winning username.
    MajorityOnly,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub k: usize,
    /// Maximum accepted average angular distance (inclusive).
    pub distance_threshold: f32,
    pub averaging: DistanceAveraging,
    /// Candidate budget passed to the forest; `None` uses its default.
    pub search_k: Option<usize>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            k: 10,
            distance_threshold: 0.36,
            averaging: DistanceAveraging::AllNeighbors,
            search_k: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched {
        username: String,
        member_id: MemberId,
        avg_distance: f32,
    },
    /// Neighbours were found but sit too far away on average.
    LowConfidence { avg_distance: f32 },
    /// Index empty, unbuilt, or returned unusable labels.
    NoMatch,
}

impl From<Resolution> for IdentificationResult {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Matched { username, member_id, avg_distance } => IdentificationResult {
                username: Some(username),
                member_id: Some(member_id),
                avg_distance: Some(avg_distance),
            },
            Resolution::LowConfidence { avg_distance } => IdentificationResult {
                avg_distance: Some(avg_distance),
                ..IdentificationResult::unknown()
            },
            Resolution::NoMatch => IdentificationResult::unknown(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    cfg: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    /// Resolve against the latest generation of `index`.
    pub fn resolve(&self, index: &IdentityIndex, embedding: &Embedding) -> Resolution {
        match index.snapshot() {
            Some(generation) => self.resolve_in(&generation, embedding),
            None => {
                tracing::debug!("identity index not built yet");
                Resolution::NoMatch
            }
        }
    }

    /// Resolve against one specific generation.
    pub fn resolve_in(&self, generation: &Generation, embedding: &Embedding) -> Resolution {
        let neighbors = match generation.query(embedding, self.cfg.k, self.cfg.search_k) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "identity query returned nothing");
                return Resolution::NoMatch;
            }
        };

        let mut hits = Vec::with_capacity(neighbors.len());
        for Neighbor { label, distance } in neighbors {
            let Some(record) = generation.store().get(label) else {
                tracing::warn!(label, records = generation.len(), "neighbor label outside lookup table");
                return Resolution::NoMatch;
            };
            hits.push((record, distance));
        }

        self.decide(&hits)
    }

    /// Majority vote over `hits` (nearest first), gated on average distance.
    ///
    /// Ties go to the username encountered first.
    pub fn decide(&self, hits: &[(&IdentityRecord, f32)]) -> Resolution {
        if hits.is_empty() {
            return Resolution::NoMatch;
        }

        // (username, votes, first record) in first-encountered order.
        let mut tally: Vec<(&str, usize, &IdentityRecord)> = Vec::new();
        for (record, _) in hits {
            match tally.iter_mut().find(|(name, _, _)| *name == record.username) {
                Some(entry) => entry.1 += 1,
                None => tally.push((record.username.as_str(), 1, *record)),
            }
        }

        let mut winner = &tally[0];
        for entry in &tally[1..] {
            if entry.1 > winner.1 {
                winner = entry;
            }
        }
        let (username, votes, first) = *winner;

        let avg_distance = match self.cfg.averaging {
            DistanceAveraging::AllNeighbors => {
                hits.iter().map(|(_, d)| d).sum::<f32>() / self.cfg.k.max(hits.len()) as f32
            }
            DistanceAveraging::MajorityOnly => {
                hits.iter()
                    .filter(|(r, _)| r.username == username)
                    .map(|(_, d)| d)
                    .sum::<f32>()
                    / votes as f32
            }
        };

        if avg_distance <= self.cfg.distance_threshold {
            Resolution::Matched {
                username: username.to_string(),
                member_id: first.member_id.clone(),
                avg_distance,
            }
        } else {
            tracing::info!(
                avg_distance,
                threshold = self.cfg.distance_threshold,
                candidate = username,
                "average distance exceeds threshold"
            );
            Resolution::LowConfidence { avg_distance }
        }
    }
}
