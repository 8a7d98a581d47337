//! Sequence diversity selector for material combinations.
//!
//! Generates ordered material combinations that do not repeat: neither the
//! full ordered tuple nor any of its adjacent pairs may have appeared in an
//! earlier combination, and no material repeats within a single tuple.
//! Selection is biased toward least-used materials so the pool wears evenly.
//!
//! Dedup state can persist to a JSON file keyed by the input folder, so the
//! same folder's history survives process restarts.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts made to find a fully fresh combination before the uniform
/// fallback kicks in. Tunable constant, kept at 30 for behavioral
/// compatibility.
pub const MAX_SELECTION_ATTEMPTS: usize = 30;

/// Hard cap on the weighted candidate pool size.
pub const WEIGHTED_POOL_CAP: usize = 100;

/// State file format version.
const STATE_VERSION: &str = "1.0";

/// Error type for selector operations
#[derive(Debug, Error)]
pub enum SelectorError {
    /// The material list was empty at construction.
    #[error("material list is empty")]
    NoMaterials,

    /// The requested combination size was zero.
    #[error("combination size must be greater than zero")]
    ZeroCombinationSize,

    /// More materials were requested per combination than exist.
    #[error("combination size {per_video} exceeds available materials {available}")]
    NotEnoughMaterials { per_video: usize, available: usize },

    /// The allowed subset passed to a restricted draw was empty.
    #[error("allowed material set is empty")]
    EmptyAllowedSet,
}

/// Usage and dedup statistics for a selector instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorStatistics {
    pub total_materials: usize,
    pub per_video: usize,
    pub used_sequences_count: usize,
    pub used_pairs_count: usize,
    pub max_usage: u64,
    pub min_usage: u64,
    pub unused_materials: usize,
}

/// Persisted dedup state.
#[derive(Debug, Serialize, Deserialize)]
struct SelectorState {
    version: String,
    materials: Vec<String>,
    per_video: usize,
    used_sequences: Vec<Vec<String>>,
    used_pairs: Vec<Vec<String>>,
    material_count: HashMap<String, u64>,
}

/// Order-diverse material combination selector.
///
/// Not safe for concurrent use; callers hold one instance per input source
/// and serialize access to it.
pub struct SequenceSelector {
    materials: Vec<String>,
    per_video: usize,
    persistence_file: Option<PathBuf>,
    used_sequences: HashSet<Vec<String>>,
    used_pairs: HashSet<(String, String)>,
    material_count: HashMap<String, u64>,
}

impl SequenceSelector {
    /// Create a selector over `materials`, drawing `per_video` per combination.
    pub fn new(materials: Vec<String>, per_video: usize) -> Result<Self, SelectorError> {
        if materials.is_empty() {
            return Err(SelectorError::NoMaterials);
        }
        if per_video == 0 {
            return Err(SelectorError::ZeroCombinationSize);
        }
        if per_video > materials.len() {
            return Err(SelectorError::NotEnoughMaterials {
                per_video,
                available: materials.len(),
            });
        }

        Ok(Self {
            materials,
            per_video,
            persistence_file: None,
            used_sequences: HashSet::new(),
            used_pairs: HashSet::new(),
            material_count: HashMap::new(),
        })
    }

    /// Create a selector with a persistence file, loading prior dedup state
    /// when the file exists and matches the current materials and size.
    pub fn with_persistence(
        materials: Vec<String>,
        per_video: usize,
        persistence_file: PathBuf,
    ) -> Result<Self, SelectorError> {
        let mut selector = Self::new(materials, per_video)?;
        selector.persistence_file = Some(persistence_file);
        selector.load_state();
        Ok(selector)
    }

    /// Builds the persistence file path for an input folder under `state_dir`.
    ///
    /// The file name embeds a 12-hex-digit digest of the folder's absolute
    /// path so that same-named folders in different locations get separate
    /// histories.
    pub fn state_file_path(state_dir: &Path, input_folder: &Path) -> PathBuf {
        let abs_path = input_folder
            .canonicalize()
            .unwrap_or_else(|_| input_folder.to_path_buf());

        let digest = Sha256::digest(abs_path.to_string_lossy().as_bytes());
        let path_hash = &hex::encode(digest)[..12];

        let folder_name = input_folder
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("default");

        state_dir.join(format!("{}_{}_dedup_state.json", folder_name, path_hash))
    }

    /// Removes dedup state files in `state_dir` older than `days_old` days.
    pub fn cleanup_old_states(state_dir: &Path, days_old: u64) {
        let Ok(entries) = std::fs::read_dir(state_dir) else {
            return;
        };

        let cutoff = Duration::from_secs(days_old * 24 * 60 * 60);

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_state_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("_dedup_state.json"))
                .unwrap_or(false);
            if !is_state_file {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .map(|age| age > cutoff)
                .unwrap_or(false);

            if expired {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove stale dedup state");
                } else {
                    debug!(path = %path.display(), "removed stale dedup state");
                }
            }
        }
    }

    /// Generate the next combination.
    ///
    /// Guarantees, best-effort within [`MAX_SELECTION_ATTEMPTS`] retries:
    /// the full ordered tuple is new, none of its adjacent pairs has appeared
    /// before, and no material repeats within the tuple. When every attempt
    /// collides (materials scarce relative to `per_video`), an unconstrained
    /// uniform sample is recorded and returned instead.
    pub fn next_combination(&mut self) -> Result<Vec<String>, SelectorError> {
        if self.materials.len() < self.per_video {
            return Err(SelectorError::NotEnoughMaterials {
                per_video: self.per_video,
                available: self.materials.len(),
            });
        }

        let mut rng = rand::thread_rng();

        for _ in 0..MAX_SELECTION_ATTEMPTS {
            let selected = self.weighted_draw(&mut rng, &self.materials);

            if self.is_valid_sequence(&selected) {
                self.record_sequence(&selected);
                return Ok(selected);
            }
        }

        // Attempt budget spent; materials are too scarce to stay fully
        // fresh. Record the forced sample anyway so future draws still
        // steer away from it.
        warn!(
            attempts = MAX_SELECTION_ATTEMPTS,
            materials = self.materials.len(),
            per_video = self.per_video,
            "selection attempts exhausted, falling back to uniform sample"
        );

        let selected = uniform_sample(&mut rng, &self.materials, self.per_video);
        self.record_sequence(&selected);
        Ok(selected)
    }

    /// Generate the next combination restricted to `allowed` materials,
    /// while updating the same persistent dedup state.
    pub fn next_combination_from_allowed(
        &mut self,
        allowed: &[String],
    ) -> Result<Vec<String>, SelectorError> {
        if allowed.is_empty() {
            return Err(SelectorError::EmptyAllowedSet);
        }

        // Keep only materials that exist in the full set, preserving the
        // full set's order.
        let allowed_set: HashSet<&String> = allowed.iter().collect();
        let candidates: Vec<String> = self
            .materials
            .iter()
            .filter(|m| allowed_set.contains(m))
            .cloned()
            .collect();

        if candidates.len() < self.per_video {
            return Err(SelectorError::NotEnoughMaterials {
                per_video: self.per_video,
                available: candidates.len(),
            });
        }

        let mut rng = rand::thread_rng();

        for _ in 0..MAX_SELECTION_ATTEMPTS {
            let selected = self.weighted_draw(&mut rng, &candidates);

            if self.is_valid_sequence(&selected) {
                self.record_sequence(&selected);
                return Ok(selected);
            }
        }

        warn!(
            attempts = MAX_SELECTION_ATTEMPTS,
            candidates = candidates.len(),
            "restricted selection attempts exhausted, falling back to uniform sample"
        );

        let selected = uniform_sample(&mut rng, &candidates, self.per_video);
        self.record_sequence(&selected);
        Ok(selected)
    }

    /// Current usage and dedup statistics.
    pub fn statistics(&self) -> SelectorStatistics {
        let usages: Vec<u64> = self
            .materials
            .iter()
            .map(|m| self.material_count.get(m).copied().unwrap_or(0))
            .collect();

        SelectorStatistics {
            total_materials: self.materials.len(),
            per_video: self.per_video,
            used_sequences_count: self.used_sequences.len(),
            used_pairs_count: self.used_pairs.len(),
            max_usage: usages.iter().copied().max().unwrap_or(0),
            min_usage: usages.iter().copied().min().unwrap_or(0),
            unused_materials: usages.iter().filter(|&&u| u == 0).count(),
        }
    }

    /// Number of distinct full sequences recorded so far.
    pub fn used_sequence_count(&self) -> usize {
        self.used_sequences.len()
    }

    /// Clear all dedup state; the persistence file, if any, is rewritten empty.
    pub fn reset(&mut self) {
        self.used_sequences.clear();
        self.used_pairs.clear();
        self.material_count.clear();

        if self.persistence_file.is_some() {
            self.save_state();
        }
    }

    /// Draw `per_video` distinct materials from a weighted pool biased toward
    /// least-used materials (weight `1 / (count + 1)`).
    fn weighted_draw<R: Rng>(&self, rng: &mut R, candidates: &[String]) -> Vec<String> {
        let weights: Vec<f64> = candidates
            .iter()
            .map(|m| 1.0 / (self.material_count.get(m).copied().unwrap_or(0) + 1) as f64)
            .collect();

        let pool_size = (candidates.len() * 3).min(WEIGHTED_POOL_CAP);

        // Sample with replacement, dedup preserving draw order.
        let mut pool: Vec<String> = Vec::with_capacity(pool_size);
        if let Ok(dist) = WeightedIndex::new(&weights) {
            let mut seen: HashSet<usize> = HashSet::new();
            for _ in 0..pool_size {
                let idx = dist.sample(rng);
                if seen.insert(idx) {
                    pool.push(candidates[idx].clone());
                }
            }
        }

        if pool.len() >= self.per_video {
            uniform_sample(rng, &pool, self.per_video)
        } else {
            uniform_sample(rng, candidates, self.per_video)
        }
    }

    /// A sequence is valid when the full tuple is new and none of its
    /// adjacent pairs has ever appeared adjacent before.
    fn is_valid_sequence(&self, sequence: &[String]) -> bool {
        if self.used_sequences.contains(sequence) {
            return false;
        }

        extract_adjacent_pairs(sequence)
            .iter()
            .all(|pair| !self.used_pairs.contains(pair))
    }

    /// Record a sequence, its adjacent pairs, and usage counts; saves state
    /// when persistence is enabled.
    fn record_sequence(&mut self, sequence: &[String]) {
        self.used_sequences.insert(sequence.to_vec());

        for pair in extract_adjacent_pairs(sequence) {
            self.used_pairs.insert(pair);
        }

        for material in sequence {
            *self.material_count.entry(material.clone()).or_insert(0) += 1;
        }

        if self.persistence_file.is_some() {
            self.save_state();
        }
    }

    /// Write dedup state to the persistence file.
    ///
    /// Persistence failures must not break selection; they are logged and
    /// swallowed.
    pub fn save_state(&self) {
        let Some(path) = &self.persistence_file else {
            return;
        };

        let state = SelectorState {
            version: STATE_VERSION.to_string(),
            materials: self.materials.clone(),
            per_video: self.per_video,
            used_sequences: self.used_sequences.iter().cloned().collect(),
            used_pairs: self
                .used_pairs
                .iter()
                .map(|(a, b)| vec![a.clone(), b.clone()])
                .collect(),
            material_count: self.material_count.clone(),
        };

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(path, json)
        })();

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to save dedup state");
        }
    }

    /// Load dedup state from the persistence file, discarding it silently
    /// when the stored materials or combination size no longer match.
    fn load_state(&mut self) {
        let Some(path) = &self.persistence_file else {
            return;
        };
        if !path.exists() {
            return;
        }

        let state: SelectorState = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable dedup state, starting fresh");
                return;
            }
        };

        let saved_set: HashSet<&String> = state.materials.iter().collect();
        let current_set: HashSet<&String> = self.materials.iter().collect();
        if saved_set != current_set || state.per_video != self.per_video {
            warn!(
                path = %path.display(),
                "materials or combination size changed, discarding dedup state"
            );
            return;
        }

        self.used_sequences = state.used_sequences.into_iter().collect();
        self.used_pairs = state
            .used_pairs
            .into_iter()
            .filter_map(|pair| {
                let mut it = pair.into_iter();
                match (it.next(), it.next()) {
                    (Some(a), Some(b)) => Some((a, b)),
                    _ => None,
                }
            })
            .collect();
        self.material_count = state.material_count;

        debug!(
            sequences = self.used_sequences.len(),
            pairs = self.used_pairs.len(),
            "loaded dedup state"
        );
    }
}

/// Extract all ordered adjacent pairs of a sequence; pairs are directionally
/// distinct, (A,B) != (B,A).
fn extract_adjacent_pairs(sequence: &[String]) -> Vec<(String, String)> {
    sequence
        .windows(2)
        .map(|w| (w[0].clone(), w[1].clone()))
        .collect()
}

/// Uniform sample of `amount` distinct items in random order.
fn uniform_sample<R: Rng>(rng: &mut R, items: &[String], amount: usize) -> Vec<String> {
    let mut selected: Vec<String> = items.choose_multiple(rng, amount).cloned().collect();
    selected.shuffle(rng);
    selected
}
