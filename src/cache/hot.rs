//! In-memory hot lookup index, loaded from the catalog at startup.
//!
//! Entries are bucketed by `voice_id` first: approximate matching only ever
//! scans fingerprints belonging to the requested voice, so a phrase cached
//! for one speaker can never surface as a false positive for another.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Scoring function used for approximate fingerprint matching.
///
/// All scorers return a similarity in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyScorer {
    /// Normalized edit-distance similarity over the raw strings.
    Ratio,
    /// [`Ratio`](Self::Ratio) over whitespace tokens sorted lexicographically,
    /// so word order does not matter.
    #[default]
    TokenSortRatio,
    /// Best [`Ratio`](Self::Ratio) of the shorter string against every
    /// equally-sized window of the longer one.
    PartialRatio,
    /// Weighted combination of the other scorers.
    #[serde(alias = "WRatio")]
    WeightedRatio,
}

impl FuzzyScorer {
    /// Score the similarity of two fingerprints.
    pub fn score(self, a: &str, b: &str) -> f64 {
        match self {
            Self::Ratio => ratio(a, b),
            Self::TokenSortRatio => token_sort_ratio(a, b),
            Self::PartialRatio => partial_ratio(a, b),
            Self::WeightedRatio => weighted_ratio(a, b),
        }
    }
}

fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b) * 100.0
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sort_tokens(a), &sort_tokens(b))
}

fn sort_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() { (a, b) } else { (b, a) };
    let short_len = short.chars().count();
    let long_chars: Vec<char> = long.chars().collect();
    if short_len == 0 || short_len == long_chars.len() {
        return ratio(short, long);
    }
    let mut best: f64 = 0.0;
    for window in long_chars.windows(short_len) {
        let candidate: String = window.iter().collect();
        best = best.max(ratio(short, &candidate));
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn weighted_ratio(a: &str, b: &str) -> f64 {
    let base = ratio(a, b);
    let token_sort = token_sort_ratio(a, b) * 0.95;
    let len_a = a.chars().count().max(1) as f64;
    let len_b = b.chars().count().max(1) as f64;
    let length_ratio = len_a.max(len_b) / len_a.min(len_b);
    let partial = if length_ratio > 1.5 { partial_ratio(a, b) * 0.9 } else { 0.0 };
    base.max(token_sort).max(partial)
}

/// A fuzzy lookup result: the bucket fingerprint that matched, one of its
/// artifact paths, and the similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyHit {
    pub matched: String,
    pub audio_path: PathBuf,
    pub score: f64,
}

/// In-process lookup structure over cached fingerprints.
///
/// `voice_id → (fingerprint → ordered artifact paths)`. Mirrors the catalog
/// for lookup speed; authoritative state lives in the catalog. Safe for
/// concurrent use; a single lock covers bucket map mutations.
#[derive(Debug)]
pub struct HotIndex {
    buckets: RwLock<HashMap<String, HashMap<String, Vec<PathBuf>>>>,
    variety_depth: usize,
}

impl HotIndex {
    /// Create an empty index capping each key at `variety_depth` paths.
    pub fn new(variety_depth: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            variety_depth: variety_depth.max(1) as usize,
        }
    }

    /// Bulk-load `(fingerprint, voice, path)` rows from the catalog.
    pub fn load<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String, PathBuf)>,
    {
        let mut buckets = self.buckets.write().expect("hot index lock");
        for (fingerprint, voice, path) in entries {
            let paths = buckets.entry(voice).or_default().entry(fingerprint).or_default();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }

    /// Exact lookup. Picks one version uniformly at random when several are
    /// cached.
    pub fn exact(&self, fingerprint: &str, voice: &str) -> Option<PathBuf> {
        let buckets = self.buckets.read().expect("hot index lock");
        let paths = buckets.get(voice)?.get(fingerprint)?;
        match paths.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            many => many.choose(&mut rand::thread_rng()).cloned(),
        }
    }

    /// Approximate lookup against the voice bucket's fingerprints.
    ///
    /// Returns the best candidate scoring at least `threshold`; ties break on
    /// the lexicographically smaller fingerprint so results are
    /// deterministic.
    pub fn fuzzy(
        &self,
        fingerprint: &str,
        voice: &str,
        threshold: f64,
        scorer: FuzzyScorer,
    ) -> Option<FuzzyHit> {
        let buckets = self.buckets.read().expect("hot index lock");
        let bucket = buckets.get(voice)?;

        let mut best: Option<(&String, f64)> = None;
        for candidate in bucket.keys() {
            let score = scorer.score(fingerprint, candidate);
            if score < threshold {
                continue;
            }
            match best {
                Some((held, held_score))
                    if score < held_score
                        || (score == held_score && candidate.as_str() >= held.as_str()) => {}
                _ => best = Some((candidate, score)),
            }
        }

        let (matched, score) = best?;
        let audio_path = bucket.get(matched)?.first()?.clone();
        Some(FuzzyHit {
            matched: matched.clone(),
            audio_path,
            score,
        })
    }

    /// All paths cached for a key, in insertion order.
    pub fn paths_for(&self, fingerprint: &str, voice: &str) -> Vec<PathBuf> {
        let buckets = self.buckets.read().expect("hot index lock");
        buckets
            .get(voice)
            .and_then(|b| b.get(fingerprint))
            .cloned()
            .unwrap_or_default()
    }

    /// Append a path to the key's version list.
    ///
    /// Duplicate paths are ignored and the list is capped at the configured
    /// variety depth.
    pub fn add(&self, fingerprint: &str, voice: &str, path: &Path) {
        let mut buckets = self.buckets.write().expect("hot index lock");
        let paths = buckets
            .entry(voice.to_owned())
            .or_default()
            .entry(fingerprint.to_owned())
            .or_default();
        if !paths.iter().any(|p| p == path) && paths.len() < self.variety_depth {
            paths.push(path.to_owned());
        }
    }

    /// Drop all paths for a key.
    pub fn remove(&self, fingerprint: &str, voice: &str) {
        let mut buckets = self.buckets.write().expect("hot index lock");
        if let Some(bucket) = buckets.get_mut(voice) {
            bucket.remove(fingerprint);
        }
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.write().expect("hot index lock").clear();
    }

    /// Number of distinct (fingerprint, voice) keys held.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().expect("hot index lock");
        buckets.values().map(HashMap::len).sum()
    }

    /// True when no keys are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_lookup_is_scoped_to_voice() {
        let index = HotIndex::new(1);
        index.add("merhaba", "voice-a", Path::new("/audio/a.mp3"));

        assert_eq!(index.exact("merhaba", "voice-a"), Some(PathBuf::from("/audio/a.mp3")));
        assert_eq!(index.exact("merhaba", "voice-b"), None);
    }

    #[test]
    fn add_caps_paths_at_variety_depth() {
        let index = HotIndex::new(4);
        for i in 0..6 {
            index.add("tekrar", "v", Path::new(&format!("/audio/{i}.mp3")));
        }
        assert_eq!(index.paths_for("tekrar", "v").len(), 4);
    }

    #[test]
    fn variety_depth_one_keeps_single_path() {
        let index = HotIndex::new(1);
        index.add("tekrar", "v", Path::new("/audio/0.mp3"));
        index.add("tekrar", "v", Path::new("/audio/1.mp3"));
        assert_eq!(index.paths_for("tekrar", "v"), vec![PathBuf::from("/audio/0.mp3")]);
    }

    #[test]
    fn duplicate_paths_are_ignored() {
        let index = HotIndex::new(4);
        index.add("tekrar", "v", Path::new("/audio/0.mp3"));
        index.add("tekrar", "v", Path::new("/audio/0.mp3"));
        assert_eq!(index.paths_for("tekrar", "v").len(), 1);
    }

    #[test]
    fn exact_with_versions_returns_one_of_them() {
        let index = HotIndex::new(3);
        index.add("tekrar", "v", Path::new("/audio/0.mp3"));
        index.add("tekrar", "v", Path::new("/audio/1.mp3"));
        index.add("tekrar", "v", Path::new("/audio/2.mp3"));

        for _ in 0..20 {
            let path = index.exact("tekrar", "v").expect("hit");
            assert!(index.paths_for("tekrar", "v").contains(&path));
        }
    }

    #[test]
    fn load_populates_buckets() {
        let index = HotIndex::new(1);
        index.load([
            ("bir".to_owned(), "v".to_owned(), PathBuf::from("/audio/1.mp3")),
            ("iki".to_owned(), "v".to_owned(), PathBuf::from("/audio/2.mp3")),
            ("bir".to_owned(), "w".to_owned(), PathBuf::from("/audio/3.mp3")),
        ]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.exact("bir", "w"), Some(PathBuf::from("/audio/3.mp3")));
    }

    #[test]
    fn remove_drops_all_versions() {
        let index = HotIndex::new(3);
        index.add("tekrar", "v", Path::new("/audio/0.mp3"));
        index.add("tekrar", "v", Path::new("/audio/1.mp3"));
        index.remove("tekrar", "v");
        assert_eq!(index.exact("tekrar", "v"), None);
        assert!(index.is_empty());
    }

    #[test]
    fn fuzzy_finds_close_candidate() {
        let index = HotIndex::new(1);
        index.add("hemen bakiyorum", "v", Path::new("/audio/a.mp3"));

        let hit = index
            .fuzzy("hemen bakiyoruum", "v", 85.0, FuzzyScorer::TokenSortRatio)
            .expect("fuzzy hit");
        assert_eq!(hit.matched, "hemen bakiyorum");
        assert_eq!(hit.audio_path, PathBuf::from("/audio/a.mp3"));
        assert!(hit.score >= 85.0);
    }

    #[test]
    fn fuzzy_respects_threshold() {
        let index = HotIndex::new(1);
        index.add("hemen bakiyorum", "v", Path::new("/audio/a.mp3"));
        assert!(index.fuzzy("tamamen farkli cumle", "v", 90.0, FuzzyScorer::Ratio).is_none());
    }

    #[test]
    fn fuzzy_does_not_cross_voice_buckets() {
        let index = HotIndex::new(1);
        index.add("hemen bakiyorum", "voice-a", Path::new("/audio/a.mp3"));
        assert!(index.fuzzy("hemen bakiyorum", "voice-b", 50.0, FuzzyScorer::Ratio).is_none());
    }

    #[test]
    fn token_sort_ignores_word_order() {
        let a = FuzzyScorer::TokenSortRatio.score("kaynak buldum", "buldum kaynak");
        assert_eq!(a, 100.0);
    }

    #[test]
    fn partial_ratio_finds_substring() {
        let score = FuzzyScorer::PartialRatio.score("bakiyorum", "hemen bakiyorum simdi");
        assert_eq!(score, 100.0);
    }

    #[test]
    fn weighted_ratio_at_least_plain_ratio() {
        let a = "hemen bakiyorum";
        let b = "bakiyorum hemen";
        assert!(FuzzyScorer::WeightedRatio.score(a, b) >= FuzzyScorer::Ratio.score(a, b));
    }

    #[test]
    fn scorer_parses_from_config_strings() {
        let scorer: FuzzyScorer = serde_json::from_str("\"token_sort_ratio\"").expect("parse");
        assert_eq!(scorer, FuzzyScorer::TokenSortRatio);
        let scorer: FuzzyScorer = serde_json::from_str("\"WRatio\"").expect("parse alias");
        assert_eq!(scorer, FuzzyScorer::WeightedRatio);
    }
}
