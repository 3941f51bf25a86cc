//! Weighted consistent-hash ring.
//!
//! Each instance contributes virtual nodes proportional to its weight;
//! locating a key walks clockwise to the first node at or past the key's
//! hash. Zero-weight instances contribute nothing, so adding or removing
//! them never remaps a key.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

const SPOTS_PER_WEIGHT: usize = 120;

pub struct HashRing {
    points: Vec<(u64, String)>,
}

impl HashRing {
    pub fn build(weights: &HashMap<String, i64>) -> HashRing {
        let mut points = Vec::new();
        for (name, weight) in weights {
            if *weight <= 0 {
                continue;
            }
            let spots = (*weight as usize) * SPOTS_PER_WEIGHT;
            for i in 0..spots {
                points.push((hash(&format!("{name}#{i}")), name.clone()));
            }
        }
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        HashRing { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The instance owning `key`, or `None` on an empty ring.
    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash(key);
        let idx = match self.points.binary_search_by(|(p, _)| p.cmp(&h)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.points[idx].1)
    }
}

fn hash(key: &str) -> u64 {
    let digest = Sha1::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn every_key_lands_somewhere() {
        let ring = HashRing::build(&weights(&[("a", 1), ("b", 2)]));
        for key in keys(1000) {
            let owner = ring.locate(&key).unwrap();
            assert!(owner == "a" || owner == "b");
        }
    }

    #[test]
    fn zero_weight_instances_never_remap() {
        let with = HashRing::build(&weights(&[("a", 1), ("b", 2), ("ghost", 0)]));
        let without = HashRing::build(&weights(&[("a", 1), ("b", 2)]));

        for key in keys(2000) {
            assert_eq!(with.locate(&key), without.locate(&key));
        }
    }

    #[test]
    fn adding_an_instance_remaps_proportionally() {
        let before = HashRing::build(&weights(&[("a", 1), ("b", 1)]));
        let after = HashRing::build(&weights(&[("a", 1), ("b", 1), ("c", 1)]));

        let sample = keys(6000);
        let moved = sample
            .iter()
            .filter(|k| before.locate(k) != after.locate(k))
            .count();

        // expectation is W/(total+W) = 1/3; allow at most twice that
        let expected = sample.len() / 3;
        assert!(moved > 0);
        assert!(moved <= expected * 2, "moved {moved} of {}", sample.len());

        // every moved key must have moved onto the new instance
        for key in &sample {
            if before.locate(key) != after.locate(key) {
                assert_eq!(after.locate(key), Some("c"));
            }
        }
    }

    #[test]
    fn weights_skew_distribution() {
        let ring = HashRing::build(&weights(&[("small", 1), ("large", 4)]));
        let sample = keys(8000);
        let large = sample
            .iter()
            .filter(|k| ring.locate(k) == Some("large"))
            .count();
        let ratio = large as f64 / sample.len() as f64;
        assert!(ratio > 0.6 && ratio < 0.95, "ratio {ratio}");
    }

    #[test]
    fn empty_ring_locates_nothing() {
        let ring = HashRing::build(&HashMap::new());
        assert!(ring.is_empty());
        assert_eq!(ring.locate("x"), None);
    }
}
