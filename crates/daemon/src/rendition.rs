//! Rendition specs and the bitrate ladder a job is encoded into.

use crate::config::RenditionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Errors raised when a requested ladder cannot be encoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenditionError {
    #[error("no renditions requested")]
    Empty,

    #[error("rendition {height}p/{bitrate_kbps}k must have a positive height and bitrate")]
    NonPositive { height: u32, bitrate_kbps: u32 },

    /// H.264 needs even frame dimensions
    #[error("rendition height {0} is odd")]
    OddHeight(u32),

    /// Two renditions with the same height would write the same playlist
    #[error("rendition height {0} requested more than once")]
    DuplicateHeight(u32),
}

/// Target vertical resolution and video bitrate of one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub height: u32,
    pub bitrate_kbps: u32,
}

impl RenditionSpec {
    pub fn new(height: u32, bitrate_kbps: u32) -> Self {
        Self {
            height,
            bitrate_kbps,
        }
    }

    /// Short label used in logs and file names, e.g. `720p`.
    pub fn label(&self) -> String {
        format!("{}p", self.height)
    }

    /// Media playlist file name inside the job workspace.
    pub fn playlist_name(&self) -> String {
        format!("{}p.m3u8", self.height)
    }

    /// Segment file template handed to the encoder.
    pub fn segment_pattern(&self) -> String {
        format!("{}p_%03d.ts", self.height)
    }

    /// Prefix shared by every segment of this rendition.
    pub fn segment_prefix(&self) -> String {
        format!("{}p_", self.height)
    }

    /// Declared bandwidth in bits per second.
    pub fn bandwidth(&self) -> u64 {
        u64::from(self.bitrate_kbps) * 1000
    }
}

impl fmt::Display for RenditionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p@{}k", self.height, self.bitrate_kbps)
    }
}

impl From<RenditionConfig> for RenditionSpec {
    fn from(cfg: RenditionConfig) -> Self {
        Self::new(cfg.height, cfg.bitrate_kbps)
    }
}

/// The four-step ladder used when a producer does not ask for its own.
pub fn default_catalog() -> Vec<RenditionSpec> {
    vec![
        RenditionSpec::new(144, 300),
        RenditionSpec::new(360, 500),
        RenditionSpec::new(720, 1000),
        RenditionSpec::new(1080, 3000),
    ]
}

/// A validated set of renditions in ascending quality order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionLadder {
    specs: Vec<RenditionSpec>,
}

impl RenditionLadder {
    /// Validate `specs` and order them by (height, bitrate).
    pub fn new(mut specs: Vec<RenditionSpec>) -> Result<Self, RenditionError> {
        if specs.is_empty() {
            return Err(RenditionError::Empty);
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if spec.height == 0 || spec.bitrate_kbps == 0 {
                return Err(RenditionError::NonPositive {
                    height: spec.height,
                    bitrate_kbps: spec.bitrate_kbps,
                });
            }
            if spec.height % 2 != 0 {
                return Err(RenditionError::OddHeight(spec.height));
            }
            if !seen.insert(spec.height) {
                return Err(RenditionError::DuplicateHeight(spec.height));
            }
        }

        specs.sort_by_key(|s| (s.height, s.bitrate_kbps));
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[RenditionSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn into_specs(self) -> Vec<RenditionSpec> {
        self.specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_file_names() {
        let spec = RenditionSpec::new(720, 1000);
        assert_eq!(spec.label(), "720p");
        assert_eq!(spec.playlist_name(), "720p.m3u8");
        assert_eq!(spec.segment_pattern(), "720p_%03d.ts");
        assert_eq!(spec.bandwidth(), 1_000_000);
        assert_eq!(spec.to_string(), "720p@1000k");
    }

    #[test]
    fn test_default_catalog_is_a_valid_ladder() {
        let ladder = RenditionLadder::new(default_catalog()).unwrap();
        let heights: Vec<u32> = ladder.specs().iter().map(|s| s.height).collect();
        assert_eq!(heights, vec![144, 360, 720, 1080]);
    }

    #[test]
    fn test_ladder_rejects_invalid_specs() {
        assert_eq!(RenditionLadder::new(vec![]), Err(RenditionError::Empty));
        assert_eq!(
            RenditionLadder::new(vec![RenditionSpec::new(0, 300)]),
            Err(RenditionError::NonPositive {
                height: 0,
                bitrate_kbps: 300
            })
        );
        assert_eq!(
            RenditionLadder::new(vec![RenditionSpec::new(721, 1000)]),
            Err(RenditionError::OddHeight(721))
        );
        assert_eq!(
            RenditionLadder::new(vec![
                RenditionSpec::new(720, 1000),
                RenditionSpec::new(720, 2000)
            ]),
            Err(RenditionError::DuplicateHeight(720))
        );
    }

    // Property: whatever order the producer lists renditions in, the ladder
    // comes out sorted by height and keeps every entry.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ladder_is_sorted_ascending(
            halves in proptest::collection::hash_set(1u32..1100, 1..8),
            bitrate in 100u32..8000,
        ) {
            let mut specs: Vec<RenditionSpec> = halves
                .iter()
                .map(|h| RenditionSpec::new(h * 2, bitrate))
                .collect();
            specs.reverse();

            let ladder = RenditionLadder::new(specs.clone()).unwrap();
            prop_assert_eq!(ladder.len(), specs.len());
            for pair in ladder.specs().windows(2) {
                prop_assert!(pair[0].height < pair[1].height);
            }
        }
    }
}
