//! HLS master playlist generation.

use crate::rendition::RenditionSpec;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the master playlist inside a job workspace.
pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("master playlist needs at least one variant")]
    Empty,

    #[error("failed to write master playlist: {0}")]
    Io(#[from] std::io::Error),
}

/// One `#EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Bits per second.
    pub bandwidth: u64,
    /// Encoded width, when known.
    pub width: Option<u32>,
    pub height: u32,
    /// Media playlist path relative to the master playlist.
    pub uri: String,
}

impl Variant {
    pub fn from_rendition(spec: &RenditionSpec, width: Option<u32>) -> Self {
        Self {
            bandwidth: spec.bandwidth(),
            width,
            height: spec.height,
            uri: spec.playlist_name(),
        }
    }

    /// `WIDTHxHEIGHT`; an unknown width is written as `-2`, the value the
    /// scale filter was given.
    pub fn resolution(&self) -> String {
        match self.width {
            Some(width) => format!("{}x{}", width, self.height),
            None => format!("-2x{}", self.height),
        }
    }
}

/// Master playlist listing variants in ascending quality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPlaylist {
    variants: Vec<Variant>,
}

impl MasterPlaylist {
    pub fn new(mut variants: Vec<Variant>) -> Result<Self, ManifestError> {
        if variants.is_empty() {
            return Err(ManifestError::Empty);
        }
        variants.sort_by_key(|v| (v.height, v.bandwidth));
        Ok(Self { variants })
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        for v in &self.variants {
            // Writing into a String cannot fail
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
                v.bandwidth,
                v.resolution()
            );
            let _ = writeln!(out, "{}", v.uri);
        }
        out
    }
}

/// Write `master.m3u8` into `dir`.
///
/// The playlist is written to a temporary file and renamed into place, so
/// readers never observe a partial manifest.
pub fn write_master_playlist(dir: &Path, playlist: &MasterPlaylist) -> Result<PathBuf, ManifestError> {
    let final_path = dir.join(MASTER_PLAYLIST_NAME);
    let tmp_path = dir.join(format!(".{}.tmp", MASTER_PLAYLIST_NAME));

    fs::write(&tmp_path, playlist.render())?;
    if let Err(e) = fs::rename(&tmp_path, &final_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(final_path)
}
