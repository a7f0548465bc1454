//! Metadata tagger: dataset-level and per-band descriptive tags.
//!
//! Tags are stored as GDAL persistent auxiliary metadata of the tiled
//! raster (`<tiled>.aux.xml`). GDAL merges that document into the dataset
//! whenever the raster is opened, and the packager's copy embeds it into
//! the COG's internal metadata tag. The document is written to a temporary
//! sibling and renamed into place, so tagging is all-or-nothing: after a
//! failure no band carries tags, never a prefix of them.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::TagConfig;
use crate::error::TagError;
use crate::inspect::{RasterInfo, RasterInspector};
use crate::slice::{BandSpec, TimeSlice};
use crate::staging::write_atomically;

pub const TAG_YEAR: &str = "YEAR";
pub const TAG_DATASOURCE: &str = "DATASOURCE";
pub const TAG_DESCRIPTION: &str = "DESCRIPTION";
pub const TAG_NAME: &str = "NAME";

/// Full tag content for one raster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    pub dataset: BTreeMap<String, String>,
    /// Keyed by 1-based band index
    pub bands: BTreeMap<usize, BTreeMap<String, String>>,
}

impl TagSet {
    pub fn for_slice(slice: TimeSlice, bands: &BandSpec, tags: &TagConfig) -> Self {
        let mut set = TagSet::default();
        set.dataset.insert(TAG_YEAR.to_string(), slice.to_string());
        set.dataset
            .insert(TAG_DATASOURCE.to_string(), tags.data_source.clone());
        if !tags.description.is_empty() {
            set.dataset
                .insert(TAG_DESCRIPTION.to_string(), tags.description.clone());
        }

        for (index, band) in bands.indexed() {
            let entry = set.bands.entry(index).or_default();
            entry.insert(TAG_NAME.to_string(), band.name.clone());
            entry.insert(TAG_DESCRIPTION.to_string(), band.description.clone());
        }
        set
    }

    /// Tags of this set that `info` lacks or reports with another value.
    pub fn problems(&self, info: &RasterInfo) -> Vec<String> {
        let mut problems = Vec::new();
        for (key, expected) in &self.dataset {
            match info.metadata_item("", key) {
                Some(value) if value == expected => {}
                Some(value) => problems.push(format!("tag {} is {:?}, expected {:?}", key, value, expected)),
                None => problems.push(format!("missing tag {}", key)),
            }
        }

        for (&index, items) in &self.bands {
            let Some(band) = info.bands.iter().find(|b| b.band == index) else {
                // Band count problems are reported by the structural check.
                continue;
            };
            for (key, expected) in items {
                match band.metadata_item("", key) {
                    Some(value) if value == expected => {}
                    Some(value) => problems.push(format!(
                        "band {}: tag {} is {:?}, expected {:?}",
                        index, key, value, expected
                    )),
                    None => problems.push(format!("band {}: missing tag {}", index, key)),
                }
            }
        }
        problems
    }
}

// PAM document layout:
// <PAMDataset>
//   <Metadata><MDI key="YEAR">2020</MDI></Metadata>
//   <PAMRasterBand band="1"><Metadata>...</Metadata></PAMRasterBand>
// </PAMDataset>

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "PAMDataset")]
struct PamDataset {
    #[serde(rename = "Metadata")]
    metadata: PamMetadata,
    #[serde(rename = "PAMRasterBand", default)]
    bands: Vec<PamBand>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PamMetadata {
    #[serde(rename = "MDI", default)]
    items: Vec<PamItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PamItem {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PamBand {
    #[serde(rename = "@band")]
    band: usize,
    #[serde(rename = "Metadata")]
    metadata: PamMetadata,
}

fn to_pam_metadata(items: &BTreeMap<String, String>) -> PamMetadata {
    PamMetadata {
        items: items
            .iter()
            .map(|(key, value)| PamItem {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

/// Render a tag set as a PAM XML document.
pub fn render_pam(tags: &TagSet) -> Result<String, TagError> {
    let doc = PamDataset {
        metadata: to_pam_metadata(&tags.dataset),
        bands: tags
            .bands
            .iter()
            .map(|(&band, items)| PamBand {
                band,
                metadata: to_pam_metadata(items),
            })
            .collect(),
    };
    quick_xml::se::to_string(&doc).map_err(|e| TagError::Encode(e.to_string()))
}

/// Parse a PAM XML document back into a tag set.
pub fn parse_pam(xml: &str) -> Result<TagSet, TagError> {
    let doc: PamDataset = quick_xml::de::from_str(xml).map_err(|e| TagError::Encode(e.to_string()))?;
    let collect = |meta: PamMetadata| {
        meta.items
            .into_iter()
            .map(|item| (item.key, item.value))
            .collect::<BTreeMap<_, _>>()
    };
    Ok(TagSet {
        dataset: collect(doc.metadata),
        bands: doc
            .bands
            .into_iter()
            .map(|band| (band.band, collect(band.metadata)))
            .collect(),
    })
}

/// Sidecar path GDAL reads auxiliary metadata from.
pub fn sidecar_path(raster: &Path) -> PathBuf {
    let mut name = raster
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".aux.xml");
    raster.with_file_name(name)
}

/// Writes dataset and band tags for a tiled raster.
#[derive(Clone)]
pub struct MetadataTagger {
    inspector: RasterInspector,
    tags: TagConfig,
}

impl MetadataTagger {
    pub fn new(inspector: RasterInspector, tags: TagConfig) -> Self {
        Self { inspector, tags }
    }

    /// Tag `tiled` for `slice`.
    ///
    /// The raster's band count must equal `bands.len()`; otherwise nothing
    /// is written and [`TagError::BandCountMismatch`] is returned. Returns
    /// once the tag document is durable on disk, so the next stage never
    /// races an open writer.
    #[instrument(skip_all, fields(slice = %slice))]
    pub async fn tag(&self, tiled: &Path, slice: TimeSlice, bands: &BandSpec) -> Result<TagSet, TagError> {
        let info = self.inspector.inspect(tiled).await?;

        if info.band_count() != bands.len() {
            return Err(TagError::BandCountMismatch {
                expected: bands.len(),
                found: info.band_count(),
            });
        }

        // Only the count is enforced. A differing description is most
        // likely a server-side label, but it is worth surfacing.
        for (band_info, (index, band)) in info.bands.iter().zip(bands.indexed()) {
            if let Some(existing) = band_info.description.as_deref() {
                if !existing.is_empty() && existing != band.name {
                    warn!(
                        band = index,
                        configured = %band.name,
                        reported = %existing,
                        "Band description differs from configured name"
                    );
                }
            }
        }

        let tags = TagSet::for_slice(slice, bands, &self.tags);
        let document = render_pam(&tags)?;
        let sidecar = sidecar_path(tiled);
        write_atomically(&sidecar, document.as_bytes()).await?;

        info!(
            path = %tiled.display(),
            bands = bands.len(),
            dataset_tags = tags.dataset.len(),
            "Wrote raster tags"
        );
        Ok(tags)
    }
}
