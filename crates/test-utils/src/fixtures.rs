//! Stand-in raster content and inspector reports.
//!
//! Tests never run GDAL. A fake raster is a short text payload carrying
//! its band count; a simulated packager prefixes it with [`COG_MARKER`] and
//! appends the tag document it embedded. [`gdalinfo_for`] produces the JSON
//! the real `gdalinfo -json` would print for such a file.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

/// First line of a file the simulated COG driver wrote.
pub const COG_MARKER: &str = "COG";

/// Band count of the permanent-grassland coverage.
pub const GRASSLAND_BANDS: usize = 6;

/// Payload the fake WCS server returns for a slice.
pub fn fake_raster(bands: usize) -> Vec<u8> {
    format!("RAW bands={}\n", bands).into_bytes()
}

/// Band count encoded in a fake raster, anywhere in the file.
pub fn fake_band_count(content: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(content).ok()?;
    let start = text.find("bands=")? + "bands=".len();
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Whether the content was produced by the simulated COG driver.
pub fn is_fake_cog(content: &[u8]) -> bool {
    content.starts_with(COG_MARKER.as_bytes())
}

/// Tags found in a fake raster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeTags {
    pub dataset: BTreeMap<String, String>,
    /// Keyed by 1-based band index
    pub bands: BTreeMap<usize, BTreeMap<String, String>>,
}

/// Read the GDAL auxiliary metadata document embedded in a fake raster.
///
/// Only the `<MDI key="..">value</MDI>` items are picked up, which is all
/// the tagger writes.
pub fn fake_tags(content: &[u8]) -> FakeTags {
    let text = String::from_utf8_lossy(content);
    let mut tags = FakeTags::default();
    let Some(start) = text.find("<PAMDataset") else {
        return tags;
    };

    let doc = &text[start..];
    let (dataset, bands) = match doc.find("<PAMRasterBand") {
        Some(i) => doc.split_at(i),
        None => (doc, ""),
    };
    tags.dataset = mdi_items(dataset);
    for chunk in bands.split("<PAMRasterBand band=\"").skip(1) {
        if let Some((index, rest)) = chunk.split_once('"') {
            if let Ok(index) = index.parse() {
                tags.bands.insert(index, mdi_items(rest));
            }
        }
    }
    tags
}

fn mdi_items(xml: &str) -> BTreeMap<String, String> {
    xml.split("<MDI key=\"")
        .skip(1)
        .filter_map(|chunk| {
            let (key, rest) = chunk.split_once("\">")?;
            let (value, _) = rest.split_once("</MDI>")?;
            Some((unescape(key), unescape(value)))
        })
        .collect()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn metadata_domain(items: &BTreeMap<String, String>) -> Value {
    Value::Object(
        items
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<_, _>>(),
    )
}

/// A `gdalinfo -json` report for an untagged raster with `bands` bands.
///
/// `cog` controls the `IMAGE_STRUCTURE/LAYOUT` marker; every band carries
/// five overview levels either way.
pub fn gdalinfo_report(bands: usize, cog: bool) -> Value {
    tagged_gdalinfo_report(bands, cog, &FakeTags::default())
}

/// Like [`gdalinfo_report`], with `tags` in the default metadata domains.
pub fn tagged_gdalinfo_report(bands: usize, cog: bool, tags: &FakeTags) -> Value {
    let overviews: Vec<Value> = [2u64, 4, 8, 16, 32]
        .iter()
        .map(|f| json!({ "size": [2180 / f, 2887 / f] }))
        .collect();

    let mut structure = json!({ "COMPRESSION": "DEFLATE", "INTERLEAVE": "PIXEL" });
    if cog {
        structure["LAYOUT"] = json!("COG");
    }

    let empty = BTreeMap::new();
    json!({
        "driverShortName": "GTiff",
        "size": [2180, 2887],
        "metadata": {
            "": metadata_domain(&tags.dataset),
            "IMAGE_STRUCTURE": structure
        },
        "bands": (1..=bands)
            .map(|band| json!({
                "band": band,
                "block": [512, 512],
                "type": "Int16",
                "overviews": overviews.clone(),
                "metadata": { "": metadata_domain(tags.bands.get(&band).unwrap_or(&empty)) }
            }))
            .collect::<Vec<_>>()
    })
}

/// The report `gdalinfo -json` would print for a fake raster's content.
pub fn gdalinfo_for(content: &[u8]) -> Value {
    tagged_gdalinfo_report(
        fake_band_count(content).unwrap_or(0),
        is_fake_cog(content),
        &fake_tags(content),
    )
}
