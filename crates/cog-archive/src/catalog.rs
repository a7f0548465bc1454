//! STAC-style catalog of the produced archive.
//!
//! Only the record shape the archive needs: one collection document with
//! fixed metadata and one feature per published slice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::packager::{FinalArtifact, COG_MEDIA_TYPE};
use crate::slice::TimeSlice;
use crate::staging::write_atomically;

/// Fixed collection-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionMeta {
    pub id: String,
    pub title: String,
    pub description: String,
    pub license: String,
    pub keywords: Vec<String>,
    pub extent: Extent,
    pub providers: Vec<Provider>,
    pub item_assets: BTreeMap<String, ItemAsset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    /// `[min_x, min_y, max_x, max_y]` in the coverage CRS
    pub spatial: Vec<f64>,
    /// `[start, end]`, RFC 3339
    pub temporal: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAsset {
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

impl Default for CollectionMeta {
    fn default() -> Self {
        let asset = |title: &str| ItemAsset {
            title: title.to_string(),
            media_type: COG_MEDIA_TYPE.to_string(),
        };
        let provider = |name: &str, role: &str| Provider {
            name: name.to_string(),
            roles: vec![role.to_string()],
        };

        Self {
            id: "permanentgreenland_annually".to_string(),
            title: "Permanent Greenland Phenology Dataset".to_string(),
            description: "Grünland-Phänologie-Zeitreihe Deutschland 1993-2022 basierend auf Fernerkundung."
                .to_string(),
            license: "CC-BY-4.0".to_string(),
            keywords: ["Grünland", "Phänologie", "Fernerkundung", "Deutschland", "Zeitreihe"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            extent: Extent {
                spatial: vec![280425.207, 5235501.264, 934425.207, 6101501.265],
                temporal: vec![
                    "1993-01-01T00:00:00Z".to_string(),
                    "2022-01-01T00:00:00Z".to_string(),
                ],
            },
            providers: vec![
                provider("Julius Kühn-Institut", "producer"),
                provider("BonaRes Datenzentrum", "publisher"),
            ],
            item_assets: BTreeMap::from([
                ("doy1".to_string(), asset("Greenup - Day of Year")),
                ("doy25".to_string(), asset("Cut for hay - Day of Year")),
            ]),
        }
    }
}

/// Descriptive properties repeated on every item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemTemplate {
    /// Item title is `<title_prefix> <slice>`
    pub title_prefix: String,
    /// Asset title is `<asset_title_prefix> <slice>`
    pub asset_title_prefix: String,
    pub description: String,
    pub license: String,
    pub publisher: String,
    pub authors: Vec<String>,
    pub resource_type: String,
    pub subject: String,
    pub geography: String,
    pub funding: String,
    pub contact: String,
}

impl Default for ItemTemplate {
    fn default() -> Self {
        Self {
            title_prefix: "Grünland-Phänologie".to_string(),
            asset_title_prefix: "Grünland".to_string(),
            description: "Grünland-Phänologie-Metriken für Deutschland".to_string(),
            license: "CC-BY-4.0".to_string(),
            publisher: "BonaRes Datenzentrum".to_string(),
            authors: vec!["Julius Kühn-Institut".to_string()],
            resource_type: "Dataset".to_string(),
            subject: "Bodenforschung, Phänologie, Fernerkundung".to_string(),
            geography: "Deutschland".to_string(),
            funding: "Gefördert durch BMBF im Rahmen von BonaRes".to_string(),
            contact: "datenzentrum@bonares.de".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProperties {
    pub datetime: String,
    pub title: String,
    pub description: String,
    pub license: String,
    pub publisher: String,
    pub authors: Vec<String>,
    pub resource_type: String,
    pub subject: String,
    pub geography: String,
    pub funding: String,
    pub contact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub href: String,
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

/// One published slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub properties: ItemProperties,
    pub assets: BTreeMap<String, Asset>,
}

impl CatalogItem {
    /// The `data` asset pointing at the COG.
    pub fn data_asset(&self) -> Option<&Asset> {
        self.assets.get("data")
    }
}

/// The persisted collection document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub title: String,
    pub description: String,
    pub license: String,
    pub keywords: Vec<String>,
    pub extent: Extent,
    pub providers: Vec<Provider>,
    pub links: Vec<Link>,
    pub item_assets: BTreeMap<String, ItemAsset>,
    pub features: Vec<CatalogItem>,
}

/// Item id and output file stem for a slice.
pub fn item_id(prefix: &str, slice: TimeSlice) -> String {
    format!("{}_{}", prefix, slice)
}

/// Accumulates items during a run and emits the collection at the end.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    collection: CollectionMeta,
    template: ItemTemplate,
    prefix: String,
    items: Vec<(TimeSlice, CatalogItem)>,
}

impl CatalogBuilder {
    pub fn new(collection: CollectionMeta, template: ItemTemplate, prefix: impl Into<String>) -> Self {
        Self {
            collection,
            template,
            prefix: prefix.into(),
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record a published artifact. A second record for the same slice
    /// replaces the first.
    pub fn record(&mut self, slice: TimeSlice, artifact: &FinalArtifact) {
        let item = self.item_for(slice, artifact);
        self.items.retain(|(s, _)| *s != slice);
        self.items.push((slice, item));
    }

    fn item_for(&self, slice: TimeSlice, artifact: &FinalArtifact) -> CatalogItem {
        let t = &self.template;
        let properties = ItemProperties {
            datetime: slice.start().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            title: format!("{} {}", t.title_prefix, slice),
            description: t.description.clone(),
            license: t.license.clone(),
            publisher: t.publisher.clone(),
            authors: t.authors.clone(),
            resource_type: t.resource_type.clone(),
            subject: t.subject.clone(),
            geography: t.geography.clone(),
            funding: t.funding.clone(),
            contact: t.contact.clone(),
        };
        let data = Asset {
            href: artifact.file_name(),
            title: format!("{} {}", t.asset_title_prefix, slice),
            media_type: COG_MEDIA_TYPE.to_string(),
        };

        CatalogItem {
            kind: "Feature".to_string(),
            id: item_id(&self.prefix, slice),
            properties,
            assets: BTreeMap::from([("data".to_string(), data)]),
        }
    }

    /// Build the collection, items sorted by slice whatever the arrival order.
    pub fn emit(&self) -> CatalogCollection {
        let mut items = self.items.clone();
        items.sort_by_key(|(slice, _)| *slice);

        let meta = &self.collection;
        CatalogCollection {
            kind: "Collection".to_string(),
            id: meta.id.clone(),
            title: meta.title.clone(),
            description: meta.description.clone(),
            license: meta.license.clone(),
            keywords: meta.keywords.clone(),
            extent: meta.extent.clone(),
            providers: meta.providers.clone(),
            links: Vec::new(),
            item_assets: meta.item_assets.clone(),
            features: items.into_iter().map(|(_, item)| item).collect(),
        }
    }
}

/// Persist the collection as pretty JSON at `path`, replacing any previous
/// document atomically.
pub async fn write_catalog(collection: &CatalogCollection, path: &Path) -> Result<PathBuf> {
    let mut json = serde_json::to_vec_pretty(collection)?;
    json.push(b'\n');
    write_atomically(path, &json).await?;

    info!(
        path = %path.display(),
        items = collection.features.len(),
        "Wrote catalog"
    );
    Ok(path.to_path_buf())
}

/// Read a previously written collection.
pub async fn read_catalog(path: &Path) -> Result<CatalogCollection> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(year: i32) -> FinalArtifact {
        FinalArtifact {
            path: PathBuf::from(format!("/out/permanentgreenland_{}.tif", year)),
        }
    }

    fn slice(year: i32) -> TimeSlice {
        TimeSlice::new(year).unwrap()
    }

    fn builder() -> CatalogBuilder {
        CatalogBuilder::new(
            CollectionMeta::default(),
            ItemTemplate::default(),
            "permanentgreenland",
        )
    }

    #[test]
    fn test_item_shape() {
        let mut catalog = builder();
        catalog.record(slice(2020), &artifact(2020));
        let collection = catalog.emit();

        let item = &collection.features[0];
        assert_eq!(item.kind, "Feature");
        assert_eq!(item.id, "permanentgreenland_2020");
        assert_eq!(item.properties.datetime, "2020-01-01T00:00:00Z");
        assert_eq!(item.properties.title, "Grünland-Phänologie 2020");

        let data = item.data_asset().unwrap();
        assert_eq!(data.href, "permanentgreenland_2020.tif");
        assert_eq!(data.title, "Grünland 2020");
        assert_eq!(data.media_type, COG_MEDIA_TYPE);
    }

    #[test]
    fn test_emit_sorts_by_slice() {
        let mut catalog = builder();
        for year in [2021, 1993, 2020] {
            catalog.record(slice(year), &artifact(year));
        }

        let ids: Vec<_> = catalog.emit().features.into_iter().map(|f| f.id).collect();
        assert_eq!(
            ids,
            vec![
                "permanentgreenland_1993",
                "permanentgreenland_2020",
                "permanentgreenland_2021"
            ]
        );
    }

    #[test]
    fn test_record_replaces_same_slice() {
        let mut catalog = builder();
        catalog.record(slice(2020), &artifact(2020));
        catalog.record(slice(2020), &artifact(2020));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_collection_json_keys() {
        let mut catalog = builder();
        catalog.record(slice(2020), &artifact(2020));
        let value = serde_json::to_value(catalog.emit()).unwrap();

        for key in [
            "type", "id", "title", "description", "license", "keywords", "extent", "providers",
            "links", "item_assets", "features",
        ] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }
        assert_eq!(value["type"], "Collection");
        assert_eq!(value["extent"]["temporal"][0], "1993-01-01T00:00:00Z");
        assert_eq!(value["features"][0]["assets"]["data"]["type"], COG_MEDIA_TYPE);
        assert_eq!(value["item_assets"]["doy1"]["title"], "Greenup - Day of Year");
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stac_catalog.json");

        let mut catalog = builder();
        catalog.record(slice(2021), &artifact(2021));
        let collection = catalog.emit();

        write_catalog(&collection, &path).await.unwrap();
        assert_eq!(read_catalog(&path).await.unwrap(), collection);
    }
}
