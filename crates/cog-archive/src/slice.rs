//! Time slices and band semantics shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// One unit of the coverage time series: a calendar year.
///
/// Drives the subset query, the output filenames and the catalog item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct TimeSlice(i32);

impl TimeSlice {
    /// Create a slice for a four-digit calendar year.
    pub fn new(year: i32) -> Result<Self> {
        if !(1..=9999).contains(&year) {
            return Err(ArchiveError::InvalidSlice(format!(
                "year {} is outside 0001-9999",
                year
            )));
        }
        Ok(Self(year))
    }

    /// All years from `from` to `to`, inclusive.
    pub fn range(from: i32, to: i32) -> Result<Vec<Self>> {
        if from > to {
            return Err(ArchiveError::InvalidSlice(format!(
                "range start {} is after end {}",
                from, to
            )));
        }
        (from..=to).map(Self::new).collect()
    }

    pub fn year(&self) -> i32 {
        self.0
    }

    /// Instant at which this slice starts (January 1st, midnight UTC).
    pub fn start(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.0, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
            .and_utc()
    }

    /// Temporal subset expression for a GetCoverage request.
    ///
    /// e.g. `ansi("2020-01-01T00:00:00.000Z")`
    pub fn subset(&self) -> String {
        format!(
            "ansi(\"{}\")",
            self.start().format("%Y-%m-%dT%H:%M:%S%.3fZ")
        )
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl TryFrom<i32> for TimeSlice {
    type Error = ArchiveError;

    fn try_from(year: i32) -> Result<Self> {
        Self::new(year)
    }
}

impl From<TimeSlice> for i32 {
    fn from(slice: TimeSlice) -> Self {
        slice.0
    }
}

impl FromStr for TimeSlice {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        let year = s
            .trim()
            .parse::<i32>()
            .map_err(|_| ArchiveError::InvalidSlice(format!("not a year: {:?}", s)))?;
        Self::new(year)
    }
}

/// Parse a slice selection such as `2020`, `1993-2022` or `2019,2021`.
pub fn parse_slices(spec: &str) -> Result<Vec<TimeSlice>> {
    let mut slices = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((from, to)) => {
                let from: TimeSlice = from.parse()?;
                let to: TimeSlice = to.parse()?;
                slices.extend(TimeSlice::range(from.year(), to.year())?);
            }
            None => slices.push(part.parse()?),
        }
    }
    slices.sort();
    slices.dedup();
    if slices.is_empty() {
        return Err(ArchiveError::InvalidSlice(format!("no years in {:?}", spec)));
    }
    Ok(slices)
}

/// Semantics of one raster band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Short name, written as the band's `NAME` tag
    pub name: String,
    /// Human description, written as the band's `DESCRIPTION` tag
    pub description: String,
}

impl Band {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Ordered band semantics for the whole collection.
///
/// Band index is the 1-based position in this list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BandSpec(Vec<Band>);

impl BandSpec {
    pub fn new(bands: Vec<Band>) -> Self {
        Self(bands)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Band at a 1-based raster index.
    pub fn get(&self, index: usize) -> Option<&Band> {
        index.checked_sub(1).and_then(|i| self.0.get(i))
    }

    /// Iterate `(raster_index, band)` pairs with 1-based indices.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &Band)> {
        self.0.iter().enumerate().map(|(i, band)| (i + 1, band))
    }

    pub fn bands(&self) -> &[Band] {
        &self.0
    }
}

impl Default for BandSpec {
    /// Permanent-grassland phenology bands.
    fn default() -> Self {
        Self(vec![
            Band::new("doy1", "Greenup - Day of Year"),
            Band::new("doy25", "Cut for hay - Day of Year"),
            Band::new("doy26", "Cut for silage - Day of Year"),
            Band::new("sse1", "Greenup - Sum of Squares Error"),
            Band::new("sse25", "Hay - Sum of Squares Error"),
            Band::new("sse26", "Silage - Sum of Squares Error"),
        ])
    }
}
