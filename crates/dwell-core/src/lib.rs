//! Core domain records and canonical-key logic for Dwell.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dwell-core";

/// WGS84 coordinates attached to a scraped record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// The three snapshot categories the scrapers feed into the shared dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Sold,
    Listings,
    Rentals,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sold => "sold",
            Self::Listings => "listings",
            Self::Rentals => "rentals",
        }
    }

    pub fn all() -> &'static [SourceCategory] {
        &[Self::Sold, Self::Listings, Self::Rentals]
    }
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed sale scraped from a price-register style source. Sold history
/// is append-only across snapshot runs; overlapping scrape windows produce
/// duplicates that consolidation collapses by canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoldRecord {
    #[serde(default)]
    pub address: String,
    pub sold_date: NaiveDate,
    pub sold_price: f64,
    #[serde(default)]
    pub asking_price: Option<f64>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub beds: Option<u32>,
    #[serde(default)]
    pub baths: Option<u32>,
    #[serde(default)]
    pub area_sqm: Option<f64>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl SoldRecord {
    /// How many optional fields carry data. Used to pick the better of two
    /// records with the same canonical key.
    pub fn completeness(&self) -> usize {
        self.asking_price.is_some() as usize
            + self.property_type.is_some() as usize
            + self.beds.is_some() as usize
            + self.baths.is_some() as usize
            + self.area_sqm.is_some() as usize
            + self.geo.is_some() as usize
            + self.source_url.is_some() as usize
    }
}

/// A property currently on the market. Point-in-time data: each snapshot
/// supersedes the previous one entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(default)]
    pub address: String,
    pub asking_price: f64,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub beds: Option<u32>,
    #[serde(default)]
    pub ber_rating: Option<String>,
    #[serde(default)]
    pub area_sqm: Option<f64>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// A property currently offered for rent. Same lifecycle as [`ListingRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalRecord {
    #[serde(default)]
    pub address: String,
    pub monthly_rent: f64,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub beds: Option<u32>,
    #[serde(default)]
    pub ber_rating: Option<String>,
    #[serde(default)]
    pub area_sqm: Option<f64>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Lowercase an address, map punctuation to spaces, collapse whitespace runs.
/// "12 Oak Rd., Apt 3" and "12 oak rd apt 3" normalize identically.
pub fn normalize_address(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Address-only key for cross-category lookups (yield matching). None when
/// the address is empty or pure punctuation.
pub fn address_key(address: &str) -> Option<String> {
    let normalized = normalize_address(address);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Canonical key identifying one real-world sale: normalized address, sale
/// day, and price rounded to the whole currency unit. Two records with the
/// same key are the same transaction scraped on different days. None when no
/// address is available; such records carry no identity and are never
/// deduplicated.
pub fn sold_canonical_key(record: &SoldRecord) -> Option<String> {
    let address = address_key(&record.address)?;
    Some(format!(
        "{}|{}|{}",
        address,
        record.sold_date.format("%Y-%m-%d"),
        record.sold_price.round() as i64
    ))
}

/// A sold record as published to the dashboard, with derived pricing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSold {
    #[serde(flatten)]
    pub record: SoldRecord,
    pub canonical_key: Option<String>,
    pub price_per_sqm: Option<f64>,
    pub over_under_asking_percent: Option<f64>,
    pub estimated_yield: Option<f64>,
}

/// A current listing as published to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedListing {
    #[serde(flatten)]
    pub record: ListingRecord,
    pub canonical_key: Option<String>,
    pub price_per_sqm: Option<f64>,
    pub estimated_yield: Option<f64>,
}

/// A current rental as published to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRental {
    #[serde(flatten)]
    pub record: RentalRecord,
    pub canonical_key: Option<String>,
}

/// The single artifact the dashboard reads. `run_id` and `generated_at` are
/// run metadata; everything else is a pure function of the input snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedDataset {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub properties: Vec<UnifiedSold>,
    pub listings: Vec<UnifiedListing>,
    pub rentals: Vec<UnifiedRental>,
}
