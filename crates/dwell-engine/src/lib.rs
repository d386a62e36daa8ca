//! Consolidation pipeline: merge policies, derived pricing fields, run
//! orchestration.
//!
//! One parameterized engine replaces the per-script merge variants the
//! scrapers accreted over time: sold history is accumulated and deduplicated
//! by canonical key, point-in-time categories (listings, rentals) are
//! latest-wins, and every derived field is recomputed from scratch on each
//! run.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dwell_core::{
    address_key, sold_canonical_key, GeoPoint, ListingRecord, RentalRecord, SoldRecord,
    SourceCategory, UnifiedDataset, UnifiedListing, UnifiedRental, UnifiedSold,
};
use dwell_store::{FsSnapshotStore, SnapshotRepository, SnapshotSource, WriteError};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dwell-engine";

/// Geographic fallback radius for yield matching when no address match
/// exists. A rental further away than this is a different property.
pub const YIELD_MATCH_RADIUS_METERS: f64 = 200.0;

/// Jaro-Winkler floor above which two normalized addresses are treated as
/// the same property despite formatting noise. Set above the band where
/// neighbouring house numbers start to score.
pub const ADDRESS_SIMILARITY_FLOOR: f64 = 0.94;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub category: SourceCategory,
    pub dir: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The conventional layout when no `sources.yaml` exists: one directory
    /// per category under the data root.
    pub fn default_layout(data_root: &Path) -> Self {
        Self {
            sources: SourceCategory::all()
                .iter()
                .map(|&category| SourceConfig {
                    source_id: category.as_str().to_string(),
                    category,
                    dir: data_root.join(category.as_str()),
                    enabled: true,
                })
                .collect(),
        }
    }

    pub fn enabled_sources(&self) -> Vec<SnapshotSource> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| SnapshotSource {
                source_id: s.source_id.clone(),
                category: s.category,
                dir: s.dir.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidateConfig {
    pub data_root: PathBuf,
    pub registry_path: Option<PathBuf>,
    pub sold_dir: Option<PathBuf>,
    pub listings_dir: Option<PathBuf>,
    pub rentals_dir: Option<PathBuf>,
    pub output_path: PathBuf,
    pub allow_empty: bool,
}

impl ConsolidateConfig {
    pub fn from_env() -> Self {
        let data_root = std::env::var("DWELL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let output_path = std::env::var("DWELL_OUT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("unified.json"));
        Self {
            registry_path: std::env::var("DWELL_SOURCES").ok().map(PathBuf::from),
            sold_dir: std::env::var("DWELL_SOLD_DIR").ok().map(PathBuf::from),
            listings_dir: std::env::var("DWELL_LISTINGS_DIR").ok().map(PathBuf::from),
            rentals_dir: std::env::var("DWELL_RENTALS_DIR").ok().map(PathBuf::from),
            allow_empty: std::env::var("DWELL_ALLOW_EMPTY")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            output_path,
            data_root,
        }
    }

    fn resolve_registry(&self) -> Result<SourceRegistry> {
        if let Some(path) = &self.registry_path {
            return SourceRegistry::load(path);
        }
        let conventional = self.data_root.join("sources.yaml");
        if conventional.exists() {
            SourceRegistry::load(&conventional)
        } else {
            Ok(SourceRegistry::default_layout(&self.data_root))
        }
    }

    /// Enabled registry sources, with per-category directory overrides
    /// replacing that category's sources wholesale.
    pub fn resolve_sources(&self) -> Result<Vec<SnapshotSource>> {
        let mut sources = self.resolve_registry()?.enabled_sources();
        let overrides = [
            (SourceCategory::Sold, &self.sold_dir),
            (SourceCategory::Listings, &self.listings_dir),
            (SourceCategory::Rentals, &self.rentals_dir),
        ];
        for (category, dir) in overrides {
            if let Some(dir) = dir {
                sources.retain(|s| s.category != category);
                sources.push(SnapshotSource {
                    source_id: category.as_str().to_string(),
                    category,
                    dir: dir.clone(),
                });
            }
        }
        Ok(sources)
    }
}

/// A sold record tagged with its canonical key (None when the record has no
/// address and therefore no computable identity).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedSold {
    pub canonical_key: Option<String>,
    pub record: SoldRecord,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SoldMergeStats {
    pub input: usize,
    pub unique: usize,
    pub duplicates_dropped: usize,
    pub unmatched: usize,
}

/// Collision policy: most complete record wins, latest scrape breaks ties.
fn replaces(candidate: &SoldRecord, incumbent: &SoldRecord) -> bool {
    match candidate.completeness().cmp(&incumbent.completeness()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.scraped_at > incumbent.scraped_at,
    }
}

/// Chronological output with a total tie-break, so re-running over the same
/// snapshots yields byte-identical ordering.
fn sold_output_order(a: &KeyedSold, b: &KeyedSold) -> Ordering {
    a.record
        .sold_date
        .cmp(&b.record.sold_date)
        .then_with(|| a.canonical_key.cmp(&b.canonical_key))
        .then_with(|| a.record.address.cmp(&b.record.address))
        .then_with(|| a.record.scraped_at.cmp(&b.record.scraped_at))
}

/// Accumulate sold records from all snapshots into one deduplicated history.
/// Records without an address carry no identity: they are always kept,
/// never merged. `unique` counts the records that reach the output,
/// including the unmatched ones.
pub fn merge_sold(records: Vec<SoldRecord>) -> (Vec<KeyedSold>, SoldMergeStats) {
    use std::collections::hash_map::Entry;

    let mut stats = SoldMergeStats {
        input: records.len(),
        ..Default::default()
    };
    let mut by_key: HashMap<String, SoldRecord> = HashMap::new();
    let mut unmatched = Vec::new();

    for record in records {
        match sold_canonical_key(&record) {
            None => unmatched.push(record),
            Some(key) => match by_key.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    stats.duplicates_dropped += 1;
                    if replaces(&record, slot.get()) {
                        slot.insert(record);
                    }
                }
            },
        }
    }

    stats.unmatched = unmatched.len();
    let mut merged: Vec<KeyedSold> = by_key
        .into_iter()
        .map(|(key, record)| KeyedSold {
            canonical_key: Some(key),
            record,
        })
        .chain(unmatched.into_iter().map(|record| KeyedSold {
            canonical_key: None,
            record,
        }))
        .collect();
    merged.sort_by(sold_output_order);
    stats.unique = merged.len();
    (merged, stats)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Null when the area is missing, zero, negative, or non-finite; the
/// output never carries Infinity or NaN.
pub fn price_per_sqm(price: f64, area_sqm: Option<f64>) -> Option<f64> {
    let area = area_sqm?;
    if !area.is_finite() || area <= 0.0 || !price.is_finite() {
        return None;
    }
    let value = price / area;
    value.is_finite().then(|| round2(value))
}

/// Sold-vs-asking delta in percent, one decimal. Null without an asking
/// price to compare against.
pub fn over_under_asking_percent(sold_price: f64, asking_price: Option<f64>) -> Option<f64> {
    let asking = asking_price?;
    if !asking.is_finite() || asking == 0.0 || !sold_price.is_finite() {
        return None;
    }
    let value = (sold_price - asking) / asking * 100.0;
    value.is_finite().then(|| round1(value))
}

/// Annualized rent as a percentage of price, two decimals.
pub fn estimated_yield(monthly_rent: f64, price: f64) -> Option<f64> {
    if !monthly_rent.is_finite() || !price.is_finite() || price <= 0.0 {
        return None;
    }
    let value = monthly_rent * 12.0 / price * 100.0;
    value.is_finite().then(|| round2(value))
}

/// Great-circle distance in meters (haversine on a spherical earth).
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// A sale/listing only matches a rental of the same property type (case
/// insensitive) and the same bed count; either side missing those fields is
/// no match rather than a guess.
fn comparable(property_type: Option<&str>, beds: Option<u32>, rental: &RentalRecord) -> bool {
    let (Some(subject_type), Some(rental_type)) = (property_type, rental.property_type.as_deref())
    else {
        return false;
    };
    if !subject_type.eq_ignore_ascii_case(rental_type) {
        return false;
    }
    matches!((beds, rental.beds), (Some(a), Some(b)) if a == b)
}

/// Rental records indexed for yield matching against sold/listing records.
pub struct RentalIndex<'a> {
    by_address: HashMap<String, Vec<&'a RentalRecord>>,
    // Source order, with the normalized address cached per record.
    ordered: Vec<(Option<String>, &'a RentalRecord)>,
}

impl<'a> RentalIndex<'a> {
    pub fn build(rentals: &'a [RentalRecord]) -> Self {
        let mut by_address: HashMap<String, Vec<&'a RentalRecord>> = HashMap::new();
        let mut ordered = Vec::with_capacity(rentals.len());
        for rental in rentals {
            let key = address_key(&rental.address);
            if let Some(key) = &key {
                by_address.entry(key.clone()).or_default().push(rental);
            }
            ordered.push((key, rental));
        }
        Self { by_address, ordered }
    }

    /// The comparable rental for a sale/listing, or None. Exact normalized
    /// address first, then the most similar address above
    /// [`ADDRESS_SIMILARITY_FLOOR`], then the nearest rental within
    /// [`YIELD_MATCH_RADIUS_METERS`]. A miss is a null yield, never a
    /// fabricated match.
    pub fn find_comparable(
        &self,
        address: &str,
        property_type: Option<&str>,
        beds: Option<u32>,
        geo: Option<GeoPoint>,
    ) -> Option<&'a RentalRecord> {
        if let Some(key) = address_key(address) {
            if let Some(candidates) = self.by_address.get(&key) {
                if let Some(rental) = candidates
                    .iter()
                    .find(|r| comparable(property_type, beds, r))
                    .copied()
                {
                    return Some(rental);
                }
            }

            let mut best: Option<(f64, &'a RentalRecord)> = None;
            for (rental_key, rental) in &self.ordered {
                let Some(rental_key) = rental_key else { continue };
                if !comparable(property_type, beds, rental) {
                    continue;
                }
                let score = jaro_winkler(&key, rental_key);
                if score >= ADDRESS_SIMILARITY_FLOOR && best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, *rental));
                }
            }
            if let Some((_, rental)) = best {
                return Some(rental);
            }
        }

        let origin = geo?;
        let mut best: Option<(f64, &'a RentalRecord)> = None;
        for (_, rental) in &self.ordered {
            if !comparable(property_type, beds, rental) {
                continue;
            }
            let Some(rental_geo) = rental.geo else { continue };
            let distance = haversine_meters(origin, rental_geo);
            if distance <= YIELD_MATCH_RADIUS_METERS && best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, *rental));
            }
        }
        best.map(|(_, rental)| rental)
    }
}

pub fn enrich_sold(merged: Vec<KeyedSold>, rentals: &RentalIndex<'_>) -> Vec<UnifiedSold> {
    merged
        .into_iter()
        .map(|KeyedSold { canonical_key, record }| {
            let rental = rentals.find_comparable(
                &record.address,
                record.property_type.as_deref(),
                record.beds,
                record.geo,
            );
            UnifiedSold {
                canonical_key,
                price_per_sqm: price_per_sqm(record.sold_price, record.area_sqm),
                over_under_asking_percent: over_under_asking_percent(
                    record.sold_price,
                    record.asking_price,
                ),
                estimated_yield: rental
                    .and_then(|r| estimated_yield(r.monthly_rent, record.sold_price)),
                record,
            }
        })
        .collect()
}

pub fn enrich_listings(
    listings: Vec<ListingRecord>,
    rentals: &RentalIndex<'_>,
) -> Vec<UnifiedListing> {
    listings
        .into_iter()
        .map(|record| {
            let rental = rentals.find_comparable(
                &record.address,
                record.property_type.as_deref(),
                record.beds,
                record.geo,
            );
            UnifiedListing {
                canonical_key: address_key(&record.address),
                price_per_sqm: price_per_sqm(record.asking_price, record.area_sqm),
                estimated_yield: rental
                    .and_then(|r| estimated_yield(r.monthly_rent, record.asking_price)),
                record,
            }
        })
        .collect()
}

pub fn enrich_rentals(rentals: Vec<RentalRecord>) -> Vec<UnifiedRental> {
    rentals
        .into_iter()
        .map(|record| UnifiedRental {
            canonical_key: address_key(&record.address),
            record,
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum ConsolidateError {
    /// Writing an empty dataset would silently wipe the dashboard, so zero
    /// readable snapshots in a category is fatal unless explicitly allowed.
    #[error("no readable {category} snapshot files; refusing to replace the dashboard dataset (pass --allow-empty to override)")]
    EmptyCategory { category: SourceCategory },
    #[error("loading {category} snapshots")]
    Load {
        category: SourceCategory,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sold_files_read: usize,
    pub sold_files_skipped: usize,
    pub listing_files_read: usize,
    pub listing_files_skipped: usize,
    pub rental_files_read: usize,
    pub rental_files_skipped: usize,
    pub sold_records_in: usize,
    pub sold_unique: usize,
    pub duplicates_dropped: usize,
    pub sold_unmatched: usize,
    pub listings: usize,
    pub rentals: usize,
    pub output_path: String,
    pub output_bytes: usize,
    pub output_sha256: String,
}

/// One consolidation run: load snapshots, merge, derive, write atomically.
/// Single-threaded batch semantics; serializing concurrent invocations
/// against the same output path is the caller's job.
pub struct ConsolidatePipeline {
    config: ConsolidateConfig,
    repo: Box<dyn SnapshotRepository>,
}

impl ConsolidatePipeline {
    pub fn from_config(config: ConsolidateConfig) -> Result<Self> {
        let sources = config.resolve_sources()?;
        for category in SourceCategory::all() {
            if !sources.iter().any(|s| s.category == *category) {
                warn!(%category, "no snapshot source configured for category");
            }
        }
        let repo = FsSnapshotStore::new(sources, config.output_path.clone());
        Ok(Self {
            config,
            repo: Box::new(repo),
        })
    }

    pub fn with_repository(config: ConsolidateConfig, repo: Box<dyn SnapshotRepository>) -> Self {
        Self { config, repo }
    }

    pub async fn run_once(&self) -> Result<RunSummary, ConsolidateError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let sold = self
            .repo
            .load_sold()
            .await
            .map_err(|source| ConsolidateError::Load {
                category: SourceCategory::Sold,
                source,
            })?;
        let listings = self
            .repo
            .load_listings()
            .await
            .map_err(|source| ConsolidateError::Load {
                category: SourceCategory::Listings,
                source,
            })?;
        let rentals = self
            .repo
            .load_rentals()
            .await
            .map_err(|source| ConsolidateError::Load {
                category: SourceCategory::Rentals,
                source,
            })?;

        if !self.config.allow_empty {
            let loaded = [
                (SourceCategory::Sold, sold.files_read),
                (SourceCategory::Listings, listings.files_read),
                (SourceCategory::Rentals, rentals.files_read),
            ];
            for (category, files_read) in loaded {
                if files_read == 0 {
                    return Err(ConsolidateError::EmptyCategory { category });
                }
            }
        }

        let (merged, stats) = merge_sold(sold.records);
        info!(
            input = stats.input,
            unique = stats.unique,
            duplicates_dropped = stats.duplicates_dropped,
            unmatched = stats.unmatched,
            "merged sold history"
        );

        let rental_index = RentalIndex::build(&rentals.records);
        let properties = enrich_sold(merged, &rental_index);
        let unified_listings = enrich_listings(listings.records, &rental_index);
        let unified_rentals = enrich_rentals(rentals.records);

        let dataset = UnifiedDataset {
            run_id,
            generated_at: started_at,
            properties,
            listings: unified_listings,
            rentals: unified_rentals,
        };
        let written = self.repo.write_unified(&dataset).await?;
        info!(path = %written.path.display(), bytes = written.byte_size, "wrote unified dataset");

        let finished_at = Utc::now();
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            sold_files_read: sold.files_read,
            sold_files_skipped: sold.files_skipped,
            listing_files_read: listings.files_read,
            listing_files_skipped: listings.files_skipped,
            rental_files_read: rentals.files_read,
            rental_files_skipped: rentals.files_skipped,
            sold_records_in: stats.input,
            sold_unique: stats.unique,
            duplicates_dropped: stats.duplicates_dropped,
            sold_unmatched: stats.unmatched,
            listings: dataset.listings.len(),
            rentals: dataset.rentals.len(),
            output_path: written.path.display().to_string(),
            output_bytes: written.byte_size,
            output_sha256: written.sha256,
        })
    }
}

pub async fn run_consolidate_from_env() -> Result<RunSummary> {
    let config = ConsolidateConfig::from_env();
    let pipeline = ConsolidatePipeline::from_config(config)?;
    pipeline.run_once().await.map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::TimeZone;
    use dwell_store::MemorySnapshotStore;

    fn scraped(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, day, hour, 0, 0).single().unwrap()
    }

    fn sold(address: &str, date: &str, price: f64) -> SoldRecord {
        SoldRecord {
            address: address.to_string(),
            sold_date: date.parse().unwrap(),
            sold_price: price,
            asking_price: None,
            property_type: None,
            beds: None,
            baths: None,
            area_sqm: None,
            geo: None,
            source_url: None,
            scraped_at: scraped(1, 9),
        }
    }

    fn listing(address: &str, price: f64) -> ListingRecord {
        ListingRecord {
            address: address.to_string(),
            asking_price: price,
            property_type: Some("house".to_string()),
            beds: Some(3),
            ber_rating: None,
            area_sqm: None,
            geo: None,
            source_url: None,
            scraped_at: scraped(1, 9),
        }
    }

    fn rental(address: &str, rent: f64) -> RentalRecord {
        RentalRecord {
            address: address.to_string(),
            monthly_rent: rent,
            property_type: Some("house".to_string()),
            beds: Some(3),
            ber_rating: None,
            area_sqm: None,
            geo: None,
            source_url: None,
            scraped_at: scraped(1, 9),
        }
    }

    fn test_config(allow_empty: bool) -> ConsolidateConfig {
        ConsolidateConfig {
            data_root: PathBuf::from("."),
            registry_path: None,
            sold_dir: None,
            listings_dir: None,
            rentals_dir: None,
            output_path: PathBuf::from("unified.json"),
            allow_empty,
        }
    }

    #[test]
    fn collision_keeps_the_most_complete_record() {
        let sparse = sold("12 Oak Rd", "2026-03-14", 420_000.0);
        let mut rich = sparse.clone();
        rich.asking_price = Some(395_000.0);
        rich.area_sqm = Some(110.0);
        rich.scraped_at = scraped(2, 9);

        // Richer record arrives first; the sparse re-scrape must not displace it.
        let (merged, stats) = merge_sold(vec![rich.clone(), sparse.clone()]);
        assert_eq!(stats.unique, 1);
        assert_eq!(stats.duplicates_dropped, 1);
        assert_eq!(merged[0].record, rich);

        // And the same outcome in the opposite arrival order.
        let (merged, _) = merge_sold(vec![sparse, rich.clone()]);
        assert_eq!(merged[0].record, rich);
    }

    #[test]
    fn collision_tie_breaks_by_latest_scrape() {
        let early = sold("12 Oak Rd", "2026-03-14", 420_000.0);
        let mut late = early.clone();
        late.scraped_at = scraped(5, 9);
        late.source_url = None; // same completeness

        let (merged, _) = merge_sold(vec![early, late.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].record.scraped_at, late.scraped_at);
    }

    #[test]
    fn address_less_records_are_kept_not_deduplicated() {
        let a = sold("", "2026-03-14", 100_000.0);
        let b = sold("  ", "2026-03-14", 100_000.0);
        let (merged, stats) = merge_sold(vec![a, b]);
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.duplicates_dropped, 0);
        assert!(merged.iter().all(|k| k.canonical_key.is_none()));
    }

    #[test]
    fn merged_output_is_chronological_and_deterministic() {
        let records = vec![
            sold("3 Elm St", "2026-05-02", 300_000.0),
            sold("1 Ash Pk", "2026-05-01", 250_000.0),
            sold("2 Birch Ln", "2026-05-01", 275_000.0),
        ];
        let (merged, _) = merge_sold(records.clone());
        let addresses: Vec<_> = merged.iter().map(|k| k.record.address.as_str()).collect();
        assert_eq!(addresses, vec!["1 Ash Pk", "2 Birch Ln", "3 Elm St"]);

        let (again, _) = merge_sold(records);
        assert_eq!(merged, again);
    }

    #[test]
    fn division_by_missing_or_zero_area_is_null() {
        assert_eq!(price_per_sqm(300_000.0, None), None);
        assert_eq!(price_per_sqm(300_000.0, Some(0.0)), None);
        assert_eq!(price_per_sqm(300_000.0, Some(-5.0)), None);
        assert_eq!(price_per_sqm(300_000.0, Some(f64::NAN)), None);
        assert_eq!(price_per_sqm(330_000.0, Some(110.0)), Some(3_000.0));
    }

    #[test]
    fn over_under_asking_rounds_to_one_decimal() {
        assert_eq!(over_under_asking_percent(430_000.0, Some(400_000.0)), Some(7.5));
        assert_eq!(over_under_asking_percent(388_000.0, Some(400_000.0)), Some(-3.0));
        assert_eq!(over_under_asking_percent(430_000.0, None), None);
        assert_eq!(over_under_asking_percent(430_000.0, Some(0.0)), None);
    }

    #[test]
    fn yield_requires_same_type_and_exact_bed_count() {
        let rentals = vec![rental("12 Oak Rd, Dublin 7", 2_000.0)];
        let index = RentalIndex::build(&rentals);

        let hit = index.find_comparable("12 Oak Rd., Dublin 7", Some("house"), Some(3), None);
        assert!(hit.is_some());
        assert_eq!(
            estimated_yield(hit.unwrap().monthly_rent, 400_000.0),
            Some(6.0)
        );

        // Two beds off: a different kind of property, no match.
        assert!(index
            .find_comparable("12 Oak Rd., Dublin 7", Some("house"), Some(5), None)
            .is_none());
        // Type mismatch.
        assert!(index
            .find_comparable("12 Oak Rd., Dublin 7", Some("apartment"), Some(3), None)
            .is_none());
        // Missing bed count on the subject side: never guess.
        assert!(index
            .find_comparable("12 Oak Rd., Dublin 7", Some("house"), None, None)
            .is_none());
    }

    #[test]
    fn yield_matches_near_identical_addresses() {
        let rentals = vec![rental("12 Oak Road, Dublin 7", 2_000.0)];
        let index = RentalIndex::build(&rentals);

        // Transposition typo in the scrape still resolves to the same house.
        assert!(index
            .find_comparable("12 Oak Raod, Dublin 7", Some("house"), Some(3), None)
            .is_some());
        // A different street does not.
        assert!(index
            .find_comparable("98 Elm Street, Cork", Some("house"), Some(3), None)
            .is_none());
    }

    #[test]
    fn yield_geo_fallback_honors_the_radius() {
        let mut nearby = rental("The Old Mill, Unit 4", 1_500.0);
        nearby.geo = Some(GeoPoint { lat: 53.3440, lng: -6.2600 });
        let index_input = vec![nearby];
        let index = RentalIndex::build(&index_input);

        // ~144 m north: inside the radius.
        let inside = GeoPoint { lat: 53.3453, lng: -6.2600 };
        assert!(index
            .find_comparable("12 Distillery Walk", Some("house"), Some(3), Some(inside))
            .is_some());

        // ~445 m north: outside.
        let outside = GeoPoint { lat: 53.3480, lng: -6.2600 };
        assert!(index
            .find_comparable("12 Distillery Walk", Some("house"), Some(3), Some(outside))
            .is_none());
    }

    #[test]
    fn haversine_is_zero_at_identity_and_symmetric() {
        let a = GeoPoint { lat: 53.3440, lng: -6.2600 };
        let b = GeoPoint { lat: 53.3453, lng: -6.2615 };
        assert_eq!(haversine_meters(a, a), 0.0);
        assert!((haversine_meters(a, b) - haversine_meters(b, a)).abs() < 1e-9);
        // One degree of latitude is about 111 km.
        let north = GeoPoint { lat: 54.3440, lng: -6.2600 };
        let d = haversine_meters(a, north);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    /// Run a consolidation over the given sold records, with one listing
    /// and one rental snapshot so the empty-input guard stays satisfied.
    async fn run_sold(records: Vec<SoldRecord>) -> (RunSummary, Arc<MemorySnapshotStore>) {
        let store = Arc::new(
            MemorySnapshotStore::new()
                .with_sold(records)
                .with_listings(vec![listing("1 Quay St", 300_000.0)])
                .with_rentals(vec![rental("1 Quay St", 1_500.0)]),
        );
        let pipeline =
            ConsolidatePipeline::with_repository(test_config(false), Box::new(store.clone()));
        let summary = pipeline.run_once().await.expect("run");
        (summary, store)
    }

    fn written_sold_keys(store: &MemorySnapshotStore) -> HashSet<String> {
        store
            .written()
            .last()
            .expect("a written dataset")
            .properties
            .iter()
            .filter_map(|p| p.canonical_key.clone())
            .collect()
    }

    #[tokio::test]
    async fn consolidation_accumulates_monotonically_across_runs() {
        let s1: Vec<SoldRecord> = (0..100)
            .map(|i| sold(&format!("{i} Ash Pk"), "2026-05-01", 200_000.0 + i as f64))
            .collect();
        // 20 records overlap s1 by canonical key, 80 are new.
        let s2: Vec<SoldRecord> = (80..180)
            .map(|i| sold(&format!("{i} Ash Pk"), "2026-05-01", 200_000.0 + i as f64))
            .collect();

        let (first, first_store) = run_sold(s1.clone()).await;
        assert_eq!(first.sold_unique, 100);
        let first_keys = written_sold_keys(&first_store);
        assert_eq!(first_keys.len(), 100);

        let mut superset = s1;
        superset.extend(s2);
        let (second, second_store) = run_sold(superset).await;
        assert_eq!(second.sold_unique, 180);
        assert_eq!(second.duplicates_dropped, 20);

        // Every first-run identity is still present in the second run.
        let second_keys = written_sold_keys(&second_store);
        assert_eq!(second_keys.len(), 180);
        assert!(first_keys.is_subset(&second_keys));
    }

    #[tokio::test]
    async fn reconsolidating_unchanged_inputs_is_idempotent() {
        let records = vec![
            sold("12 Oak Rd", "2026-03-14", 420_000.0),
            sold("9 Elm St", "2026-03-10", 310_000.0),
        ];

        let (_, store_a) = run_sold(records.clone()).await;
        let (_, store_b) = run_sold(records).await;

        let dataset_a = store_a.written().pop().expect("dataset a");
        let mut dataset_b = store_b.written().pop().expect("dataset b");
        // Run metadata is the only permitted difference between runs.
        dataset_b.run_id = dataset_a.run_id;
        dataset_b.generated_at = dataset_a.generated_at;

        assert_eq!(
            serde_json::to_vec_pretty(&dataset_a).expect("serialize a"),
            serde_json::to_vec_pretty(&dataset_b).expect("serialize b"),
        );
    }

    #[tokio::test]
    async fn refuses_to_write_when_a_category_has_no_snapshots() {
        let store = MemorySnapshotStore::new()
            .with_sold(vec![sold("12 Oak Rd", "2026-03-14", 420_000.0)])
            .with_listings(vec![listing("1 Quay St", 300_000.0)]);
        // rentals: zero files read
        let pipeline = ConsolidatePipeline::with_repository(test_config(false), Box::new(store));
        let err = pipeline.run_once().await.expect_err("must refuse");
        match err {
            ConsolidateError::EmptyCategory { category } => {
                assert_eq!(category, SourceCategory::Rentals)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn allow_empty_overrides_the_empty_input_guard() {
        let store = MemorySnapshotStore::new();
        let pipeline = ConsolidatePipeline::with_repository(test_config(true), Box::new(store));
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.sold_unique, 0);
        assert_eq!(summary.listings, 0);
        assert_eq!(summary.rentals, 0);
    }

    #[test]
    fn registry_defaults_and_overrides_resolve() {
        let registry = SourceRegistry::default_layout(Path::new("/srv/dwell/data"));
        assert_eq!(registry.sources.len(), 3);
        assert!(registry.sources.iter().all(|s| s.enabled));

        let yaml = r#"
sources:
  - source_id: price-register
    category: sold
    dir: data/register
  - source_id: daft-sales
    category: listings
    dir: data/daft
    enabled: false
"#;
        let parsed: SourceRegistry = serde_yaml::from_str(yaml).expect("parse registry");
        assert_eq!(parsed.sources.len(), 2);
        assert!(parsed.sources[0].enabled, "enabled defaults to true");
        let enabled = parsed.enabled_sources();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source_id, "price-register");

        let mut config = test_config(false);
        config.listings_dir = Some(PathBuf::from("/tmp/listings-override"));
        let sources = config.resolve_sources().expect("resolve");
        let listing_sources: Vec<_> = sources
            .iter()
            .filter(|s| s.category == SourceCategory::Listings)
            .collect();
        assert_eq!(listing_sources.len(), 1);
        assert_eq!(
            listing_sources[0].dir,
            PathBuf::from("/tmp/listings-override")
        );
    }
}
