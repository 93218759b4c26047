// API models and GTFS data handling for EMT Valencia (Empresa Municipal de
// Transportes de València)
//
// Data source:
// - Open data portal: https://opendata.vlci.valencia.es/
// - GTFS Static bundle: google_transit.zip from the
//   "google-transit-lines-stops-bus-schedules" dataset
//
// The feed is a zip of comma-delimited tables (stops.txt, routes.txt,
// trips.txt, stop_times.txt, ...). Scheduled times use the GTFS convention
// that the hour may run past 23 so a service day can extend beyond midnight.

use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};
use reqwest::blocking;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

// ============================================================================
// Data Structures
// ============================================================================

// Raw GTFS rows. Every field is kept as the string the feed carried; numeric
// and time parsing happens where the value is consumed. `#[serde(default)]`
// turns columns missing from a short row into empty strings.

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Route {
    pub route_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_type: String,
    pub route_color: String,
    pub route_text_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    // numeric in well-formed feeds, but carried as text like everything else
    pub stop_sequence: String,
    pub arrival_time: String,
    pub departure_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: String,
    pub stop_lon: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum GtfsError {
    FetchError(String),
    DecodeError(String),
    TableNotFoundError(String),
    TimeFormatError(String),
}

impl std::fmt::Display for GtfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GtfsError::FetchError(e) => write!(f, "Fetch error: {}", e),
            GtfsError::DecodeError(e) => write!(f, "Decode error: {}", e),
            GtfsError::TableNotFoundError(e) => write!(f, "Table not found: {}", e),
            GtfsError::TimeFormatError(e) => write!(f, "Time format error: {}", e),
        }
    }
}

impl std::error::Error for GtfsError {}

pub type Result<T> = std::result::Result<T, GtfsError>;

pub fn get_current_timestamp() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// Feed Archive
// ============================================================================

/// The decompressed GTFS bundle: table name to raw bytes. Built once per
/// download and never mutated afterwards; readers share it behind an `Arc`.
#[derive(Debug)]
pub struct FeedArchive {
    files: HashMap<String, Vec<u8>>,
}

impl FeedArchive {
    pub fn from_zip_bytes(zip_bytes: bytes::Bytes) -> Result<FeedArchive> {
        let cursor = Cursor::new(zip_bytes);
        let mut archive = ZipArchive::new(cursor)
            .map_err(|e| GtfsError::DecodeError(format!("Failed to open GTFS zip: {}", e)))?;

        let mut files = HashMap::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| {
                GtfsError::DecodeError(format!("Failed to read zip entry {}: {}", index, e))
            })?;

            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut contents).map_err(|e| {
                GtfsError::DecodeError(format!("Failed to extract '{}': {}", name, e))
            })?;
            files.insert(name, contents);
        }

        Ok(FeedArchive { files })
    }

    fn by_name(&self, table_name: &str) -> Option<&[u8]> {
        self.files.get(table_name).map(|contents| contents.as_slice())
    }
}

// ============================================================================
// Feed Store
// ============================================================================

struct CacheEntry {
    archive: Arc<FeedArchive>,
    fetched_at: u64,
}

/// In-memory cache around the remote GTFS bundle. One entry at a time: the
/// current archive plus the Unix time it was fetched. An entry is fresh while
/// `now - fetched_at < CACHE_TTL_SECS`; the first request observed after that
/// triggers a re-download which replaces the entry wholesale.
pub struct GtfsFeedStore {
    feed_url: String,
    cache: Mutex<Option<CacheEntry>>,
}

impl GtfsFeedStore {
    pub const CACHE_TTL_SECS: u64 = 3600 * 6;
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const PROBE_TIMEOUT_SECS: u64 = 10;

    pub fn new(feed_url: impl Into<String>) -> GtfsFeedStore {
        GtfsFeedStore {
            feed_url: feed_url.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// The current archive, re-downloading the feed when the cached copy is
    /// older than the TTL.
    ///
    /// The lock is held across the download, so concurrent callers that
    /// observe a stale cache collapse into a single fetch; the ones queued
    /// behind it find a fresh entry once they acquire the lock and return
    /// without touching the network. A failed download propagates to the
    /// caller and leaves the previous entry in place; it is already stale,
    /// so the next caller retries instead of being served old data.
    pub fn current_archive(&self) -> Result<Arc<FeedArchive>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|e| GtfsError::FetchError(format!("Failed to lock feed cache: {}", e)))?;

        if let Some(entry) = cache.as_ref() {
            if Self::unix_now().saturating_sub(entry.fetched_at) < Self::CACHE_TTL_SECS {
                return Ok(entry.archive.clone());
            }
        }

        let archive = Arc::new(Self::download_archive(&self.feed_url)?);
        *cache = Some(CacheEntry {
            archive: archive.clone(),
            fetched_at: Self::unix_now(),
        });

        Ok(archive)
    }

    fn download_archive(url: &str) -> Result<FeedArchive> {
        println!("📥 Downloading GTFS feed from {}", url);

        let client = blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GtfsError::FetchError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| GtfsError::FetchError(format!("Failed to download GTFS feed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GtfsError::FetchError(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let zip_bytes = response
            .bytes()
            .map_err(|e| GtfsError::FetchError(format!("Failed to read GTFS zip: {}", e)))?;

        println!("✓ Downloaded {} KB, extracting...", zip_bytes.len() / 1024);

        FeedArchive::from_zip_bytes(zip_bytes)
    }

    /// HEAD request against the feed URL, for the status endpoint. Does not
    /// touch the cache.
    pub fn probe_feed(&self) -> Result<u16> {
        let client = blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::PROBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| GtfsError::FetchError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .head(&self.feed_url)
            .send()
            .map_err(|e| GtfsError::FetchError(format!("Failed to reach GTFS feed: {}", e)))?;

        Ok(response.status().as_u16())
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    #[cfg(test)]
    fn seed_cache(&self, archive: Arc<FeedArchive>, fetched_at: u64) {
        *self.cache.lock().unwrap() = Some(CacheEntry {
            archive,
            fetched_at,
        });
    }
}

// ============================================================================
// Table Decoding
// ============================================================================

/// Decode one table of the archive into typed rows, preserving source order.
/// The first line is the header; fields map to struct fields by column name,
/// and rows shorter than the header fill the missing columns with empty
/// strings.
pub fn read_table<T>(archive: &FeedArchive, table_name: &str) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let blob = archive.by_name(table_name).ok_or_else(|| {
        GtfsError::TableNotFoundError(format!("'{}' is missing from the GTFS archive", table_name))
    })?;

    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(blob);

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row = result.map_err(|e| {
            GtfsError::DecodeError(format!("Failed to decode '{}': {}", table_name, e))
        })?;
        rows.push(row);
    }

    Ok(rows)
}

// ============================================================================
// Departure Resolution
// ============================================================================

/// Parse a GTFS time, where the hour may be 24 or more for services that run
/// past midnight: "24:35:00" is 00:35:00 on the day after `base_date`.
pub fn parse_gtfs_time(time_str: &str, base_date: NaiveDateTime) -> Result<NaiveDateTime> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return Err(GtfsError::TimeFormatError(format!(
            "Expected HH:MM:SS, got '{}'",
            time_str
        )));
    }

    let hours: u32 = parts[0].trim().parse().map_err(|_| {
        GtfsError::TimeFormatError(format!("Invalid hours in '{}'", time_str))
    })?;
    let minutes: u32 = parts[1].trim().parse().map_err(|_| {
        GtfsError::TimeFormatError(format!("Invalid minutes in '{}'", time_str))
    })?;
    let seconds: u32 = parts[2].trim().parse().map_err(|_| {
        GtfsError::TimeFormatError(format!("Invalid seconds in '{}'", time_str))
    })?;

    let extra_days = i64::from(hours / 24);
    let time = NaiveTime::from_hms_opt(hours % 24, minutes, seconds).ok_or_else(|| {
        GtfsError::TimeFormatError(format!("Out of range time '{}'", time_str))
    })?;

    Ok((base_date.date() + Duration::days(extra_days)).and_time(time))
}

/// All departures for a route/stop pair from `after_time` on, chronologically
/// ascending. A scheduled time that already passed today is taken to belong
/// to the next service day and rolled forward exactly one calendar day,
/// never more; a feed whose times all lie further in the past still lands
/// only one day ahead. Ties keep the order the rows had in the feed.
///
/// Rows whose `departure_time` does not parse are skipped with a console
/// diagnostic so one bad entry does not take out the whole query. Truncation
/// to a requested count is the caller's job; the full matching set is
/// returned.
pub fn upcoming_departures(
    route_id: &str,
    stop_id: &str,
    after_time: NaiveDateTime,
    archive: &FeedArchive,
) -> Result<Vec<(NaiveDateTime, StopTime)>> {
    let trips: Vec<Trip> = read_table(archive, "trips.txt")?;
    let stop_times: Vec<StopTime> = read_table(archive, "stop_times.txt")?;

    let trip_ids_for_route: HashSet<&str> = trips
        .iter()
        .filter(|trip| trip.route_id == route_id)
        .map(|trip| trip.trip_id.as_str())
        .collect();

    let mut upcoming = Vec::new();
    for stop_time in stop_times {
        if !trip_ids_for_route.contains(stop_time.trip_id.as_str())
            || stop_time.stop_id != stop_id
        {
            continue;
        }

        let resolved = match parse_gtfs_time(&stop_time.departure_time, after_time) {
            Ok(resolved) => resolved,
            Err(e) => {
                eprintln!(
                    "⚠️  Skipping stop time for trip {} at stop {}: {}",
                    stop_time.trip_id, stop_time.stop_id, e
                );
                continue;
            }
        };

        // Already gone today, so it belongs to the next service day.
        let departure_time = if resolved < after_time {
            resolved + Duration::days(1)
        } else {
            resolved
        };

        upcoming.push((departure_time, stop_time));
    }

    // stable, so equal instants keep their feed order
    upcoming.sort_by_key(|(departure_time, _)| *departure_time);

    Ok(upcoming)
}

// ============================================================================
// Tests
// ============================================================================
