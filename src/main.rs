// Backend API server for EMT Valencia bus schedules
// EMT Valencia (Empresa Municipal de Transportes de València) open data:
// https://opendata.vlci.valencia.es/

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use chrono_tz::Europe::Madrid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

mod emt_api_models;
use emt_api_models::{
    get_current_timestamp, read_table, upcoming_departures, GtfsError, GtfsFeedStore, Route, Stop,
    StopTime, Trip,
};

// GTFS feed URL for EMT Valencia (official open data portal)
// https://opendata.vlci.valencia.es/dataset/google-transit-lines-stops-bus-schedules
const GTFS_URL: &str = "https://opendata.vlci.valencia.es/dataset/google-transit-lines-stops-bus-schedules/resource/c81b69e6-c082-44dc-acc6-66fc417b4e66/download/google_transit.zip";

#[derive(Clone)]
struct AppState {
    store: Arc<GtfsFeedStore>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    source: String,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: get_current_timestamp(),
            source: "EMT Valencia".to_string(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: get_current_timestamp(),
            source: "EMT Valencia".to_string(),
        }
    }
}

fn service_unavailable(e: GtfsError) -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(ApiResponse::<serde_json::Value>::error(format!(
        "Service unavailable: {}. The GTFS data source may be temporarily unavailable.",
        e
    )))
}

fn task_panicked(e: tokio::task::JoinError) -> HttpResponse {
    eprintln!("❌ Worker task panicked: {}", e);
    HttpResponse::InternalServerError().json(ApiResponse::<serde_json::Value>::error(
        "Internal server error".to_string(),
    ))
}

/// Valencia wall-clock time, used as the reference instant for departures.
fn valencia_now() -> chrono::NaiveDateTime {
    Utc::now().with_timezone(&Madrid).naive_local()
}

/// Distance between two WGS84 points in meters (haversine formula).
fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let (lat1_rad, lon1_rad) = (lat1.to_radians(), lon1.to_radians());
    let (lat2_rad, lon2_rad) = (lat2.to_radians(), lon2.to_radians());
    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// `stop_sequence` is numeric in well-formed feeds but carried as text; an
/// absent or garbled value sorts first instead of dropping the row.
fn stop_sequence_or_default(stop_time: &StopTime) -> u32 {
    stop_time.stop_sequence.trim().parse().unwrap_or(0)
}

/// Numeric short names first ("4" before "10" before "N1"), then alphabetic.
fn route_sort_key(route: &Route) -> (u8, u32, String) {
    match route.route_short_name.parse::<u32>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, route.route_short_name.clone()),
    }
}

// ============================================================================
// Health & Status Endpoints
// ============================================================================

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "service": "EMT Valencia Bus Schedule API",
        "version": "0.1.0",
        "endpoints": {
            "find_stop": "/find-stop?name={stop_name}",
            "find_route": "/find-route?number={route_number}",
            "stops": "/stops?q={search_term}",
            "routes": "/routes?q={search_term}",
            "departures": "/departures?route_id={route_id}&stop_id={stop_id}&limit={limit}",
            "gtfs_status": "/gtfs-status",
            "health": "/health"
        }
    }))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "EMT Valencia Bus Schedule API",
        "version": "0.1.0",
        "timestamp": get_current_timestamp()
    }))
}

async fn gtfs_status(state: web::Data<AppState>) -> HttpResponse {
    let store = state.store.clone();
    let feed_url = store.feed_url().to_string();

    match tokio::task::spawn_blocking(move || store.probe_feed()).await {
        Ok(Ok(status_code)) if (200..300).contains(&status_code) => {
            HttpResponse::Ok().json(serde_json::json!({
                "status": "available",
                "url": feed_url,
                "message": "GTFS data source is accessible"
            }))
        }
        Ok(Ok(status_code)) => HttpResponse::Ok().json(serde_json::json!({
            "status": "unavailable",
            "url": feed_url,
            "status_code": status_code,
            "message": format!("GTFS data source returned status code {}", status_code)
        })),
        Ok(Err(e)) => HttpResponse::Ok().json(serde_json::json!({
            "status": "error",
            "url": feed_url,
            "error": e.to_string(),
            "message": "Failed to connect to GTFS data source"
        })),
        Err(e) => task_panicked(e),
    }
}

// ============================================================================
// Stop Endpoints
// ============================================================================

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
}

async fn list_stops(state: web::Data<AppState>, query: web::Query<ListQuery>) -> HttpResponse {
    let store = state.store.clone();
    let filter = query.q.clone().unwrap_or_default();
    let filter_lower = filter.to_lowercase();

    let result = tokio::task::spawn_blocking(move || -> emt_api_models::Result<Vec<Stop>> {
        let archive = store.current_archive()?;
        let mut stops: Vec<Stop> = read_table(&archive, "stops.txt")?;
        if !filter_lower.is_empty() {
            stops.retain(|s| s.stop_name.to_lowercase().contains(&filter_lower));
        }
        Ok(stops)
    })
    .await;

    match result {
        Ok(Ok(stops)) => {
            println!("📍 Stops requested: {} match", stops.len());
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "count": stops.len(),
                "filter": if filter.is_empty() { None } else { Some(filter) },
                "stops": stops.iter().map(|s| serde_json::json!({
                    "stop_id": s.stop_id,
                    "name": s.stop_name,
                    "lat": s.stop_lat,
                    "lon": s.stop_lon
                })).collect::<Vec<_>>()
            })))
        }
        Ok(Err(e)) => service_unavailable(e),
        Err(e) => task_panicked(e),
    }
}

#[derive(Deserialize)]
struct FindStopQuery {
    name: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    radius: Option<f64>,
    limit: Option<usize>,
}

async fn find_stop(state: web::Data<AppState>, query: web::Query<FindStopQuery>) -> HttpResponse {
    let query = query.into_inner();
    let store = state.store.clone();

    let name_filter = query.name.clone().unwrap_or_default().to_lowercase();
    let location = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };
    let radius = query.radius.unwrap_or(500.0).clamp(50.0, 5000.0);
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    type StopMatch = (Stop, f64, f64, Option<f64>);
    let result = tokio::task::spawn_blocking(move || -> emt_api_models::Result<Vec<StopMatch>> {
        let archive = store.current_archive()?;
        let stops: Vec<Stop> = read_table(&archive, "stops.txt")?;

        let mut matches: Vec<StopMatch> = Vec::new();
        for stop in stops {
            if !name_filter.is_empty() && !stop.stop_name.to_lowercase().contains(&name_filter) {
                continue;
            }
            let (Ok(stop_lat), Ok(stop_lon)) = (
                stop.stop_lat.trim().parse::<f64>(),
                stop.stop_lon.trim().parse::<f64>(),
            ) else {
                eprintln!("⚠️  Skipping stop {} with unparsable coordinates", stop.stop_id);
                continue;
            };

            let distance =
                location.map(|(lat, lon)| haversine_distance(lat, lon, stop_lat, stop_lon));
            if let Some(d) = distance {
                if d > radius {
                    continue;
                }
            }
            matches.push((stop, stop_lat, stop_lon, distance));
        }

        if location.is_some() {
            matches.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            matches.sort_by(|a, b| a.0.stop_name.cmp(&b.0.stop_name));
        }
        matches.truncate(limit);

        Ok(matches)
    })
    .await;

    match result {
        Ok(Ok(matches)) => {
            println!("📍 Stop search: {} match", matches.len());
            let stops: Vec<serde_json::Value> = matches
                .iter()
                .map(|(stop, lat, lon, distance)| {
                    let mut info = serde_json::json!({
                        "stop_id": stop.stop_id,
                        "name": stop.stop_name,
                        "location": { "lat": lat, "lon": lon }
                    });
                    if let Some(d) = distance {
                        info["distance_meters"] = serde_json::json!((d * 10.0).round() / 10.0);
                    }
                    info
                })
                .collect();

            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "count": stops.len(),
                "search_criteria": {
                    "name": query.name,
                    "location": location.map(|(lat, lon)| serde_json::json!({ "lat": lat, "lon": lon })),
                    "radius_meters": location.map(|_| radius)
                },
                "stops": stops
            })))
        }
        Ok(Err(e)) => service_unavailable(e),
        Err(e) => task_panicked(e),
    }
}

// ============================================================================
// Route Endpoints
// ============================================================================

async fn list_routes(state: web::Data<AppState>, query: web::Query<ListQuery>) -> HttpResponse {
    let store = state.store.clone();
    let filter = query.q.clone().unwrap_or_default();
    let filter_lower = filter.to_lowercase();

    let result = tokio::task::spawn_blocking(move || -> emt_api_models::Result<Vec<Route>> {
        let archive = store.current_archive()?;
        let mut routes: Vec<Route> = read_table(&archive, "routes.txt")?;
        if !filter_lower.is_empty() {
            routes.retain(|r| {
                r.route_id.to_lowercase().contains(&filter_lower)
                    || r.route_short_name.to_lowercase().contains(&filter_lower)
                    || r.route_long_name.to_lowercase().contains(&filter_lower)
            });
        }
        routes.sort_by_key(route_sort_key);
        Ok(routes)
    })
    .await;

    match result {
        Ok(Ok(routes)) => {
            println!("🚌 Routes requested: {} match", routes.len());
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "count": routes.len(),
                "filter": if filter.is_empty() { None } else { Some(filter) },
                "routes": routes
            })))
        }
        Ok(Err(e)) => service_unavailable(e),
        Err(e) => task_panicked(e),
    }
}

#[derive(Deserialize)]
struct FindRouteQuery {
    number: Option<String>,
    name: Option<String>,
    include_stops: Option<bool>,
    limit: Option<usize>,
}

async fn find_route(state: web::Data<AppState>, query: web::Query<FindRouteQuery>) -> HttpResponse {
    let query = query.into_inner();
    let store = state.store.clone();

    let number = query.number.clone().unwrap_or_default().to_lowercase();
    let name = query.name.clone().unwrap_or_default().to_lowercase();
    let include_stops = query.include_stops.unwrap_or(false);
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    let result =
        tokio::task::spawn_blocking(move || -> emt_api_models::Result<Vec<serde_json::Value>> {
        let archive = store.current_archive()?;
        let mut routes: Vec<Route> = read_table(&archive, "routes.txt")?;

        if !number.is_empty() {
            routes.retain(|r| {
                r.route_id.to_lowercase().contains(&number)
                    || r.route_short_name.to_lowercase().contains(&number)
            });
        }
        if !name.is_empty() {
            routes.retain(|r| r.route_long_name.to_lowercase().contains(&name));
        }

        routes.sort_by_key(route_sort_key);
        routes.truncate(limit);

        // Tables are shared across all matched routes, so read them once.
        let mut result_routes = Vec::new();
        if include_stops {
            let trips: Vec<Trip> = read_table(&archive, "trips.txt")?;
            let stop_times: Vec<StopTime> = read_table(&archive, "stop_times.txt")?;
            let stops: Vec<Stop> = read_table(&archive, "stops.txt")?;
            let stops_by_id: HashMap<&str, &Stop> =
                stops.iter().map(|s| (s.stop_id.as_str(), s)).collect();

            for route in &routes {
                let mut route_info = serde_json::json!(route);

                // The stop list of the first trip stands in for the route.
                let representative_trip = trips.iter().find(|t| t.route_id == route.route_id);
                let mut trip_stops: Vec<&StopTime> = match representative_trip {
                    Some(trip) => stop_times
                        .iter()
                        .filter(|st| st.trip_id == trip.trip_id)
                        .collect(),
                    None => Vec::new(),
                };
                trip_stops.sort_by_key(|st| stop_sequence_or_default(st));

                let stop_list: Vec<serde_json::Value> = trip_stops
                    .iter()
                    .filter_map(|st| {
                        stops_by_id.get(st.stop_id.as_str()).map(|stop| {
                            serde_json::json!({
                                "stop_sequence": stop_sequence_or_default(st),
                                "stop_id": st.stop_id,
                                "stop_name": stop.stop_name,
                                "arrival_time": st.arrival_time,
                                "departure_time": st.departure_time
                            })
                        })
                    })
                    .collect();

                route_info["total_stops"] = serde_json::json!(stop_list.len());
                route_info["stops"] = serde_json::Value::Array(stop_list);
                result_routes.push(route_info);
            }
        } else {
            result_routes = routes.iter().map(|r| serde_json::json!(r)).collect();
        }

        Ok(result_routes)
    })
    .await;

    match result {
        Ok(Ok(routes)) => {
            println!("🚌 Route search: {} match", routes.len());
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "count": routes.len(),
                "search_criteria": {
                    "number": query.number,
                    "name": query.name,
                    "include_stops": include_stops
                },
                "routes": routes
            })))
        }
        Ok(Err(e)) => service_unavailable(e),
        Err(e) => task_panicked(e),
    }
}

// ============================================================================
// Departures Endpoint
// ============================================================================

#[derive(Deserialize)]
struct DeparturesQuery {
    route_id: String,
    stop_id: String,
    limit: Option<usize>,
}

async fn departures(
    state: web::Data<AppState>,
    query: web::Query<DeparturesQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let store = state.store.clone();

    let route_id = query.route_id.clone();
    let stop_id = query.stop_id.clone();
    let limit = query.limit.unwrap_or(5).clamp(1, 50);

    type Departures = Vec<(chrono::NaiveDateTime, StopTime)>;
    let result = tokio::task::spawn_blocking(move || -> emt_api_models::Result<Departures> {
        let archive = store.current_archive()?;
        upcoming_departures(&route_id, &stop_id, valencia_now(), &archive)
    })
    .await;

    match result {
        Ok(Ok(results)) => {
            println!(
                "🚏 Departures requested for route {} at stop {}: {} scheduled",
                query.route_id,
                query.stop_id,
                results.len()
            );

            if results.is_empty() {
                return HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                    "message": format!(
                        "No upcoming departures found for route {} at stop {}",
                        query.route_id, query.stop_id
                    ),
                    "departures": []
                })));
            }

            // The resolver returns the full ordered set; the request limit
            // applies here at the boundary.
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "route_id": query.route_id,
                "stop_id": query.stop_id,
                "departures": results.iter().take(limit).map(|(departure_time, st)| {
                    serde_json::json!({
                        "departure_time": departure_time.format("%H:%M:%S").to_string(),
                        "trip_id": st.trip_id,
                        "stop_sequence": st.stop_sequence
                    })
                }).collect::<Vec<_>>()
            })))
        }
        Ok(Err(e)) => service_unavailable(e),
        Err(e) => task_panicked(e),
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server() -> std::io::Result<()> {
    let app_state = AppState {
        store: Arc::new(GtfsFeedStore::new(GTFS_URL)),
    };

    println!("🌐 Server running on: http://0.0.0.0:8080");
    println!("📡 GTFS feed: {}", GTFS_URL);
    println!(
        "🔄 Feed cache TTL: {} hours\n",
        GtfsFeedStore::CACHE_TTL_SECS / 3600
    );

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET  /                    - Service info                  │");
    println!("│   GET  /health              - Health check                  │");
    println!("│   GET  /gtfs-status         - Feed availability probe       │");
    println!("│   GET  /stops               - All stops (?q= name filter)   │");
    println!("│   GET  /routes              - All routes (?q= filter)       │");
    println!("│   GET  /find-stop           - Stops by name or location     │");
    println!("│   GET  /find-route          - Routes by number or name      │");
    println!("│   GET  /departures          - Next departures for a stop    │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    println!("💡 The GTFS bundle is downloaded on the first request and kept in memory.\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/", web::get().to(root))
            .route("/health", web::get().to(health_check))
            .route("/gtfs-status", web::get().to(gtfs_status))
            .route("/stops", web::get().to(list_stops))
            .route("/routes", web::get().to(list_routes))
            .route("/find-stop", web::get().to(find_stop))
            .route("/find-route", web::get().to(find_route))
            .route("/departures", web::get().to(departures))
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║    🚍 EMT Valencia Bus Schedule API                        ║");
    println!("║    Version: 0.1.0                                          ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    actix_web::rt::System::new().block_on(run_server())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn haversine_matches_known_distances() {
        // one degree of latitude is about 111.2 km
        let d = haversine_distance(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 200.0, "got {}", d);

        assert_eq!(haversine_distance(39.4699, -0.3763, 39.4699, -0.3763), 0.0);

        // Plaza del Ayuntamiento to the Estació del Nord is a few hundred meters
        let d = haversine_distance(39.4699, -0.3763, 39.4664, -0.3772);
        assert!(d > 300.0 && d < 500.0, "got {}", d);
    }

    #[test]
    fn stop_sequence_parses_numerically_with_zero_default() {
        let st = |seq: &str| StopTime {
            stop_sequence: seq.to_string(),
            ..Default::default()
        };

        assert_eq!(stop_sequence_or_default(&st("7")), 7);
        assert_eq!(stop_sequence_or_default(&st(" 12 ")), 12);
        assert_eq!(stop_sequence_or_default(&st("")), 0);
        assert_eq!(stop_sequence_or_default(&st("abc")), 0);

        // numeric ordering, not lexicographic: 2 before 10
        let mut stop_times = vec![st("10"), st("2")];
        stop_times.sort_by_key(stop_sequence_or_default);
        assert_eq!(stop_times[0].stop_sequence, "2");
        assert_eq!(stop_times[1].stop_sequence, "10");
    }

    #[test]
    fn routes_sort_numeric_short_names_first() {
        let route = |short: &str| Route {
            route_short_name: short.to_string(),
            ..Default::default()
        };

        let mut routes = vec![route("N1"), route("10"), route("4")];
        routes.sort_by_key(route_sort_key);

        let order: Vec<&str> = routes.iter().map(|r| r.route_short_name.as_str()).collect();
        assert_eq!(order, vec!["4", "10", "N1"]);
    }
}
