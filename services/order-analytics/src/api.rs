//! HTTP query layer
//!
//! Thin read-only endpoints over the aggregator snapshot plus the health
//! check and the live subscriber upgrade. Handlers never touch
//! `MetricsState` directly; every read goes through `snapshot()`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use types::numeric::Amount;

use crate::aggregator::{hour_key, MetricsAggregator, Snapshot};
use crate::broadcast::{top_products, ProductMetrics, RealtimeStats, SnapshotBroadcaster};
use crate::cache::{CacheSync, DailyCounters};
use crate::error::ApiError;
use crate::ingestion::IngestionHealth;
use crate::metrics::ServiceMetrics;
use crate::websocket;

const DEFAULT_HOURS: u32 = 24;
const MAX_HOURS: u32 = 24 * 7;
const DEFAULT_PRODUCT_LIMIT: usize = 10;
const MAX_PRODUCT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<MetricsAggregator>,
    pub cache: Arc<CacheSync>,
    pub broadcaster: Arc<SnapshotBroadcaster>,
    pub metrics: Arc<ServiceMetrics>,
    pub health: Arc<IngestionHealth>,
    pub write_timeout: Duration,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/orders", get(order_metrics))
        .route("/metrics/realtime", get(realtime_metrics))
        .route("/metrics/revenue/hourly", get(hourly_revenue))
        .route("/metrics/products/top", get(top_products_handler))
        .route("/ws/realtime", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct CacheHealth {
    pub backend: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today: Option<DailyCounters>,
}

#[derive(Debug, Serialize)]
pub struct ServicesHealth {
    pub broker: &'static str,
    pub cache: CacheHealth,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: ServicesHealth,
    pub metrics: BTreeMap<String, u64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let degraded = state.health.is_degraded();
    let today = state.cache.daily_counters().await.ok();

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        timestamp: Utc::now(),
        services: ServicesHealth {
            broker: if degraded { "degraded" } else { "up" },
            cache: CacheHealth {
                backend: state.cache.backend(),
                status: if today.is_some() { "up" } else { "unavailable" },
                today,
            },
        },
        metrics: state.metrics.export(),
    })
}

async fn order_metrics(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.aggregator.snapshot())
}

async fn realtime_metrics(State(state): State<AppState>) -> Json<RealtimeStats> {
    Json(state.broadcaster.realtime_stats().await)
}

#[derive(Debug, Deserialize)]
pub struct HourlyParams {
    pub hours: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyRevenue {
    /// `HH:00`
    pub hour: String,
    pub orders: u64,
    pub revenue: Amount,
}

#[derive(Debug, Serialize)]
pub struct HourlyRevenueResponse {
    pub data: Vec<HourlyRevenue>,
}

async fn hourly_revenue(
    State(state): State<AppState>,
    Query(params): Query<HourlyParams>,
) -> Result<Json<HourlyRevenueResponse>, ApiError> {
    let hours = params.hours.unwrap_or(DEFAULT_HOURS);
    if hours == 0 || hours > MAX_HOURS {
        return Err(ApiError::BadRequest(format!(
            "hours must be between 1 and {}",
            MAX_HOURS
        )));
    }
    let snapshot = state.aggregator.snapshot();
    Ok(Json(HourlyRevenueResponse {
        data: hourly_breakdown(&snapshot, Utc::now(), hours),
    }))
}

/// The trailing `hours` hour buckets ending at `now`, oldest first.
///
/// Revenue per bucket is estimated as orders × the current average order
/// value; buckets only count orders.
pub fn hourly_breakdown(snapshot: &Snapshot, now: DateTime<Utc>, hours: u32) -> Vec<HourlyRevenue> {
    (0..hours)
        .rev()
        .map(|back| {
            let at = now - chrono::Duration::hours(i64::from(back));
            let orders = snapshot
                .orders_per_hour
                .get(&hour_key(&at))
                .copied()
                .unwrap_or(0);
            HourlyRevenue {
                hour: at.format("%H:00").to_string(),
                orders,
                revenue: snapshot.avg_order_value.saturating_times(orders),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct TopProductsParams {
    pub limit: Option<usize>,
}

/// One ranked product, in the snake_case shape the products view reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopProduct {
    pub product_id: String,
    pub product_name: String,
    pub total_quantity_sold: u64,
    pub total_revenue: Amount,
    pub order_count: u64,
}

impl From<ProductMetrics> for TopProduct {
    fn from(p: ProductMetrics) -> Self {
        Self {
            product_id: p.product_id,
            product_name: p.product_name,
            total_quantity_sold: p.total_quantity_sold,
            total_revenue: p.total_revenue,
            order_count: p.order_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TopProductsResponse {
    pub products: Vec<TopProduct>,
}

/// Best-selling products over the recent-activity window.
async fn top_products_handler(
    State(state): State<AppState>,
    Query(params): Query<TopProductsParams>,
) -> Result<Json<TopProductsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_PRODUCT_LIMIT);
    if limit == 0 || limit > MAX_PRODUCT_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_PRODUCT_LIMIT
        )));
    }
    let window = state.cache.recent_orders(state.cache.window_capacity()).await?;
    let products = top_products(&window, limit)
        .into_iter()
        .map(TopProduct::from)
        .collect();
    Ok(Json(TopProductsResponse { products }))
}
