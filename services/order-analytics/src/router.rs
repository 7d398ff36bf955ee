//! Dispatch router
//!
//! Static, exhaustive dispatch from `EventType` to an aggregator mutation.
//! Created events are additionally mirrored to the recent-activity window.
//! The two downstream calls are independent: a bad amount that prevents the
//! aggregator update still lets the mirror run, and a mirror outage never
//! reaches the aggregator.

use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregator::MetricsAggregator;
use crate::cache::CacheSync;
use crate::error::RouteError;
use crate::events::{EventType, OrderEvent};

/// What the router did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Created,
    StatusChanged,
    Cancelled,
    /// Unknown event type, dropped with a warning
    Ignored,
}

pub struct DispatchRouter {
    aggregator: Arc<MetricsAggregator>,
    cache: Arc<CacheSync>,
}

impl DispatchRouter {
    pub fn new(aggregator: Arc<MetricsAggregator>, cache: Arc<CacheSync>) -> Self {
        Self { aggregator, cache }
    }

    pub async fn route(&self, event: &OrderEvent) -> Result<RouteOutcome, RouteError> {
        match &event.event_type {
            EventType::Created => {
                let applied = self.apply_created(event);
                self.cache.mirror(event).await;
                applied.map(|()| RouteOutcome::Created)
            }
            EventType::StatusChanged => {
                let new_status = event.new_status().ok_or(RouteError::MissingNewStatus)?;
                self.aggregator
                    .apply_status_changed(event.old_status(), new_status);
                info!(
                    order_id = %event.order_id,
                    old_status = event.old_status().unwrap_or(""),
                    new_status,
                    "Processed status change"
                );
                Ok(RouteOutcome::StatusChanged)
            }
            EventType::Cancelled => {
                self.aggregator.apply_cancelled();
                info!(
                    order_id = %event.order_id,
                    reason = event.reason().unwrap_or("No reason provided"),
                    "Processed order cancellation"
                );
                Ok(RouteOutcome::Cancelled)
            }
            EventType::Unknown(raw) => {
                warn!(
                    event_type = %raw,
                    order_id = %event.order_id,
                    "No handler for event type, dropping"
                );
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    fn apply_created(&self, event: &OrderEvent) -> Result<(), RouteError> {
        let amount = event
            .total_amount()
            .map_err(|e| RouteError::InvalidAmount(e.to_string()))?;
        self.aggregator
            .apply_created(&event.order_id, &event.user_id, amount, event.timestamp)
            .map_err(|e| RouteError::InvalidAmount(e.to_string()))?;
        info!(
            order_id = %event.order_id,
            amount = %amount,
            "Processed order created"
        );
        Ok(())
    }
}
