use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::enrichment::SaccoFare;
use crate::engine::{TimeWindow, WindowAggregate};
use crate::model::SaccoRevenueWindow;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueAccumulator {
    pub sacco_name: String,
    pub total_revenue_kes: Decimal,
    pub transaction_count: u64,
}

/// Sums successful fares per SACCO and window.
///
/// Failed and pending fares are not counted but still move stream time
/// forward, so they can close windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaccoRevenue;

impl WindowAggregate for SaccoRevenue {
    type Input = SaccoFare;
    type Accumulator = RevenueAccumulator;
    type Output = SaccoRevenueWindow;

    fn accepts(&self, input: &SaccoFare) -> bool {
        input.fare.is_success()
    }

    fn aggregate(&self, _sacco_id: &str, input: &SaccoFare, acc: &mut RevenueAccumulator) {
        acc.sacco_name.clone_from(&input.sacco_name);
        acc.total_revenue_kes += input.fare.amount_kes;
        acc.transaction_count += 1;
    }

    fn finish(
        &self,
        sacco_id: &str,
        window: TimeWindow,
        acc: RevenueAccumulator,
        now: DateTime<Utc>,
    ) -> SaccoRevenueWindow {
        info!(
            sacco_id,
            sacco = %acc.sacco_name,
            total_kes = %acc.total_revenue_kes,
            transactions = acc.transaction_count,
            window_start = %window.start,
            "Revenue window closed"
        );
        SaccoRevenueWindow {
            sacco_id: sacco_id.to_string(),
            sacco_name: acc.sacco_name,
            total_revenue_kes: acc.total_revenue_kes,
            transaction_count: acc.transaction_count,
            window_start: window.start,
            window_end: window.end,
            computed_at: now,
        }
    }
}
