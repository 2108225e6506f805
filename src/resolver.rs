use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tracing::debug;

use crate::config::MEMBERSHIP_LOOKBACK_DAYS;
use crate::error::Result;
use crate::state::ListingCache;
use crate::types::{IndexDefinition, ResolutionStrategy};
use crate::vendor::{ListingRow, MarketData, MembershipRow};

/// Point-in-time index membership.
pub struct ConstituentResolver {
    vendor: Arc<dyn MarketData>,
    listing_cache: Arc<ListingCache>,
}

impl ConstituentResolver {
    pub fn new(vendor: Arc<dyn MarketData>, listing_cache: Arc<ListingCache>) -> Self {
        Self { vendor, listing_cache }
    }

    /// Members of `index` as of `as_of`. An empty set means breadth is not
    /// computable for that date; callers skip it.
    pub async fn resolve_members(&self, index: &IndexDefinition, as_of: NaiveDate) -> Result<BTreeSet<String>> {
        match &index.strategy {
            ResolutionStrategy::WholeExchangeListing { exchange } => {
                if let Some(rows) = self.listing_cache.get(exchange) {
                    let members = listed_as_of(&rows, as_of);
                    if !members.is_empty() {
                        return Ok(members);
                    }
                    // Nothing listed yet according to the cached copy: refetch once.
                    self.listing_cache.invalidate(exchange);
                }
                let rows = self.refresh_listing(exchange).await?;
                Ok(listed_as_of(&rows, as_of))
            }
            ResolutionStrategy::WeightedMembership => self.weighted_members(&index.code, as_of).await,
        }
    }

    pub fn listing_cache(&self) -> &Arc<ListingCache> {
        &self.listing_cache
    }

    async fn refresh_listing(&self, exchange: &str) -> Result<Arc<Vec<ListingRow>>> {
        let rows = self.vendor.fetch_listing(exchange).await?;
        debug!(exchange, rows = rows.len(), "Listing cache refreshed");
        Ok(self.listing_cache.put(exchange, rows))
    }

    async fn weighted_members(&self, index_code: &str, as_of: NaiveDate) -> Result<BTreeSet<String>> {
        for days in MEMBERSHIP_LOOKBACK_DAYS {
            let start = as_of - Duration::days(days);
            let rows = self.vendor.fetch_index_membership(index_code, start, as_of).await?;
            if let Some((snapshot, members)) = latest_snapshot(&rows, as_of) {
                debug!(index = index_code, as_of = %as_of, snapshot = %snapshot, lookback_days = days, members = members.len(), "Resolved membership snapshot");
                return Ok(members);
            }
        }
        Ok(BTreeSet::new())
    }
}

/// Securities listed on or before `as_of` and not yet delisted.
/// Rows without a listing date are excluded.
pub fn listed_as_of(rows: &[ListingRow], as_of: NaiveDate) -> BTreeSet<String> {
    rows.iter()
        .filter(|r| r.list_date.is_some_and(|d| d <= as_of))
        .filter(|r| r.delist_date.map_or(true, |d| d > as_of))
        .map(|r| r.ts_code.clone())
        .collect()
}

/// Members of the single most recent snapshot on or before `as_of`.
pub fn latest_snapshot(rows: &[MembershipRow], as_of: NaiveDate) -> Option<(NaiveDate, BTreeSet<String>)> {
    let snapshot = rows
        .iter()
        .map(|r| r.trade_date)
        .filter(|d| *d <= as_of)
        .max()?;
    let members = rows
        .iter()
        .filter(|r| r.trade_date == snapshot)
        .map(|r| r.con_code.clone())
        .collect();
    Some((snapshot, members))
}
