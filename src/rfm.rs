//! Per-customer Recency, Frequency and Monetary aggregation

use crate::data::TransactionRecord;
use chrono::{Duration, NaiveDateTime};
use log::info;
use std::collections::BTreeMap;
use std::fmt;

/// Customer identity, disambiguated by country.
///
/// Raw customer ids repeat across regions, so the pair is the key. Ordering
/// is by customer id first, then country.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomerKey {
    pub customer_id: String,
    pub country: String,
}

impl CustomerKey {
    pub fn new(customer_id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            country: country.into(),
        }
    }

    /// Concatenated `country + customer_id` form used by upstream exports
    pub fn composite(&self) -> String {
        format!("{}{}", self.country, self.customer_id)
    }
}

impl fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country, self.customer_id)
    }
}

/// Raw RFM metrics for one customer
#[derive(Debug, Clone, PartialEq)]
pub struct RfmRecord {
    pub key: CustomerKey,
    /// Whole days between the last purchase and the reference instant
    pub recency: i64,
    /// Number of transactions
    pub frequency: u64,
    /// Sum of transaction amounts
    pub monetary: f64,
}

/// The instant recency is measured from: one day after the latest sale.
pub fn reference_instant(transactions: &[TransactionRecord]) -> Option<NaiveDateTime> {
    transactions
        .iter()
        .map(|t| t.timestamp)
        .max()
        .map(|latest| latest + Duration::days(1))
}

/// Collapse transactions into one [`RfmRecord`] per [`CustomerKey`].
///
/// Output is sorted by key. Empty input yields no records.
pub fn aggregate(transactions: &[TransactionRecord]) -> Vec<RfmRecord> {
    let Some(reference) = reference_instant(transactions) else {
        info!("No transactions to aggregate");
        return Vec::new();
    };

    let mut by_customer: BTreeMap<CustomerKey, RfmRecord> = BTreeMap::new();
    for txn in transactions {
        let days = (reference - txn.timestamp).num_days();
        let key = CustomerKey::new(txn.customer_id.as_str(), txn.country.as_str());
        by_customer
            .entry(key.clone())
            .and_modify(|rec| {
                rec.recency = rec.recency.min(days);
                rec.frequency += 1;
                rec.monetary += txn.amount;
            })
            .or_insert(RfmRecord {
                key,
                recency: days,
                frequency: 1,
                monetary: txn.amount,
            });
    }

    info!(
        "Aggregated {} transactions into {} customers (reference {})",
        transactions.len(),
        by_customer.len(),
        reference
    );
    by_customer.into_values().collect()
}
