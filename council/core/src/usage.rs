//! Usage Collaborator
//!
//! Records one entry per finalized model call and aggregates token counts
//! and estimated cost per model. The dispatcher only sees the
//! [`UsageRecorder`] trait.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::messages::ModelId;
use crate::registry::ModelCost;

/// Upper bound for [`UsageLedger::daily`]
pub const MAX_DAILY_WINDOW: u32 = 90;

/// One finalized upstream call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Model that served the call
    pub model_id: ModelId,
    /// Display name at the time of the call
    pub model_name: String,
    /// Prompt tokens, if reported
    pub tokens_input: Option<u32>,
    /// Completion tokens, if reported
    pub tokens_output: Option<u32>,
    /// Call latency
    pub latency_ms: Option<u64>,
    /// Pricing at the time of the call
    pub cost: ModelCost,
    /// Whether the call ended in an error
    pub is_error: bool,
    /// When the call finished
    pub timestamp: DateTime<Utc>,
}

/// Sink for usage records
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    /// Record one finalized call
    async fn record(&self, record: UsageRecord);
}

/// Aggregation window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    /// Last 24 hours
    #[default]
    Day,
    /// Last 7 days
    Week,
    /// Last 30 days
    Month,
    /// Everything
    All,
}

impl UsagePeriod {
    /// Start of the window ending at `now`
    #[must_use]
    pub fn start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - Duration::days(1)),
            Self::Week => Some(now - Duration::weeks(1)),
            Self::Month => Some(now - Duration::days(30)),
            Self::All => None,
        }
    }
}

impl std::str::FromStr for UsagePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(format!("unknown usage period: {other}")),
        }
    }
}

/// Per-model totals
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Model identifier
    pub model_id: ModelId,
    /// Display name
    pub model_name: String,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Prompt plus completion tokens
    pub total_tokens: u64,
    /// Finalized calls
    pub request_count: u64,
    /// Calls that ended in an error
    pub error_count: u64,
    /// Mean latency over calls that reported one
    pub avg_latency_ms: u64,
    /// USD, rounded to 6 decimals
    pub estimated_cost: f64,
    /// Prompt price used for the estimate
    pub input_cost_per_million: Option<f64>,
    /// Completion price used for the estimate
    pub output_cost_per_million: Option<f64>,
}

/// Grand totals over all models
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Prompt tokens across models
    pub total_input_tokens: u64,
    /// Completion tokens across models
    pub total_output_tokens: u64,
    /// All tokens
    pub total_tokens: u64,
    /// USD, rounded to 6 decimals
    pub total_estimated_cost: f64,
    /// Models with at least one call
    pub model_count: usize,
}

/// Aggregated usage over one period
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Requested period
    pub period: UsagePeriod,
    /// Start of the window (`None` for all time)
    pub start_date: Option<DateTime<Utc>>,
    /// End of the window
    pub end_date: DateTime<Utc>,
    /// Grand totals
    pub summary: UsageTotals,
    /// Sorted by total tokens, descending
    pub models: Vec<ModelUsage>,
}

/// One model's share of a day
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyModelUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Calls
    pub request_count: u64,
}

/// Usage of one calendar day (UTC)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Calendar day
    pub date: NaiveDate,
    /// All tokens that day
    pub total_tokens: u64,
    /// USD, rounded to 6 decimals
    pub estimated_cost: f64,
    /// Per-model breakdown
    pub models: BTreeMap<ModelId, DailyModelUsage>,
}

/// In-memory usage ledger
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of every record
    #[must_use]
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    /// Aggregate the window ending now
    #[must_use]
    pub fn summary(&self, period: UsagePeriod) -> UsageSummary {
        self.summary_at(period, Utc::now())
    }

    /// Aggregate the window ending at `now`
    #[must_use]
    pub fn summary_at(&self, period: UsagePeriod, now: DateTime<Utc>) -> UsageSummary {
        let start_date = period.start(now);
        let records = self.records.lock();

        let mut by_model: HashMap<&ModelId, ModelAccumulator> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| start_date.map_or(true, |start| r.timestamp >= start))
        {
            by_model.entry(&record.model_id).or_default().add(record);
        }

        let mut models: Vec<ModelUsage> = by_model
            .into_iter()
            .map(|(id, acc)| acc.finish(id.clone()))
            .collect();
        models.sort_by(|a, b| {
            b.total_tokens
                .cmp(&a.total_tokens)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        let mut summary = UsageTotals {
            model_count: models.len(),
            ..UsageTotals::default()
        };
        for model in &models {
            summary.total_input_tokens += model.input_tokens;
            summary.total_output_tokens += model.output_tokens;
            summary.total_estimated_cost += model.estimated_cost;
        }
        summary.total_tokens = summary.total_input_tokens + summary.total_output_tokens;
        summary.total_estimated_cost = round_cost(summary.total_estimated_cost);

        UsageSummary {
            period,
            start_date,
            end_date: now,
            summary,
            models,
        }
    }

    /// Per-day breakdown of the last `days` days, oldest first
    #[must_use]
    pub fn daily(&self, days: u32) -> Vec<DailyUsage> {
        self.daily_at(days, Utc::now())
    }

    /// Per-day breakdown of the `days` days before `now`, oldest first
    #[must_use]
    pub fn daily_at(&self, days: u32, now: DateTime<Utc>) -> Vec<DailyUsage> {
        let days = days.clamp(1, MAX_DAILY_WINDOW);
        let start = now - Duration::days(i64::from(days));
        let records = self.records.lock();

        let mut by_day: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
        for record in records.iter().filter(|r| r.timestamp >= start) {
            let date = record.timestamp.date_naive();
            let day = by_day.entry(date).or_insert_with(|| DailyUsage {
                date,
                total_tokens: 0,
                estimated_cost: 0.0,
                models: BTreeMap::new(),
            });

            let input = u64::from(record.tokens_input.unwrap_or(0));
            let output = u64::from(record.tokens_output.unwrap_or(0));
            day.total_tokens += input + output;
            day.estimated_cost += record.cost.estimate(input, output);

            let model = day.models.entry(record.model_id.clone()).or_default();
            model.input_tokens += input;
            model.output_tokens += output;
            model.request_count += 1;
        }

        by_day
            .into_values()
            .map(|mut day| {
                day.estimated_cost = round_cost(day.estimated_cost);
                day
            })
            .collect()
    }
}

#[async_trait]
impl UsageRecorder for UsageLedger {
    async fn record(&self, record: UsageRecord) {
        self.records.lock().push(record);
    }
}

#[derive(Default)]
struct ModelAccumulator {
    model_name: String,
    input_tokens: u64,
    output_tokens: u64,
    request_count: u64,
    error_count: u64,
    total_latency_ms: u64,
    estimated_cost: f64,
    cost: ModelCost,
}

impl ModelAccumulator {
    fn add(&mut self, record: &UsageRecord) {
        let input = u64::from(record.tokens_input.unwrap_or(0));
        let output = u64::from(record.tokens_output.unwrap_or(0));
        self.model_name.clone_from(&record.model_name);
        self.input_tokens += input;
        self.output_tokens += output;
        self.request_count += 1;
        self.error_count += u64::from(record.is_error);
        self.total_latency_ms += record.latency_ms.unwrap_or(0);
        self.estimated_cost += record.cost.estimate(input, output);
        self.cost = record.cost;
    }

    fn finish(self, model_id: ModelId) -> ModelUsage {
        ModelUsage {
            model_id,
            model_name: self.model_name,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            request_count: self.request_count,
            error_count: self.error_count,
            avg_latency_ms: self
                .total_latency_ms
                .checked_div(self.request_count)
                .unwrap_or(0),
            estimated_cost: round_cost(self.estimated_cost),
            input_cost_per_million: self.cost.input_per_million,
            output_cost_per_million: self.cost.output_per_million,
        }
    }
}

fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record(model: &str, tin: u32, tout: u32, at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            model_id: ModelId::from(model),
            model_name: model.to_uppercase(),
            tokens_input: Some(tin),
            tokens_output: Some(tout),
            latency_ms: Some(100),
            cost: ModelCost {
                input_per_million: Some(1.0),
                output_per_million: Some(2.0),
            },
            is_error: false,
            timestamp: at,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_summary_aggregates_and_sorts() {
        let ledger = UsageLedger::new();
        ledger.record(record("small", 10, 10, now())).await;
        ledger.record(record("big", 1000, 500, now())).await;
        ledger.record(record("big", 1000, 500, now())).await;

        let summary = ledger.summary_at(UsagePeriod::All, now());
        assert_eq!(summary.models.len(), 2);
        assert_eq!(summary.models[0].model_id.as_str(), "big");
        assert_eq!(summary.models[0].request_count, 2);
        assert_eq!(summary.models[0].total_tokens, 3000);
        assert_eq!(summary.models[0].avg_latency_ms, 100);
        // 2000 in at $1/M + 1000 out at $2/M
        assert_eq!(summary.models[0].estimated_cost, 0.004);
        assert_eq!(summary.summary.total_tokens, 3020);
        assert_eq!(summary.summary.model_count, 2);
    }

    #[tokio::test]
    async fn test_summary_respects_period() {
        let ledger = UsageLedger::new();
        ledger.record(record("m", 1, 1, now() - Duration::hours(2))).await;
        ledger.record(record("m", 1, 1, now() - Duration::days(3))).await;
        ledger.record(record("m", 1, 1, now() - Duration::days(40))).await;

        let count = |p| ledger.summary_at(p, now()).models.first().map_or(0, |m| m.request_count);
        assert_eq!(count(UsagePeriod::Day), 1);
        assert_eq!(count(UsagePeriod::Week), 2);
        assert_eq!(count(UsagePeriod::Month), 2);
        assert_eq!(count(UsagePeriod::All), 3);
    }

    #[tokio::test]
    async fn test_errors_without_tokens_are_counted() {
        let ledger = UsageLedger::new();
        let mut failed = record("m", 0, 0, now());
        failed.tokens_input = None;
        failed.tokens_output = None;
        failed.is_error = true;
        ledger.record(failed).await;

        let summary = ledger.summary_at(UsagePeriod::Day, now());
        assert_eq!(summary.models[0].request_count, 1);
        assert_eq!(summary.models[0].error_count, 1);
        assert_eq!(summary.models[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn test_daily_breakdown() {
        let ledger = UsageLedger::new();
        ledger.record(record("a", 10, 10, now())).await;
        ledger.record(record("b", 5, 5, now())).await;
        ledger.record(record("a", 1, 1, now() - Duration::days(1))).await;
        ledger.record(record("a", 1, 1, now() - Duration::days(20))).await;

        let days = ledger.daily_at(7, now());
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
        assert_eq!(days[1].total_tokens, 30);
        assert_eq!(days[1].models.len(), 2);
        assert_eq!(days[1].models[&ModelId::from("a")].request_count, 1);
    }

    #[test]
    fn test_period_parse() {
        assert_eq!("Week".parse::<UsagePeriod>(), Ok(UsagePeriod::Week));
        assert!("year".parse::<UsagePeriod>().is_err());
    }
}
