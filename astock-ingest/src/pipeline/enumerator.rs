//! Work unit enumeration.
//!
//! Turns the raw identifier list of a source into the ordered, de-duplicated
//! list of [`WorkUnit`]s a run processes. The order is deterministic for a
//! given source response, which is what makes index-based checkpoints valid
//! across runs.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use astock_common::MarketConfig;

use super::checkpoint::Checkpoint;
use super::{DateRange, PipelineError, SourceError, WorkUnit};

// ============================================================================
// Identifier Sources
// ============================================================================

/// Collaborator that lists the identifiers of a dataset.
#[async_trait]
pub trait IdentifierSource: Send + Sync {
    async fn list_identifiers(&self) -> Result<Vec<String>, SourceError>;
}

/// Fixed identifier list (market codes, a single `all` unit, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticIdentifiers {
    ids: Vec<String>,
}

impl StaticIdentifiers {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl IdentifierSource for StaticIdentifiers {
    async fn list_identifiers(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.ids.clone())
    }
}

/// Semi-annual report periods (`YYYY0630`, `YYYY1231`) for a span of years.
#[derive(Debug, Clone)]
pub struct ReportPeriods {
    pub from_year: i32,
    pub to_year: i32,
    /// Periods ending after this date are left out
    pub until: Option<NaiveDate>,
}

impl ReportPeriods {
    pub fn new(from_year: i32, to_year: i32) -> Self {
        Self {
            from_year,
            to_year,
            until: None,
        }
    }

    pub fn until(mut self, date: NaiveDate) -> Self {
        self.until = Some(date);
        self
    }

    /// Periods covering every report date inside `range`.
    pub fn covering(range: &DateRange) -> Self {
        Self::new(range.start().year(), range.end().year()).until(range.end())
    }

    fn periods(&self) -> Vec<String> {
        let mut periods = Vec::new();
        for year in self.from_year..=self.to_year {
            for (month, day) in [(6, 30), (12, 31)] {
                let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                    continue;
                };
                if self.until.is_some_and(|until| date > until) {
                    continue;
                }
                periods.push(date.format("%Y%m%d").to_string());
            }
        }
        periods
    }
}

#[async_trait]
impl IdentifierSource for ReportPeriods {
    async fn list_identifiers(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.periods())
    }
}

// ============================================================================
// Market Filter
// ============================================================================

/// Classifies bare six-digit codes into exchange-prefixed symbols.
///
/// `600000` becomes `sh600000` and `000001` becomes `sz000001`. Codes no
/// prefix set claims are dropped. Already-prefixed input (`sh600000`,
/// `600000.SH`) is kept when its numeric part belongs to that exchange.
#[derive(Debug, Clone)]
pub struct MarketFilter {
    sse: Vec<String>,
    szse: Vec<String>,
}

impl Default for MarketFilter {
    fn default() -> Self {
        Self::from_config(&MarketConfig::default())
    }
}

impl MarketFilter {
    pub fn new(sse: Vec<String>, szse: Vec<String>) -> Self {
        Self { sse, szse }
    }

    pub fn from_config(config: &MarketConfig) -> Self {
        Self::new(config.sse_prefixes.clone(), config.szse_prefixes.clone())
    }

    /// Exchange prefix (`sh`/`sz`) of a bare numeric code.
    pub fn exchange_of(&self, digits: &str) -> Option<&'static str> {
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if self.sse.iter().any(|p| digits.starts_with(p.as_str())) {
            Some("sh")
        } else if self.szse.iter().any(|p| digits.starts_with(p.as_str())) {
            Some("sz")
        } else {
            None
        }
    }

    /// Canonical `sh`/`sz`-prefixed symbol for `code`, or `None` to drop it.
    pub fn classify(&self, code: &str) -> Option<String> {
        let code = code.trim().to_ascii_lowercase();

        let (claimed, digits) = if let Some((digits, suffix)) = code.split_once('.') {
            (Some(suffix.to_string()), digits.to_string())
        } else if code.starts_with("sh") || code.starts_with("sz") {
            (Some(code[..2].to_string()), code[2..].to_string())
        } else {
            (None, code)
        };

        let exchange = self.exchange_of(&digits)?;
        match claimed {
            Some(claimed) if claimed != exchange => None,
            _ => Some(format!("{}{}", exchange, digits)),
        }
    }
}

// ============================================================================
// Enumerator
// ============================================================================

/// Produces the ordered work-unit list of a run.
#[derive(Debug, Clone, Default)]
pub struct UnitEnumerator {
    filter: Option<MarketFilter>,
    range: Option<DateRange>,
}

impl UnitEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: MarketFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_range(mut self, range: Option<DateRange>) -> Self {
        self.range = range;
        self
    }

    /// List, trim, classify and de-duplicate identifiers, keeping first
    /// occurrence order.
    ///
    /// A source error or an empty result fails the run before any fetch.
    pub async fn enumerate(
        &self,
        source: &dyn IdentifierSource,
    ) -> Result<Vec<WorkUnit>, PipelineError> {
        let raw = source
            .list_identifiers()
            .await
            .map_err(|e| PipelineError::EnumerationFailed(e.to_string()))?;
        let listed = raw.len();

        let mut seen = HashSet::new();
        let mut units = Vec::with_capacity(raw.len());
        let mut dropped = 0usize;

        for id in raw {
            let id = id.trim();
            if id.is_empty() {
                dropped += 1;
                continue;
            }
            let id = match &self.filter {
                Some(filter) => match filter.classify(id) {
                    Some(symbol) => symbol,
                    None => {
                        debug!(code = id, "Dropping code outside configured markets");
                        dropped += 1;
                        continue;
                    }
                },
                None => id.to_string(),
            };
            if seen.insert(id.clone()) {
                units.push(WorkUnit::new(id, self.range));
            }
        }

        if units.is_empty() {
            warn!(listed, dropped, "Enumeration produced no work units");
            return Err(PipelineError::EnumerationFailed(format!(
                "no work units ({} identifiers listed, {} dropped)",
                listed, dropped
            )));
        }

        info!(
            listed,
            dropped,
            units = units.len(),
            range = ?self.range.map(|r| r.to_string()),
            "Enumerated work units"
        );
        Ok(units)
    }
}

/// Units still to process after `checkpoint`, with the index of the first one.
///
/// A checkpoint beyond the end of the list leaves nothing to do.
pub fn slice_after_checkpoint(
    units: &[WorkUnit],
    checkpoint: Option<Checkpoint>,
) -> (usize, &[WorkUnit]) {
    let offset = checkpoint
        .map(|c| c.last_completed_index.saturating_add(1))
        .unwrap_or(0)
        .min(units.len());
    (offset, &units[offset..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    struct FailingSource;

    #[async_trait]
    impl IdentifierSource for FailingSource {
        async fn list_identifiers(&self) -> Result<Vec<String>, SourceError> {
            Err(SourceError("connection refused".into()))
        }
    }

    #[test_case("600000", Some("sh600000") ; "sse main board")]
    #[test_case("688981", Some("sh688981") ; "star market")]
    #[test_case("000001", Some("sz000001") ; "szse main board")]
    #[test_case("300750", Some("sz300750") ; "chinext")]
    #[test_case(" 601318 ", Some("sh601318") ; "whitespace trimmed")]
    #[test_case("sh600000", Some("sh600000") ; "already prefixed")]
    #[test_case("600000.SH", Some("sh600000") ; "dotted suffix")]
    #[test_case("sz600000", None ; "wrong exchange claimed")]
    #[test_case("830799", None ; "beijing exchange dropped")]
    #[test_case("60000", None ; "short code")]
    fn test_market_filter_classify(code: &str, expected: Option<&str>) {
        let filter = MarketFilter::default();
        assert_eq!(filter.classify(code).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_enumerate_dedups_and_keeps_order() {
        let source = StaticIdentifiers::new(["600000", "000001", "600000", "830799", "300750"]);
        let units = UnitEnumerator::new()
            .with_filter(MarketFilter::default())
            .enumerate(&source)
            .await
            .unwrap();

        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["sh600000", "sz000001", "sz300750"]);
    }

    #[tokio::test]
    async fn test_enumerate_attaches_range() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        )
        .unwrap();
        let units = UnitEnumerator::new()
            .with_range(Some(range))
            .enumerate(&StaticIdentifiers::new(["SH", "SZ"]))
            .await
            .unwrap();

        assert!(units.iter().all(|u| u.range == Some(range)));
    }

    #[tokio::test]
    async fn test_enumerate_fails_on_source_error() {
        let err = UnitEnumerator::new().enumerate(&FailingSource).await.unwrap_err();
        assert!(matches!(err, PipelineError::EnumerationFailed(_)));
    }

    #[tokio::test]
    async fn test_enumerate_fails_when_everything_is_filtered() {
        let err = UnitEnumerator::new()
            .with_filter(MarketFilter::default())
            .enumerate(&StaticIdentifiers::new(["830799", "  "]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EnumerationFailed(_)));
    }

    #[tokio::test]
    async fn test_report_periods_respect_until() {
        let periods = ReportPeriods::new(2022, 2023)
            .until(NaiveDate::from_ymd_opt(2023, 7, 1).unwrap())
            .list_identifiers()
            .await
            .unwrap();
        assert_eq!(periods, vec!["20220630", "20221231", "20230630"]);
    }

    #[test]
    fn test_slice_after_checkpoint() {
        let units: Vec<WorkUnit> = (0..5).map(|i| WorkUnit::new(i.to_string(), None)).collect();

        let (offset, rest) = slice_after_checkpoint(&units, None);
        assert_eq!((offset, rest.len()), (0, 5));

        let (offset, rest) =
            slice_after_checkpoint(&units, Some(Checkpoint::new(1)));
        assert_eq!(offset, 2);
        assert_eq!(rest[0].id, "2");

        let (offset, rest) =
            slice_after_checkpoint(&units, Some(Checkpoint::new(10)));
        assert_eq!((offset, rest.len()), (5, 0));
    }
}
