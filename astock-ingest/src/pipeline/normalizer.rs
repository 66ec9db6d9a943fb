//! Record normalization: rename, coerce, derive, window-filter.
//!
//! Provider records are loosely typed JSON. The normalizer maps them onto a
//! [`TableSchema`], applying the fixed arithmetic rules a dataset declares
//! (per-10-share ratios, lot sizes, sums) and the precision of every column.
//! A record that cannot satisfy the schema is rejected and counted; it never
//! fails the unit.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::enumerator::MarketFilter;
use super::schema::{ColumnKind, FieldValue, Row, TableSchema, LAST_UPDATED};
use super::{RawRecord, WorkUnit};

// ============================================================================
// Rules
// ============================================================================

/// Static rename from a provider field to a canonical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

impl FieldMapping {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// A column computed from other canonical fields.
///
/// Rules run in declaration order; a rule may read the target of an
/// earlier one.
#[derive(Debug, Clone)]
pub enum DerivedRule {
    /// `target = source * factor`
    Scale {
        target: String,
        source: String,
        factor: f64,
    },
    /// `target = sources[0] + sources[1] + …`
    Sum { target: String, sources: Vec<String> },
    /// `target = exchange-prefixed symbol of the code in source`
    ExchangePrefix {
        target: String,
        source: String,
        filter: MarketFilter,
    },
}

impl DerivedRule {
    pub fn scale(target: &str, source: &str, factor: f64) -> Self {
        Self::Scale {
            target: target.to_string(),
            source: source.to_string(),
            factor,
        }
    }

    pub fn sum(target: &str, sources: &[&str]) -> Self {
        Self::Sum {
            target: target.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn exchange_prefix(target: &str, source: &str, filter: MarketFilter) -> Self {
        Self::ExchangePrefix {
            target: target.to_string(),
            source: source.to_string(),
            filter,
        }
    }
}

/// Per-dataset normalization rules.
#[derive(Debug, Clone, Default)]
pub struct NormalizerSpec {
    pub mappings: Vec<FieldMapping>,
    pub derived: Vec<DerivedRule>,
    /// Column checked against the unit's date range
    pub date_column: Option<String>,
    /// Column filled with the work unit id
    pub unit_column: Option<String>,
    /// Column filled with the local date of normalization, for snapshot
    /// endpoints that carry no date of their own
    pub fetch_date_column: Option<String>,
    /// Missing numeric operands and columns count as zero
    pub fill_missing_zero: bool,
}

impl NormalizerSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, source: &str, target: &str) -> Self {
        self.mappings.push(FieldMapping::new(source, target));
        self
    }

    pub fn derive(mut self, rule: DerivedRule) -> Self {
        self.derived.push(rule);
        self
    }

    pub fn date_column(mut self, column: &str) -> Self {
        self.date_column = Some(column.to_string());
        self
    }

    pub fn unit_column(mut self, column: &str) -> Self {
        self.unit_column = Some(column.to_string());
        self
    }

    pub fn fetch_date(mut self, column: &str) -> Self {
        self.fetch_date_column = Some(column.to_string());
        self
    }

    pub fn fill_missing_zero(mut self) -> Self {
        self.fill_missing_zero = true;
        self
    }
}

/// Normalized rows of one work unit plus what was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedUnit {
    pub rows: Vec<Row>,
    /// Records that could not satisfy the schema
    pub rejected: usize,
    /// Valid records outside the unit's date range
    pub filtered: usize,
}

// ============================================================================
// Normalizer
// ============================================================================

/// Applies a [`NormalizerSpec`] to raw records for a given [`TableSchema`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: TableSchema,
    spec: NormalizerSpec,
}

enum Verdict {
    Keep(Row),
    Rejected(String),
    Filtered,
}

impl Normalizer {
    pub fn new(schema: TableSchema, spec: NormalizerSpec) -> Self {
        Self { schema, spec }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Normalize every record of `unit`. Zero resulting rows is not an error.
    pub fn normalize(&self, unit: &WorkUnit, records: &[RawRecord]) -> NormalizedUnit {
        let stamp = chrono::Local::now().naive_local();
        let mut out = NormalizedUnit::default();

        for record in records {
            match self.normalize_record(unit, record, stamp) {
                Verdict::Keep(row) => out.rows.push(row),
                Verdict::Filtered => out.filtered += 1,
                Verdict::Rejected(reason) => {
                    debug!(unit = %unit.id, reason, "Rejected record");
                    out.rejected += 1;
                }
            }
        }

        debug!(
            unit = %unit.id,
            records = records.len(),
            rows = out.rows.len(),
            rejected = out.rejected,
            filtered = out.filtered,
            "Normalized unit"
        );
        out
    }

    fn normalize_record(&self, unit: &WorkUnit, record: &RawRecord, stamp: NaiveDateTime) -> Verdict {
        let fields = self.canonical_fields(record);
        let derived = self.apply_derived(&fields);

        let mut row = Row::new(unit.id.clone());
        for column in &self.schema.columns {
            let value = if column.name == LAST_UPDATED {
                FieldValue::Timestamp(stamp)
            } else if self.spec.unit_column.as_deref() == Some(column.name.as_str()) {
                FieldValue::Text(unit.id.clone())
            } else if self.spec.fetch_date_column.as_deref() == Some(column.name.as_str()) {
                FieldValue::Date(stamp.date())
            } else if let Some(value) = derived.get(column.name.as_str()) {
                coerce_derived(value, column.kind)
            } else {
                match fields.get(column.name.as_str()) {
                    Some(raw) => coerce(raw, column.kind),
                    None => FieldValue::Null,
                }
            };

            let value = match (value, column.kind) {
                (FieldValue::Null, ColumnKind::Real { .. } | ColumnKind::Integer)
                    if self.spec.fill_missing_zero && !column.required =>
                {
                    coerce_derived(&Derived::Number(0.0), column.kind)
                }
                (value, _) => value,
            };

            if value.is_null() && column.required {
                return Verdict::Rejected(format!("missing or malformed {}", column.name));
            }
            row.set(column.name.clone(), value);
        }

        if let (Some(date_column), Some(range)) = (&self.spec.date_column, unit.range) {
            match row.get(date_column).as_date() {
                Some(date) if range.contains(date) => {}
                Some(_) => return Verdict::Filtered,
                None => return Verdict::Rejected(format!("unparseable {}", date_column)),
            }
        }

        Verdict::Keep(row)
    }

    /// Provider fields under their canonical names. Unmapped fields keep
    /// their own name.
    fn canonical_fields<'a>(&'a self, record: &'a RawRecord) -> HashMap<&'a str, &'a Value> {
        let mut fields: HashMap<&str, &Value> = record
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        for mapping in &self.spec.mappings {
            if let Some(value) = record.get(&mapping.source) {
                fields.insert(mapping.target.as_str(), value);
            }
        }
        fields
    }

    fn apply_derived(&self, fields: &HashMap<&str, &Value>) -> HashMap<String, Derived> {
        let mut derived: HashMap<String, Derived> = HashMap::new();
        let zero = self.spec.fill_missing_zero;

        let number = |name: &str, derived: &HashMap<String, Derived>| -> Option<f64> {
            let found = match derived.get(name) {
                Some(Derived::Number(v)) => Some(*v),
                Some(_) => None,
                None => fields.get(name).and_then(|v| parse_number(v)),
            };
            if found.is_none() && zero {
                Some(0.0)
            } else {
                found
            }
        };

        for rule in &self.spec.derived {
            match rule {
                DerivedRule::Scale {
                    target,
                    source,
                    factor,
                } => {
                    let value = number(source, &derived).map(|v| v * factor);
                    derived.insert(target.clone(), Derived::from(value));
                }
                DerivedRule::Sum { target, sources } => {
                    let value = sources
                        .iter()
                        .map(|s| number(s, &derived))
                        .sum::<Option<f64>>();
                    derived.insert(target.clone(), Derived::from(value));
                }
                DerivedRule::ExchangePrefix {
                    target,
                    source,
                    filter,
                } => {
                    let symbol = fields
                        .get(source.as_str())
                        .and_then(|v| code_text(v))
                        .and_then(|code| filter.classify(&code));
                    derived.insert(
                        target.clone(),
                        symbol.map(Derived::Text).unwrap_or(Derived::Missing),
                    );
                }
            }
        }
        derived
    }
}

/// Intermediate result of a derived rule, before column coercion.
#[derive(Debug, Clone, PartialEq)]
enum Derived {
    Number(f64),
    Text(String),
    Missing,
}

impl From<Option<f64>> for Derived {
    fn from(value: Option<f64>) -> Self {
        value.map(Derived::Number).unwrap_or(Derived::Missing)
    }
}

fn coerce_derived(value: &Derived, kind: ColumnKind) -> FieldValue {
    match value {
        Derived::Number(v) => coerce(&Value::from(*v), kind),
        Derived::Text(s) => coerce(&Value::String(s.clone()), kind),
        Derived::Missing => FieldValue::Null,
    }
}

// ============================================================================
// Coercion
// ============================================================================

/// Coerce a raw JSON value to a column kind. Anything unusable is `Null`.
pub fn coerce(value: &Value, kind: ColumnKind) -> FieldValue {
    match kind {
        ColumnKind::Text => text(value).map(FieldValue::Text),
        ColumnKind::Date => parse_date(value).map(FieldValue::Date),
        ColumnKind::Timestamp => parse_timestamp(value).map(FieldValue::Timestamp),
        ColumnKind::Integer => parse_number(value)
            .map(f64::round)
            .filter(|v| v.abs() < i64::MAX as f64)
            .map(|v| FieldValue::Integer(v as i64)),
        ColumnKind::Real { scale } => parse_number(value).map(|v| FieldValue::Real(round_to(v, scale))),
    }
    .unwrap_or(FieldValue::Null)
}

/// Round half away from zero to `scale` decimal places.
pub fn round_to(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

const MISSING_MARKERS: &[&str] = &["", "-", "--", "nan", "none", "null"];

/// Lenient numeric parse: placeholders and junk are missing, not errors.
pub fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if MISSING_MARKERS.contains(&s.to_ascii_lowercase().as_str()) {
                return None;
            }
            s.replace(',', "").parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Date parse accepting `YYYY-MM-DD`, `YYYYMMDD`, `YYYY/MM/DD`, ISO
/// datetimes, and epoch milliseconds.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            for format in ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"] {
                if let Ok(date) = NaiveDate::parse_from_str(s, format) {
                    return Some(date);
                }
            }
            parse_datetime_str(s).map(|ts| ts.date())
        }
        Value::Number(n) => {
            let n = n.as_i64()?;
            if (1_900_01_01..=2_999_12_31).contains(&n) {
                NaiveDate::parse_from_str(&n.to_string(), "%Y%m%d").ok()
            } else {
                DateTime::from_timestamp_millis(n).map(|dt| dt.date_naive())
            }
        }
        _ => None,
    }
}

/// Timestamp parse; bare dates become midnight.
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_datetime_str(s.trim())
            .or_else(|| parse_date(value).and_then(|d| d.and_hms_opt(0, 0, 0))),
        Value::Number(n) => {
            let n = n.as_i64()?;
            DateTime::from_timestamp_millis(n).map(|dt| dt.naive_utc())
        }
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Security code as text; numeric codes get their leading zeros back.
fn code_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| format!("{:06}", n)),
        other => text(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::ColumnSpec;
    use crate::pipeline::DateRange;
    use serde_json::json;
    use test_case::test_case;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn daily() -> Normalizer {
        let schema = TableSchema::new(
            "stock_a_daily",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("trade_date"),
                ColumnSpec::real("close", 4),
                ColumnSpec::real("volume", 2),
            ],
            &["symbol", "trade_date"],
        );
        let spec = NormalizerSpec::new()
            .map("date", "trade_date")
            .unit_column("symbol")
            .date_column("trade_date");
        Normalizer::new(schema, spec)
    }

    fn dividend() -> Normalizer {
        let schema = TableSchema::new(
            "stock_dividend",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("trade_date"),
                ColumnSpec::real("stock_bonus", 6),
                ColumnSpec::real("stock_transfer", 6),
                ColumnSpec::real("cash_dividend", 6),
            ],
            &["symbol", "trade_date"],
        );
        let spec = NormalizerSpec::new()
            .map("除权除息日", "trade_date")
            .map("送转股份-送股比例", "bonus_per_10")
            .map("送转股份-转股比例", "transfer_per_10")
            .map("现金分红-现金分红比例", "cash_per_10")
            .derive(DerivedRule::scale("bonus", "bonus_per_10", 0.1))
            .derive(DerivedRule::scale("stock_transfer", "transfer_per_10", 0.1))
            .derive(DerivedRule::sum("stock_bonus", &["bonus", "stock_transfer"]))
            .derive(DerivedRule::scale("cash_dividend", "cash_per_10", 0.1))
            .unit_column("symbol")
            .date_column("trade_date")
            .fill_missing_zero();
        Normalizer::new(schema, spec)
    }

    #[test]
    fn test_rename_round_and_stamp() {
        let unit = WorkUnit::new("sh600000", None);
        let out = daily().normalize(
            &unit,
            &[record(json!({"date": "2020-06-15", "close": 10.123456, "volume": "1234.567"}))],
        );

        assert_eq!(out.rows.len(), 1);
        let row = &out.rows[0];
        assert_eq!(row.get("symbol"), &FieldValue::Text("sh600000".into()));
        assert_eq!(row.get("trade_date"), &FieldValue::Date(date(2020, 6, 15)));
        assert_eq!(row.get("close"), &FieldValue::Real(10.1235));
        assert_eq!(row.get("volume"), &FieldValue::Real(1234.57));
        assert!(matches!(row.get(LAST_UPDATED), FieldValue::Timestamp(_)));
    }

    #[test]
    fn test_window_filter_is_inclusive() {
        let range = DateRange::new(date(2020, 1, 1), date(2020, 12, 31)).unwrap();
        let unit = WorkUnit::new("sh600000", Some(range));
        let records: Vec<RawRecord> = ["2019-12-31", "2020-01-01", "2020-12-31", "2021-01-01"]
            .iter()
            .map(|d| record(json!({"date": d, "close": 1.0})))
            .collect();

        let out = daily().normalize(&unit, &records);

        let dates: Vec<_> = out.rows.iter().map(|r| r.get("trade_date").clone()).collect();
        assert_eq!(
            dates,
            vec![FieldValue::Date(date(2020, 1, 1)), FieldValue::Date(date(2020, 12, 31))]
        );
        assert_eq!(out.filtered, 2);
        assert_eq!(out.rejected, 0);
    }

    #[test]
    fn test_unparseable_key_date_is_rejected() {
        let unit = WorkUnit::new("sh600000", None);
        let out = daily().normalize(
            &unit,
            &[
                record(json!({"date": "not a date", "close": 1.0})),
                record(json!({"close": 1.0})),
                record(json!({"date": "20200615", "close": "-"})),
            ],
        );

        assert_eq!(out.rejected, 2);
        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].get("close").is_null());
    }

    #[test]
    fn test_per_ten_share_derivation() {
        let unit = WorkUnit::new("sz000001", None);
        let out = dividend().normalize(
            &unit,
            &[record(json!({
                "除权除息日": "2023-06-14",
                "送转股份-送股比例": 2.0,
                "送转股份-转股比例": 3.0,
                "现金分红-现金分红比例": "2.85"
            }))],
        );

        let row = &out.rows[0];
        assert_eq!(row.get("stock_transfer"), &FieldValue::Real(0.3));
        assert_eq!(row.get("stock_bonus"), &FieldValue::Real(0.5));
        assert_eq!(row.get("cash_dividend"), &FieldValue::Real(0.285));
    }

    #[test]
    fn test_missing_operands_count_as_zero_when_configured() {
        let unit = WorkUnit::new("sz000001", None);
        let out = dividend().normalize(
            &unit,
            &[record(json!({
                "除权除息日": "2023-06-14",
                "送转股份-转股比例": 4.0,
                "现金分红-现金分红比例": null
            }))],
        );

        let row = &out.rows[0];
        assert_eq!(row.get("stock_bonus"), &FieldValue::Real(0.4));
        assert_eq!(row.get("cash_dividend"), &FieldValue::Real(0.0));
    }

    #[test]
    fn test_missing_operand_without_fill_yields_missing() {
        let schema = TableSchema::new(
            "t",
            vec![ColumnSpec::text("k"), ColumnSpec::real("total", 2)],
            &["k"],
        );
        let spec = NormalizerSpec::new()
            .unit_column("k")
            .derive(DerivedRule::sum("total", &["a", "b"]));
        let out = Normalizer::new(schema, spec)
            .normalize(&WorkUnit::new("x", None), &[record(json!({"a": 1.0}))]);

        assert!(out.rows[0].get("total").is_null());
    }

    #[test]
    fn test_exchange_prefix_rule() {
        let schema = TableSchema::new(
            "stock_dividend_period",
            vec![ColumnSpec::text("symbol"), ColumnSpec::text("report_period")],
            &["symbol", "report_period"],
        );
        let spec = NormalizerSpec::new()
            .derive(DerivedRule::exchange_prefix("symbol", "代码", MarketFilter::default()))
            .unit_column("report_period");
        let normalizer = Normalizer::new(schema, spec);
        let out = normalizer.normalize(
            &WorkUnit::new("20230630", None),
            &[
                record(json!({"代码": "600000"})),
                record(json!({"代码": 1})),
                record(json!({"代码": "830799"})),
            ],
        );

        let symbols: Vec<_> = out.rows.iter().map(|r| r.get("symbol").clone()).collect();
        assert_eq!(
            symbols,
            vec![FieldValue::Text("sh600000".into()), FieldValue::Text("sz000001".into())]
        );
        assert_eq!(out.rejected, 1);
    }

    #[test_case(json!("2024-01-02") ; "dashed")]
    #[test_case(json!("20240102") ; "compact")]
    #[test_case(json!("2024/01/02") ; "slashed")]
    #[test_case(json!("2024-01-02T00:00:00.000") ; "iso datetime")]
    #[test_case(json!("2024-01-02 15:00:00") ; "space datetime")]
    #[test_case(json!(20240102) ; "numeric compact")]
    #[test_case(json!(1704153600000i64) ; "epoch millis")]
    fn test_parse_date_formats(value: Value) {
        assert_eq!(parse_date(&value), Some(date(2024, 1, 2)));
    }

    #[test_case(json!("-") ; "dash")]
    #[test_case(json!("") ; "empty")]
    #[test_case(json!("NaN") ; "nan")]
    #[test_case(json!("abc") ; "junk")]
    #[test_case(json!(null) ; "null")]
    fn test_parse_number_missing(value: Value) {
        assert_eq!(parse_number(&value), None);
    }

    #[test]
    fn test_parse_number_lenient() {
        assert_eq!(parse_number(&json!(" 1,234.5 ")), Some(1234.5));
        assert_eq!(parse_number(&json!(3)), Some(3.0));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(0.123456789, 6), 0.123457);
        assert_eq!(
            coerce(&json!("1234567.6"), ColumnKind::Integer),
            FieldValue::Integer(1234568)
        );
    }

    #[test]
    fn test_snapshot_lots_become_shares_on_fetch_date() {
        let schema = TableSchema::new(
            "stock_daily",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("trade_date"),
                ColumnSpec::real("close", 4).required(),
                ColumnSpec::integer("volume"),
            ],
            &["symbol", "trade_date"],
        );
        let spec = NormalizerSpec::new()
            .map("最新价", "close")
            .derive(DerivedRule::exchange_prefix("symbol", "代码", MarketFilter::default()))
            .derive(DerivedRule::scale("volume", "成交量", 100.0))
            .fetch_date("trade_date");
        let out = Normalizer::new(schema, spec).normalize(
            &WorkUnit::new("spot", None),
            &[
                record(json!({"代码": "000001", "最新价": 10.5, "成交量": 1234.5})),
                record(json!({"代码": "600000", "最新价": null, "成交量": 10})),
            ],
        );

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rejected, 1);
        let row = &out.rows[0];
        assert_eq!(row.get("symbol"), &FieldValue::Text("sz000001".into()));
        assert_eq!(row.get("volume"), &FieldValue::Integer(123450));
        let stamped = match row.get(LAST_UPDATED) {
            FieldValue::Timestamp(ts) => ts.date(),
            other => panic!("unexpected stamp {:?}", other),
        };
        assert_eq!(row.get("trade_date"), &FieldValue::Date(stamped));
    }
}
