//! Dataset catalogue.
//!
//! Each dataset binds an AKTools endpoint to a target table: how its work
//! units are listed, how each unit becomes a request, and how the returned
//! records map onto the table.

use chrono::{Datelike, NaiveDate};
use std::sync::Arc;

use crate::pipeline::{
    ColumnSpec, DataSource, DateRange, DerivedRule, IdentifierSource, MarketFilter, Normalizer,
    NormalizerSpec, ReportPeriods, StaticIdentifiers, TableSchema, UnitEnumerator,
};
use crate::provider::{AkToolsClient, AkToolsIdentifiers, AkToolsSource, ParamValue, RequestSpec};

/// First year with semi-annual dividend disclosures in `stock_fhps_em`.
const FIRST_REPORT_YEAR: i32 = 2009;

/// Index families of `stock_market_pb_lg`, keyed by unit id.
const MARKET_INDICES: &[(&str, &str)] = &[
    ("SH", "上证"),
    ("SZ", "深证"),
    ("CYB", "创业板"),
    ("STAR", "科创版"),
];

/// Where a dataset's work units come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    /// Every listed A-share, as `sh`/`sz`-prefixed symbols
    Symbols,
    /// Semi-annual report periods (`YYYY0630`, `YYYY1231`)
    ReportPeriods,
    /// A fixed list of ids
    Fixed(Vec<&'static str>),
}

/// Static description of one ingestible dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: &'static str,
    pub description: &'static str,
    pub units: UnitSource,
    pub request: RequestSpec,
    pub schema: TableSchema,
    pub rules: NormalizerSpec,
    /// Whether the date window applies to this dataset
    pub windowed: bool,
    /// Write through a staging table unless told otherwise
    pub staging: bool,
}

impl Dataset {
    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.schema.clone(), self.rules.clone())
    }

    /// Enumerator for this dataset's units. Symbols are market-filtered;
    /// the window is attached only to windowed datasets.
    pub fn enumerator(&self, markets: &MarketFilter, range: Option<DateRange>) -> UnitEnumerator {
        let enumerator = UnitEnumerator::new().with_range(if self.windowed { range } else { None });
        match self.units {
            UnitSource::Symbols => enumerator.with_filter(markets.clone()),
            _ => enumerator,
        }
    }

    /// Identifier source for this dataset's units.
    ///
    /// Report periods cover the window when one is given, otherwise every
    /// period from the first disclosure year up to `today`.
    pub fn identifiers(
        &self,
        client: Arc<AkToolsClient>,
        range: Option<DateRange>,
        today: NaiveDate,
    ) -> Box<dyn IdentifierSource> {
        match &self.units {
            UnitSource::Symbols => Box::new(AkToolsIdentifiers::new(client)),
            UnitSource::ReportPeriods => Box::new(match range {
                Some(range) => ReportPeriods::covering(&range),
                None => ReportPeriods::new(FIRST_REPORT_YEAR, today.year()).until(today),
            }),
            UnitSource::Fixed(ids) => Box::new(StaticIdentifiers::new(ids.iter().copied())),
        }
    }

    pub fn source(&self, client: Arc<AkToolsClient>) -> Arc<dyn DataSource> {
        Arc::new(AkToolsSource::new(client, self.request.clone()))
    }
}

/// Every dataset, in display order.
pub fn catalog(markets: &MarketFilter) -> Vec<Dataset> {
    vec![
        daily(),
        daily_spot(markets),
        valuation(),
        dividend(),
        dividend_period(markets),
        share_capital(),
        market_pb(),
        industry(),
    ]
}

/// Look up a dataset by name.
pub fn find(name: &str, markets: &MarketFilter) -> Option<Dataset> {
    catalog(markets).into_iter().find(|d| d.name == name)
}

/// Like [`find`], but an unknown name is an input error listing the
/// available datasets.
pub fn require(name: &str, markets: &MarketFilter) -> astock_common::Result<Dataset> {
    find(name, markets).ok_or_else(|| {
        let known: Vec<_> = catalog(markets).iter().map(|d| d.name).collect();
        astock_common::Error::InvalidInput(format!(
            "unknown dataset '{}' (available: {})",
            name,
            known.join(", ")
        ))
    })
}

fn daily() -> Dataset {
    Dataset {
        name: "daily",
        description: "Unadjusted daily bars per symbol",
        units: UnitSource::Symbols,
        request: RequestSpec::new("stock_zh_a_daily")
            .param("symbol", ParamValue::UnitId)
            .param("start_date", ParamValue::RangeStart)
            .param("end_date", ParamValue::RangeEnd)
            .param("adjust", ParamValue::Fixed("")),
        schema: daily_schema(),
        rules: NormalizerSpec::new()
            .map("date", "trade_date")
            .unit_column("symbol")
            .date_column("trade_date"),
        windowed: true,
        staging: false,
    }
}

/// Today's bars for the whole market in one request. Volume is quoted in
/// lots of 100 shares.
fn daily_spot(markets: &MarketFilter) -> Dataset {
    Dataset {
        name: "daily-spot",
        description: "Today's bars for every symbol from the spot snapshot",
        units: UnitSource::Fixed(vec!["spot"]),
        request: RequestSpec::new("stock_zh_a_spot_em"),
        schema: daily_schema(),
        rules: NormalizerSpec::new()
            .map("今开", "open")
            .map("最高", "high")
            .map("最低", "low")
            .map("最新价", "close")
            .map("成交额", "amount")
            .map("换手率", "turnover")
            .derive(DerivedRule::exchange_prefix("symbol", "代码", markets.clone()))
            .derive(DerivedRule::scale("volume", "成交量", 100.0))
            .fetch_date("trade_date"),
        windowed: false,
        staging: true,
    }
}

/// Shared by `daily` and `daily-spot`; the spot snapshot merges into the
/// same table.
fn daily_schema() -> TableSchema {
    TableSchema::new(
        "stock_daily",
        vec![
            ColumnSpec::text("symbol"),
            ColumnSpec::date("trade_date"),
            ColumnSpec::real("open", 4).required(),
            ColumnSpec::real("high", 4).required(),
            ColumnSpec::real("low", 4).required(),
            ColumnSpec::real("close", 4).required(),
            ColumnSpec::integer("volume"),
            ColumnSpec::real("amount", 2).required(),
            ColumnSpec::real("turnover", 6).required(),
        ],
        &["symbol", "trade_date"],
    )
}

fn valuation() -> Dataset {
    Dataset {
        name: "valuation",
        description: "Daily valuation ratios per symbol",
        units: UnitSource::Symbols,
        request: RequestSpec::new("stock_a_indicator_lg").param("symbol", ParamValue::UnitCode),
        schema: TableSchema::new(
            "stock_valuation",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("trade_date"),
                ColumnSpec::real("pe", 6),
                ColumnSpec::real("pe_ttm", 6),
                ColumnSpec::real("pb", 6),
                ColumnSpec::real("ps", 6),
                ColumnSpec::real("ps_ttm", 6),
                ColumnSpec::real("dv_ratio", 6),
                ColumnSpec::real("dv_ttm", 6),
                ColumnSpec::real("total_mv", 2),
            ],
            &["symbol", "trade_date"],
        ),
        rules: NormalizerSpec::new()
            .unit_column("symbol")
            .date_column("trade_date"),
        windowed: true,
        staging: false,
    }
}

fn dividend() -> Dataset {
    Dataset {
        name: "dividend",
        description: "Per-share dividend and bonus history per symbol",
        units: UnitSource::Symbols,
        request: RequestSpec::new("stock_fhps_detail_em").param("symbol", ParamValue::UnitCode),
        schema: TableSchema::new(
            "stock_dividend",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("trade_date"),
                ColumnSpec::real("dividend", 4),
                ColumnSpec::real("bonus", 4),
                ColumnSpec::real("split", 4),
                ColumnSpec::real("stock_bonus", 4),
            ],
            &["symbol", "trade_date"],
        ),
        // Ratios are quoted per 10 shares.
        rules: NormalizerSpec::new()
            .map("除权除息日", "trade_date")
            .map("现金分红-现金分红比例", "cash_per_10")
            .map("送转股份-送股比例", "bonus_per_10")
            .map("送转股份-转股比例", "split_per_10")
            .derive(DerivedRule::scale("dividend", "cash_per_10", 0.1))
            .derive(DerivedRule::scale("bonus", "bonus_per_10", 0.1))
            .derive(DerivedRule::scale("split", "split_per_10", 0.1))
            .derive(DerivedRule::sum("stock_bonus", &["bonus", "split"]))
            .unit_column("symbol")
            .date_column("trade_date")
            .fill_missing_zero(),
        windowed: true,
        staging: false,
    }
}

fn dividend_period(markets: &MarketFilter) -> Dataset {
    Dataset {
        name: "dividend-period",
        description: "Dividend plans of all companies per report period",
        units: UnitSource::ReportPeriods,
        request: RequestSpec::new("stock_fhps_em").param("date", ParamValue::UnitId),
        schema: TableSchema::new(
            "stock_dividend_period",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("ex_dividend_date"),
                ColumnSpec::text("report_period"),
                ColumnSpec::text("name"),
                ColumnSpec::real("total_bonus_split", 4),
                ColumnSpec::real("bonus_share", 4),
                ColumnSpec::real("split_share", 4),
                ColumnSpec::real("cash_dividend", 4),
                ColumnSpec::real("dividend_yield", 4),
                ColumnSpec::real("eps", 4),
                ColumnSpec::real("bps", 4),
                ColumnSpec::real("capital_reserve", 4),
                ColumnSpec::real("undistributed_profit", 4),
                ColumnSpec::real("net_profit_growth", 4),
                ColumnSpec::integer("total_shares"),
                ColumnSpec::date("proposal_date"),
                ColumnSpec::date("record_date"),
                ColumnSpec::text("progress"),
                ColumnSpec::date("latest_announcement"),
            ],
            &["symbol", "ex_dividend_date"],
        ),
        rules: NormalizerSpec::new()
            .map("名称", "name")
            .map("现金分红-股息率", "dividend_yield")
            .map("每股收益", "eps")
            .map("每股净资产", "bps")
            .map("每股公积金", "capital_reserve")
            .map("每股未分配利润", "undistributed_profit")
            .map("净利润同比增长", "net_profit_growth")
            .map("总股本", "total_shares")
            .map("预案公告日", "proposal_date")
            .map("股权登记日", "record_date")
            .map("除权除息日", "ex_dividend_date")
            .map("方案进度", "progress")
            .map("最新公告日期", "latest_announcement")
            .derive(DerivedRule::exchange_prefix("symbol", "代码", markets.clone()))
            .derive(DerivedRule::scale("total_bonus_split", "送转股份-送转总比例", 0.1))
            .derive(DerivedRule::scale("bonus_share", "送转股份-送转比例", 0.1))
            .derive(DerivedRule::scale("split_share", "送转股份-转股比例", 0.1))
            .derive(DerivedRule::scale("cash_dividend", "现金分红-现金分红比例", 0.1))
            .unit_column("report_period"),
        windowed: true,
        staging: false,
    }
}

fn share_capital() -> Dataset {
    Dataset {
        name: "share-capital",
        description: "Daily market value and share capital per symbol",
        units: UnitSource::Symbols,
        request: RequestSpec::new("stock_value_em").param("symbol", ParamValue::UnitCode),
        schema: TableSchema::new(
            "stock_share_capital",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("data_date"),
                ColumnSpec::real("close", 4),
                ColumnSpec::real("change_pct", 6),
                ColumnSpec::real("total_mv", 2),
                ColumnSpec::real("circulating_mv", 2),
                ColumnSpec::integer("total_share"),
                ColumnSpec::integer("float_share"),
                ColumnSpec::real("pe_ttm", 4),
                ColumnSpec::real("pe_static", 4),
                ColumnSpec::real("pb", 4),
                ColumnSpec::real("peg", 4),
                ColumnSpec::real("pcf", 4),
                ColumnSpec::real("ps", 4),
            ],
            &["symbol", "data_date"],
        ),
        rules: NormalizerSpec::new()
            .map("数据日期", "data_date")
            .map("当日收盘价", "close")
            .map("当日涨跌幅", "change_pct")
            .map("总市值", "total_mv")
            .map("流通市值", "circulating_mv")
            .map("总股本", "total_share")
            .map("流通股本", "float_share")
            .map("PE(TTM)", "pe_ttm")
            .map("PE(静)", "pe_static")
            .map("市净率", "pb")
            .map("PEG值", "peg")
            .map("市现率", "pcf")
            .map("市销率", "ps")
            .unit_column("symbol")
            .date_column("data_date"),
        windowed: true,
        staging: false,
    }
}

fn market_pb() -> Dataset {
    Dataset {
        name: "market-pb",
        description: "Market-wide price-to-book per index family",
        units: UnitSource::Fixed(MARKET_INDICES.iter().map(|(id, _)| *id).collect()),
        request: RequestSpec::new("stock_market_pb_lg")
            .param("symbol", ParamValue::Lookup(MARKET_INDICES.to_vec())),
        schema: TableSchema::new(
            "market_pb",
            vec![
                ColumnSpec::date("trade_date"),
                ColumnSpec::text("market"),
                ColumnSpec::real("index_value", 2),
                ColumnSpec::real("pb", 4),
                ColumnSpec::real("pb_weighted", 4),
                ColumnSpec::real("pb_median", 4),
            ],
            &["trade_date", "market"],
        ),
        rules: NormalizerSpec::new()
            .map("日期", "trade_date")
            .map("指数", "index_value")
            .map("市净率", "pb")
            .map("等权市净率", "pb_weighted")
            .map("市净率中位数", "pb_median")
            .unit_column("market")
            .date_column("trade_date"),
        windowed: true,
        staging: true,
    }
}

fn industry() -> Dataset {
    Dataset {
        name: "industry",
        description: "Shenwan industry classification history",
        units: UnitSource::Fixed(vec!["all"]),
        request: RequestSpec::new("stock_industry_clf_hist_sw"),
        schema: TableSchema::new(
            "stock_industry",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::date("start_date"),
                ColumnSpec::text("industry_code"),
                ColumnSpec::timestamp("update_time"),
            ],
            &["symbol", "start_date"],
        ),
        rules: NormalizerSpec::new(),
        windowed: false,
        staging: false,
    }
}
