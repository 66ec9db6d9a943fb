//! AKTools adapter against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use astock_common::ProviderConfig;
use astock_ingest::datasets;
use astock_ingest::pipeline::{
    AutoConfirm, CancelFlag, DataSource, FetchError, FetchPoolOptions, IdentifierSource,
    IngestionRun, MarketFilter, MemoryCheckpoint, Pacing, RawResult, RetryPolicy, RunOptions,
    RunState, SinkOptions, Storage, UpsertSink, WorkUnit,
};
use astock_ingest::provider::{AkToolsClient, AkToolsIdentifiers, AkToolsSource, ParamValue, RequestSpec};
use astock_ingest::storage::SqliteWarehouse;

fn client(server: &MockServer) -> Arc<AkToolsClient> {
    let config = ProviderConfig {
        base_url: format!("{}/", server.uri()),
        timeout_secs: 5,
    };
    Arc::new(AkToolsClient::new(&config).unwrap())
}

fn daily_source(server: &MockServer) -> AkToolsSource {
    AkToolsSource::new(
        client(server),
        RequestSpec::new("stock_zh_a_daily")
            .param("symbol", ParamValue::UnitId)
            .param("adjust", ParamValue::Fixed("")),
    )
}

fn unit() -> WorkUnit {
    WorkUnit::new("sh600000", None)
}

#[tokio::test]
async fn test_records_are_returned_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/public/stock_zh_a_daily"))
        .and(query_param("symbol", "sh600000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"date": "2024-01-02", "close": 10.0},
            {"date": "2024-01-03", "close": 10.5},
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let result = daily_source(&server).fetch(&unit()).await.unwrap();

    let RawResult::Records(records) = result else {
        panic!("expected records");
    };
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["close"], json!(10.5));
}

#[tokio::test]
async fn test_empty_array_is_empty_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let result = daily_source(&server).fetch(&unit()).await.unwrap();
    assert_eq!(result, RawResult::Empty);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
        .mount(&server)
        .await;

    let err = daily_source(&server).fetch(&unit()).await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("upstream busy"));
}

#[tokio::test]
async fn test_client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = daily_source(&server).fetch(&unit()).await.unwrap_err();
    assert!(matches!(err, FetchError::Permanent(_)));
}

#[tokio::test]
async fn test_undecodable_body_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = daily_source(&server).fetch(&unit()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_identifiers_from_code_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/public/stock_info_a_code_name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "600000", "name": "浦发银行"},
            {"code": 1, "name": "平安银行"},
            {"name": "no code"},
        ])))
        .mount(&server)
        .await;

    let ids = AkToolsIdentifiers::new(client(&server))
        .list_identifiers()
        .await
        .unwrap();
    assert_eq!(ids, vec!["600000".to_string(), "000001".to_string()]);
}

#[tokio::test]
async fn test_daily_run_retries_through_a_busy_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/public/stock_info_a_code_name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": "600000"},
            {"code": "000001"},
            {"code": "830799"},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/public/stock_zh_a_daily"))
        .and(query_param("symbol", "sz000001"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/public/stock_zh_a_daily"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"date": "2024-01-02", "open": 9.9, "high": 10.2, "low": 9.7, "close": 10.0,
             "volume": 1000.0, "amount": 10000.0, "turnover": 0.001},
        ])))
        .mount(&server)
        .await;

    let markets = MarketFilter::default();
    let dataset = datasets::find("daily", &markets).unwrap();
    let warehouse = Arc::new(SqliteWarehouse::open_in_memory().unwrap());
    let sink = UpsertSink::new(warehouse.clone(), dataset.schema.clone(), SinkOptions::default());
    let mut run = IngestionRun::new(RunOptions::new(dataset.name), dataset.normalizer(), sink)
        .with_enumerator(dataset.enumerator(&markets, None))
        .with_fetch_options(FetchPoolOptions {
            max_workers: 2,
            retry: RetryPolicy::new(3, Duration::ZERO),
            pacing: Pacing::none(),
            seed: Some(1),
        })
        .with_checkpoint(Arc::new(MemoryCheckpoint::new()))
        .with_confirm(Arc::new(AutoConfirm(true)));

    let client = client(&server);
    let today = chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
    let ids = dataset.identifiers(client.clone(), None, today);
    let outcome = run
        .execute(ids.as_ref(), dataset.source(client), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.units_total, 2);
    assert_eq!(outcome.units_succeeded, 2);
    assert_eq!(warehouse.count("stock_daily").await.unwrap(), 2);
}
