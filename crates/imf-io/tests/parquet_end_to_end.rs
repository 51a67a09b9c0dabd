use imf_core::{CatalogSpec, RefreshPipeline, RefreshSpec, RunStatus, StoreSpec};
use imf_io::open_destination;
use imf_io::source_catalog::HttpCatalog;
use imf_io::store_parquet::ParquetDirStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Serves a small WEO catalog; returns the `LUR` mock so tests can replace it.
async fn mock_datamapper(server: &mut mockito::ServerGuard) -> mockito::Mock {
    let indicators = json!({
        "indicators": {
            "NGDP_RPCH": {"label": "Real GDP growth", "dataset": "WEO"},
            "LUR": {"label": "Unemployment rate", "dataset": "WEO"},
            "FM_GG": {"label": "Gross debt", "dataset": "FM"},
            "": {"label": null}
        }
    });
    server
        .mock("GET", "/indicators")
        .with_status(200)
        .with_body(indicators.to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/NGDP_RPCH")
        .with_status(200)
        .with_body(
            json!({"values": {"NGDP_RPCH": {
                "USA": {"2022": 1.9, "2023": "2.5", "2024": null},
                "FRA": {"2023": 0.9}
            }}})
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/LUR")
        .with_status(200)
        .with_body(json!({"values": {"LUR": {"CAN": {"2023": 5.4}}}}).to_string())
        .create_async()
        .await
}

fn spec_for(server: &mockito::ServerGuard, warehouse: &std::path::Path) -> RefreshSpec {
    let mut spec = RefreshSpec {
        catalog: CatalogSpec {
            base_url: server.url(),
            timeout_secs: 5,
            ..CatalogSpec::default()
        },
        store: StoreSpec::ParquetDir {
            path: warehouse.to_path_buf(),
            flush_rows: 2,
            flush_interval_ms: 5,
        },
        ..RefreshSpec::default()
    };
    spec.destination.table_name = "WEO_DATA".to_string();
    spec.commit.poll_attempts = 400;
    spec.commit.poll_interval_ms = 5;
    spec
}

#[tokio::test]
async fn refresh_from_http_into_parquet_directory() {
    let mut server = mockito::Server::new_async().await;
    let _lur = mock_datamapper(&mut server).await;
    let warehouse = tempfile::tempdir().unwrap();
    let spec = spec_for(&server, warehouse.path());

    let catalog = HttpCatalog::new(&spec.catalog).unwrap();
    let destination = open_destination(&spec.store).unwrap();
    let pipeline = RefreshPipeline::new(
        spec,
        Arc::new(catalog),
        destination.tables,
        destination.ingest,
    );

    let outcome = pipeline.run(CancellationToken::new()).await;
    assert_eq!(outcome.status, RunStatus::Replaced, "{outcome}");
    assert_eq!(outcome.row_count, 5);

    // a fresh handle reads only what the manifest published
    let reopened = ParquetDirStore::open(warehouse.path(), 2, Duration::from_millis(5)).unwrap();
    let mut names = reopened.table_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["WEO_DATA", "WEO_DATA_STAGING"]);

    let rows = reopened.read_table("WEO_DATA").unwrap();
    let keys: Vec<_> = rows
        .iter()
        .map(|r| (r.indicator_code.as_str(), r.entity_code.as_str(), r.period, r.value))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("LUR", "CAN", 2023, Some(5.4)),
            ("NGDP_RPCH", "FRA", 2023, Some(0.9)),
            ("NGDP_RPCH", "USA", 2022, Some(1.9)),
            ("NGDP_RPCH", "USA", 2023, Some(2.5)),
            ("NGDP_RPCH", "USA", 2024, None),
        ]
    );
    // stored at microsecond precision
    let stamp = outcome.ingestion_timestamp.timestamp_micros();
    assert!(rows
        .iter()
        .all(|r| r.ingestion_timestamp.timestamp_micros() == stamp));
    assert!(reopened.read_table("WEO_DATA_STAGING").unwrap().is_empty());
}

#[tokio::test]
async fn failed_indicator_fetch_keeps_published_table() {
    let mut server = mockito::Server::new_async().await;
    let lur = mock_datamapper(&mut server).await;
    let warehouse = tempfile::tempdir().unwrap();
    let spec = spec_for(&server, warehouse.path());

    let destination = open_destination(&spec.store).unwrap();
    let pipeline = RefreshPipeline::new(
        spec.clone(),
        Arc::new(HttpCatalog::new(&spec.catalog).unwrap()),
        destination.tables.clone(),
        destination.ingest.clone(),
    );
    assert!(pipeline.run(CancellationToken::new()).await.is_replaced());

    lur.remove_async().await;
    server
        .mock("GET", "/LUR")
        .with_status(503)
        .create_async()
        .await;
    let outcome = pipeline.run(CancellationToken::new()).await;
    assert_eq!(outcome.status, RunStatus::Aborted);

    let reopened = ParquetDirStore::open(warehouse.path(), 2, Duration::from_millis(5)).unwrap();
    assert_eq!(reopened.read_table("WEO_DATA").unwrap().len(), 5);
}
