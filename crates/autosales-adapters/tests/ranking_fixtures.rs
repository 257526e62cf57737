use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use autosales_adapters::{
    collect_brand, load_fixture, AdapterContext, AutohomeAdapter, BrandConfig, DongchediAdapter,
    SourceAdapter,
};
use autosales_core::{Cadence, PeriodKey, SeriesKey, WideTable};
use autosales_storage::testing::serve_canned;
use autosales_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn fixture_path(source_id: &str, name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
        .join(name)
}

fn month(label: &str) -> PeriodKey {
    Cadence::Monthly.parse_label(label).unwrap()
}

#[test]
fn dongchedi_fixture_parses_into_records() {
    let body = load_fixture(fixture_path("dongchedi", "rank_202401.json")).unwrap();
    let adapter = DongchediAdapter::default();
    let records = adapter
        .parse_response(&BrandConfig::new("小鹏", 195), month("202401"), &body)
        .unwrap();

    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.key.brand == "小鹏"));
    assert_eq!(records[1].value, 2750.0);
    assert_eq!(records[4].value, 0.0);

    // duplicate pages sum once tabulated
    let table = WideTable::from_records(Cadence::Monthly, records).unwrap();
    let x9 = SeriesKey::new("小鹏", "小鹏X9", "35.98-41.98万");
    assert_eq!(table.cell(&x9, &month("202401")), Some(1632.0));
    assert_eq!(table.len(), 4);
}

#[test]
fn autohome_fixture_uses_configured_brand_name() {
    let body = load_fixture(fixture_path("autohome", "rank_2025-01-07.json")).unwrap();
    let adapter = AutohomeAdapter::default();
    let week = Cadence::Weekly.parse_label("2025-01-07").unwrap();
    let records = adapter
        .parse_response(&BrandConfig::new("理想", 345), week, &body)
        .unwrap();

    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.key.brand == "理想" && r.period == week));
    assert_eq!(records[0].key.model, "理想L6");
    assert_eq!(records[0].key.price, "24.98-27.98万");
    assert_eq!(records[1].value, 2108.0);
    assert_eq!(records[3].value, 0.0);
}

#[tokio::test]
async fn collector_skips_failed_periods_and_keeps_going() {
    let ok = |count: u32| {
        format!(
            r#"{{"data":{{"list":[{{"brand_name":"BrandA","series_name":"ModelX","price":"100000","count":{count}}}]}}}}"#
        )
    };
    let (url, hits) = serve_canned(vec![
        (200, ok(50)),
        // 202402: exhausts one retry
        (500, "down".to_string()),
        (500, "down".to_string()),
        // 202403: answered but unusable
        (200, "{\"data\":{}}".to_string()),
        (200, ok(70)),
    ])
    .await
    .unwrap();

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
        request_delay: Duration::from_millis(1),
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        },
    })
    .unwrap();
    let adapter = DongchediAdapter::new(url);
    let ctx = AdapterContext {
        run_id: Uuid::new_v4(),
    };
    let periods = vec![month("202401"), month("202402"), month("202403"), month("202404")];

    let brand = BrandConfig::new("BrandA", 1);
    let harvest = collect_brand(&http, &adapter, &ctx, &brand, &periods).await;

    assert_eq!(hits.load(Ordering::SeqCst), 5);
    assert_eq!(harvest.fetched_periods, vec![month("202401"), month("202404")]);
    let skipped: Vec<_> = harvest.skipped_periods.iter().map(|s| s.period.as_str()).collect();
    assert_eq!(skipped, vec!["202402", "202403"]);
    assert_eq!(harvest.records.len(), 2);
    assert_eq!(harvest.records[1].value, 70.0);
}
