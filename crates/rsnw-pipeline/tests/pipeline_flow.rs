//! End-to-end pipeline tests against scripted browser sessions and the
//! in-memory store: no network, no browser process, no database.

use std::path::PathBuf;
use std::time::Duration;

use rsnw_browser::testing::{SessionLog, StaticFactory, StaticSession};
use rsnw_core::ItemStatus;
use rsnw_pipeline::{
    FormFiller, IngestionPipeline, SearchPlan, SubmissionPipeline, SubmitPolicy, WatcherConfig,
};
use rsnw_storage::testing::MemoryStore;
use rsnw_storage::NewsStore;
use serde_json::json;

const RESULTS_HTML: &str = r#"
<div id="search">
  <div class="SoaBEf">
    <a href="https://news.example.com/asus-cve"><div role="heading">ASUS router firmware patch fixes CVE</div></a>
    <div class="GI74Re">Critical vulnerability patched.</div>
    <div class="OSrXXb"><span>3 days ago</span></div>
  </div>
</div>
<p>ASUS has released new firmware addressing an authentication bypass in several router models.</p>
"#;

fn config() -> WatcherConfig {
    WatcherConfig {
        form_url: Some("https://forms.example.com/f".to_string()),
        searches_path: PathBuf::from("./searches.yaml"),
        deadline: Duration::from_secs(300),
        max_per_source: 5,
        source_pause: Duration::ZERO,
        item_pause: Duration::ZERO,
        lenient_url_change: false,
        tz_offset_hours: 8,
        screenshot_dir: None,
    }
}

fn single_task_plan() -> SearchPlan {
    let yaml = r#"
searches:
  - category: "Google News (EN)"
    query: "ASUS router security"
    kind: news
    lang: en
"#;
    serde_yaml::from_str(yaml).unwrap()
}

fn harvest_session(log: &SessionLog) -> StaticSession {
    StaticSession::new(log.clone())
        .with_title("Search results")
        .with_html(RESULTS_HTML)
        .with_text("ASUS has released new firmware addressing an authentication bypass.")
}

#[tokio::test]
async fn ingestion_harvests_enriches_and_deduplicates() {
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    factory.push(harvest_session(&log));
    let store = MemoryStore::new(3);

    let plan = single_task_plan();
    let report = IngestionPipeline::new(&factory, &store, &config(), plan.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.harvested, 1);
    assert_eq!(report.inserted, 1);

    let items = store.items();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.title, "ASUS router firmware patch fixes CVE");
    assert_eq!(item.url, "https://news.example.com/asus-cve");
    assert_eq!(item.source, "Google News (EN)");
    assert_eq!(item.status, ItemStatus::New);
    // Article body was long enough to win over the snippet.
    assert!(item.description.contains("authentication bypass"));
    // Search page plus one article read.
    assert_eq!(log.navigations().len(), 2);
    assert_eq!(log.quits(), 1);

    // A second run over the same results is silently absorbed.
    factory.push(harvest_session(&log));
    let second = IngestionPipeline::new(&factory, &store, &config(), plan)
        .run()
        .await
        .unwrap();
    assert_eq!(second.harvested, 1);
    assert_eq!(second.inserted, 0);
    assert_eq!(store.items().len(), 1);
}

#[tokio::test]
async fn ingestion_caps_candidates_per_source() {
    let mut entries = String::new();
    for i in 0..8 {
        entries.push_str(&format!(
            r#"<div class="SoaBEf">
              <a href="https://news.example.com/asus-{i}"><div role="heading">ASUS router advisory {i}</div></a>
              <div class="OSrXXb"><span>Today</span></div>
            </div>"#
        ));
    }
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    factory.push(
        StaticSession::new(log.clone())
            .with_html(format!("<div id=\"search\">{entries}</div>"))
            .with_text("body"),
    );
    let store = MemoryStore::new(3);

    let report = IngestionPipeline::new(&factory, &store, &config(), single_task_plan())
        .run()
        .await
        .unwrap();
    assert_eq!(report.harvested, 5);
    assert_eq!(store.items().len(), 5);
}

async fn seed_one_item(store: &MemoryStore) -> i64 {
    store
        .insert(&[rsnw_core::CleanedRecord {
            title: "ASUS router advisory".to_string(),
            url: "https://news.example.com/asus".to_string(),
            publish_date: chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            source: "Google News (EN)".to_string(),
            description: "Firmware update fixes a remote code execution flaw.".to_string(),
        }])
        .await
        .unwrap();
    store.items()[0].id
}

fn fast_filler(form_url: &str, policy: SubmitPolicy) -> FormFiller {
    FormFiller::new(form_url, policy).with_waits(
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(1),
    )
}

fn form_session(log: &SessionLog) -> StaticSession {
    StaticSession::new(log.clone())
        .with_script_results([json!(true), json!(true), json!(true)])
        .with_elements(
            "input[type='text']",
            vec!["<input type=\"text\">".to_string(); 5],
        )
}

#[tokio::test]
async fn submission_marks_acknowledged_items_submitted() {
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    factory.push(form_session(&log).with_text("您的回應已記錄"));
    let store = MemoryStore::new(3);
    let id = seed_one_item(&store).await;

    let cfg = config();
    let pipeline = SubmissionPipeline::new(&factory, &store, &cfg)
        .unwrap()
        .with_filler(fast_filler(
            cfg.form_url.as_deref().unwrap(),
            SubmitPolicy::default(),
        ));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.failed, 0);
    let item = store.items().into_iter().find(|i| i.id == id).unwrap();
    assert_eq!(item.status, ItemStatus::Submitted);
    // The per-item session is always torn down.
    assert_eq!(log.quits(), 1);
}

#[tokio::test]
async fn strict_policy_records_a_failure_without_acknowledgment() {
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    factory.push(form_session(&log).with_text("nothing to see"));
    let store = MemoryStore::new(3);
    let id = seed_one_item(&store).await;

    let cfg = config();
    let pipeline = SubmissionPipeline::new(&factory, &store, &cfg)
        .unwrap()
        .with_filler(fast_filler(
            cfg.form_url.as_deref().unwrap(),
            SubmitPolicy::default(),
        ));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.failed, 1);
    let item = store.items().into_iter().find(|i| i.id == id).unwrap();
    assert_eq!(item.status, ItemStatus::New);
    assert_eq!(item.fail_count, 1);
    assert_eq!(log.quits(), 1);
}

#[tokio::test]
async fn lenient_policy_accepts_a_url_change() {
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    factory.push(
        form_session(&log)
            .with_text("nothing to see")
            .with_urls(["https://forms.example.com/f/response"]),
    );
    let store = MemoryStore::new(3);
    let id = seed_one_item(&store).await;

    let cfg = config();
    let pipeline = SubmissionPipeline::new(&factory, &store, &cfg)
        .unwrap()
        .with_filler(fast_filler(
            cfg.form_url.as_deref().unwrap(),
            SubmitPolicy {
                lenient_url_change: true,
            },
        ));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.submitted, 1);
    let item = store.items().into_iter().find(|i| i.id == id).unwrap();
    assert_eq!(item.status, ItemStatus::Submitted);
}

#[tokio::test]
async fn three_failed_submissions_escalate_to_error() {
    let store = MemoryStore::new(3);
    let id = seed_one_item(&store).await;
    let cfg = config();

    for run in 0..3 {
        let log = SessionLog::default();
        let factory = StaticFactory::new(log.clone());
        // The form never renders: every script probe stays null.
        factory.push(StaticSession::new(log.clone()));
        let pipeline = SubmissionPipeline::new(&factory, &store, &cfg)
            .unwrap()
            .with_filler(fast_filler(
                cfg.form_url.as_deref().unwrap(),
                SubmitPolicy::default(),
            ));
        let report = pipeline.run().await.unwrap();
        assert_eq!(report.failed, 1, "run {run}");
    }

    let item = store.items().into_iter().find(|i| i.id == id).unwrap();
    assert_eq!(item.status, ItemStatus::Error);
    assert_eq!(item.fail_count, 3);

    // Nothing left to submit; the errored item stays errored.
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    let report = SubmissionPipeline::new(&factory, &store, &cfg)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn submission_requires_a_form_url() {
    let log = SessionLog::default();
    let factory = StaticFactory::new(log.clone());
    let store = MemoryStore::new(3);
    let cfg = WatcherConfig {
        form_url: None,
        ..config()
    };
    assert!(SubmissionPipeline::new(&factory, &store, &cfg).is_err());
}
