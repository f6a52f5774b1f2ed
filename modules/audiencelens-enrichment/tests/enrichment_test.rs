use std::sync::Arc;
use std::time::Duration;

use audiencelens_common::{Confidence, EntityId, PlatformId, SubjectKey};
use audiencelens_enrichment::{
    DemographicsEnricher, EnrichmentWorker, Outcome, ReportDemographics, ResearchQuery,
    StaticProfiles, SubjectProfile,
};
use audiencelens_store::testing::{MemoryBackend, ScriptedLink};
use audiencelens_store::{
    CacheStore, ConnectionManager, EntryMeta, LocalConnection, QueryCacheEntry,
    ResilientConnection,
};
use chrono::{TimeDelta, Utc};
use research_client::testing::{MockTransport, Scripted};
use research_client::ResearchClient;
use serde_json::json;

const ANSWER: &str = r#"{
  "gender": {"female": 58, "male": 40, "other": 2},
  "age_brackets": {"18-24": 31, "25-34": 44, "35-44": 15},
  "geography": [{"country": "US", "percentage": 46}, {"country": "GB", "percentage": 12}],
  "languages": [{"language": "English", "percentage": 90}],
  "interests": ["cooking", "travel"],
  "data_confidence": "medium",
  "sources": [{"source": "Creator media kit", "data_points": ["gender", "age"]}],
  "notes": ""
}"#;

fn platform(raw: &str) -> PlatformId {
    PlatformId::new(raw).unwrap()
}

fn key(entity: i64, raw: &str) -> SubjectKey {
    SubjectKey::new(EntityId::new(entity).unwrap(), platform(raw))
}

fn profiles(entity: i64, platforms: &[&str]) -> StaticProfiles {
    platforms.iter().fold(StaticProfiles::new(), |acc, p| {
        acc.with(key(entity, p), "Ada Cooks", &format!("https://{p}.example/@ada"))
    })
}

struct Harness {
    backend: Arc<MemoryBackend>,
    mock: Arc<MockTransport>,
    enricher: DemographicsEnricher,
}

fn harness_with(
    mock: MockTransport,
    backend: MemoryBackend,
    connection: Arc<dyn ConnectionManager>,
    profiles: StaticProfiles,
    refresh_interval: Duration,
) -> Harness {
    let backend = Arc::new(backend);
    let mock = Arc::new(mock);
    let store = CacheStore::new(backend.clone(), connection);
    let client = ResearchClient::with_transport(mock.clone()).with_timeout(Duration::from_secs(600));
    let enricher = DemographicsEnricher::builder()
        .store(store)
        .client(Arc::new(client))
        .profiles(Arc::new(profiles))
        .refresh_interval(refresh_interval)
        .build();
    Harness {
        backend,
        mock,
        enricher,
    }
}

fn harness(mock: MockTransport, profiles: StaticProfiles) -> Harness {
    harness_with(
        mock,
        MemoryBackend::new(),
        Arc::new(LocalConnection),
        profiles,
        Duration::from_secs(300),
    )
}

fn completing_job(id: &str) -> MockTransport {
    MockTransport::new()
        .submit_ok(id)
        .poll_for(id, Scripted::status("in_progress"))
        .poll_for(id, Scripted::status("in_progress"))
        .poll_for(id, Scripted::completed_with_tokens(ANSWER, 5000))
}

#[tokio::test(start_paused = true)]
async fn research_result_is_cached_raw_and_parsed() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));

    let outcome = h
        .enricher
        .enrich_subject(42, &[platform("video-hosting")])
        .await
        .unwrap();

    assert_eq!(outcome.len(), 1);
    assert_eq!(outcome.get(&platform("video-hosting")), Some(&true));
    assert_eq!(h.mock.submissions().len(), 1);
    assert_eq!(h.mock.polls(), 3);

    let rows = h.backend.query_rows();
    assert_eq!(rows.len(), 1);
    let raw = &rows[0];
    assert_eq!(raw.key, key(42, "video-hosting"));
    assert_eq!(raw.job_handle, "job-1");
    assert_eq!(raw.total_tokens, 5000);
    assert_eq!(raw.input_tokens, 2500);
    assert_eq!(raw.fingerprint, ResearchQuery::new(raw.query_text.clone()).fingerprint);
    assert!(raw.query_text.contains("Ada Cooks"));
    assert!(raw.query_text.contains("https://video-hosting.example/@ada"));

    let entry = h.backend.demographics_row(&key(42, "video-hosting")).unwrap();
    assert_eq!(entry.confidence, Confidence::Medium);
    assert_eq!(entry.source_tag, "deep_research");
    assert_eq!(entry.fetched_at, raw.completed_at);
    let parsed = entry.profile().unwrap();
    assert_eq!(parsed.interests, vec!["cooking", "travel"]);
    assert_eq!(parsed.geography[0].country, "US");
}

#[tokio::test(start_paused = true)]
async fn second_run_is_served_from_cache() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));
    let platforms = [platform("video-hosting")];

    h.enricher.enrich_subject(42, &platforms).await.unwrap();
    let polls = h.mock.polls();

    let outcome = h
        .enricher
        .run(&key(42, "video-hosting"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::CacheHit);
    assert_eq!(h.mock.submissions().len(), 1);
    assert_eq!(h.mock.polls(), polls);
}

#[tokio::test(start_paused = true)]
async fn entity_representations_share_cache_entries() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));
    let platforms = [platform("video-hosting")];

    h.enricher.enrich_subject(42i64, &platforms).await.unwrap();

    for outcome in [
        h.enricher.enrich_subject(42.0f64, &platforms).await.unwrap(),
        h.enricher.enrich_subject("42", &platforms).await.unwrap(),
        h.enricher.enrich_subject(&json!("42"), &platforms).await.unwrap(),
    ] {
        assert_eq!(outcome.get(&platform("video-hosting")), Some(&true));
    }
    assert_eq!(h.mock.submissions().len(), 1);
    assert_eq!(h.backend.demographics_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_entity_is_rejected_before_any_work() {
    let h = harness(MockTransport::new(), profiles(42, &["video-hosting"]));

    let err = h
        .enricher
        .enrich_subject(42.5f64, &[platform("video-hosting")])
        .await;
    assert!(err.is_err());
    assert!(h.mock.submissions().is_empty());
    assert_eq!(h.backend.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cached_raw_result_is_rederived_without_paying() {
    let h = harness(MockTransport::new(), profiles(42, &["video-hosting"]));
    let subject = key(42, "video-hosting");
    let query = ResearchQuery::demographics(
        &SubjectProfile {
            display_name: "Ada Cooks".into(),
            profile_url: "https://video-hosting.example/@ada".into(),
        },
        &subject.platform,
    );
    let completed_at = Utc::now() - TimeDelta::days(3);
    h.enricher
        .store()
        .put_query_cache(&QueryCacheEntry {
            key: subject.clone(),
            fingerprint: query.fingerprint.clone(),
            query_text: query.text.clone(),
            job_handle: "job-earlier".into(),
            raw_text: ANSWER.into(),
            result_json: None,
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            completed_at,
        })
        .await
        .unwrap();

    let outcome = h.enricher.run(&subject).await.unwrap();

    assert_eq!(outcome, Outcome::Rederived);
    assert!(h.mock.submissions().is_empty());
    let entry = h.backend.demographics_row(&subject).unwrap();
    assert_eq!(entry.fetched_at, completed_at);
    assert_eq!(entry.confidence, Confidence::Medium);
}

#[tokio::test(start_paused = true)]
async fn one_failing_platform_does_not_affect_the_others() {
    let mock = MockTransport::new()
        .route("on p1 (", "job-1")
        .route("on p2 (", "job-2")
        .route("on p3 (", "job-3")
        .poll_for("job-1", Scripted::status("in_progress"))
        .poll_for("job-1", Scripted::completed(ANSWER))
        .poll_for("job-2", Scripted::status("in_progress"))
        .poll_for("job-2", Scripted::failed("agent gave up"))
        .poll_for("job-3", Scripted::completed(ANSWER));
    let h = harness(mock, profiles(7, &["p1", "p2", "p3"]));

    let outcome = h
        .enricher
        .enrich_subject(7, &[platform("p1"), platform("p2"), platform("p3")])
        .await
        .unwrap();

    assert_eq!(outcome.get(&platform("p1")), Some(&true));
    assert_eq!(outcome.get(&platform("p2")), Some(&false));
    assert_eq!(outcome.get(&platform("p3")), Some(&true));
    assert_eq!(h.backend.demographics_len(), 2);
    assert!(h.backend.demographics_row(&key(7, "p2")).is_none());
    assert_eq!(h.backend.query_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn duplicate_platforms_are_enriched_once() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));

    let outcome = h
        .enricher
        .enrich_subject(
            42,
            &[platform("video-hosting"), platform("Video-Hosting")],
        )
        .await
        .unwrap();

    assert_eq!(outcome.len(), 1);
    assert_eq!(h.mock.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_profile_fails_without_research() {
    let h = harness(MockTransport::new(), StaticProfiles::new());

    let outcome = h
        .enricher
        .enrich_subject(42, &[platform("video-hosting")])
        .await
        .unwrap();

    assert_eq!(outcome.get(&platform("video-hosting")), Some(&false));
    assert!(h.mock.submissions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unparseable_answer_keeps_raw_result_for_next_time() {
    let mock = MockTransport::new()
        .submit_ok("job-1")
        .poll_for("job-1", Scripted::completed("I could not find anything useful."));
    let h = harness(mock, profiles(42, &["video-hosting"]));
    let subject = key(42, "video-hosting");

    assert!(!h.enricher.enrich_platform(&subject).await);
    assert_eq!(h.backend.query_len(), 1);
    assert_eq!(h.backend.demographics_len(), 0);

    // The raw answer is reused rather than paid for again.
    assert!(!h.enricher.enrich_platform(&subject).await);
    assert_eq!(h.mock.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unavailable_sections_still_enrich() {
    let answer = r#"{
      "gender": "Data Not Available",
      "age_brackets": {"18-24": 40, "25-34": 35},
      "geography": [{"country": "US", "percentage": 50}],
      "languages": "Data Not Available",
      "data_confidence": "low",
      "notes": "Gender split not published"
    }"#;
    let mock = MockTransport::new()
        .submit_ok("job-1")
        .poll_for("job-1", Scripted::completed(answer));
    let h = harness(mock, profiles(42, &["video-hosting"]));
    let subject = key(42, "video-hosting");

    assert!(h.enricher.enrich_platform(&subject).await);

    let parsed = h.backend.demographics_row(&subject).unwrap().profile().unwrap();
    assert!(parsed.gender.is_empty());
    assert!(parsed.languages.is_empty());
    assert_eq!(parsed.age_brackets["25-34"], 35.0);
    assert_eq!(parsed.data_confidence, Confidence::Low);
}

#[tokio::test(start_paused = true)]
async fn exhausted_demographics_write_still_keeps_raw_result() {
    let link = Arc::new(ResilientConnection::new(ScriptedLink::new().always_dead()));
    let mock = MockTransport::new()
        .submit_ok("job-1")
        .poll_for("job-1", Scripted::completed(ANSWER));
    let h = harness_with(
        mock,
        MemoryBackend::new().fail_demographic_writes(10),
        link.clone(),
        profiles(42, &["video-hosting"]),
        Duration::from_secs(3600),
    );

    let ok = h.enricher.enrich_platform(&key(42, "video-hosting")).await;

    assert!(!ok);
    assert_eq!(h.backend.query_len(), 1);
    assert_eq!(h.backend.demographics_len(), 0);
    assert_eq!(link.link().reopen_times().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn research_timeout_is_a_platform_failure() {
    let mock = MockTransport::new()
        .submit_ok("job-slow")
        .poll_forever(Scripted::status("in_progress"));
    let backend = Arc::new(MemoryBackend::new());
    let store = CacheStore::new(backend.clone(), Arc::new(LocalConnection));
    let client = ResearchClient::with_transport(Arc::new(mock)).with_timeout(Duration::from_secs(60));
    let enricher = DemographicsEnricher::builder()
        .store(store)
        .client(Arc::new(client))
        .profiles(Arc::new(profiles(42, &["video-hosting"])))
        .build();

    assert!(!enricher.enrich_platform(&key(42, "video-hosting")).await);
    assert_eq!(backend.query_len(), 0);
    assert_eq!(backend.demographics_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn store_connection_is_refreshed_while_polling() {
    let link = Arc::new(ResilientConnection::new(
        ScriptedLink::new().probes([false, true]),
    ));
    let h = harness_with(
        completing_job("job-1"),
        MemoryBackend::new(),
        link.clone(),
        profiles(42, &["video-hosting"]),
        Duration::ZERO,
    );

    assert!(h.enricher.enrich_platform(&key(42, "video-hosting")).await);

    assert!(link.link().pings() >= 2);
    assert_eq!(link.link().reopen_times().len(), 1);
    assert_eq!(link.health().consecutive_failures, 0);
    assert_eq!(h.backend.demographics_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_for_one_subject_are_deduplicated() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));
    let subject = key(42, "video-hosting");

    let (first, second) = tokio::join!(
        h.enricher.enrich_platform(&subject),
        h.enricher.enrich_platform(&subject),
    );

    assert!(first);
    assert!(!second);
    assert_eq!(h.mock.submissions().len(), 1);

    // The claim is released once the first run finishes.
    assert!(h.enricher.enrich_platform(&subject).await);
}

#[tokio::test(start_paused = true)]
async fn worker_drains_queued_requests() {
    let mock = MockTransport::new()
        .route("on web (", "job-web")
        .route("on video (", "job-video")
        .poll_for("job-web", Scripted::completed(ANSWER))
        .poll_for("job-video", Scripted::status("in_progress"))
        .poll_for("job-video", Scripted::completed(ANSWER));
    let profiles = profiles(1, &["web"]).with(key(2, "video"), "Bo", "https://video.example/@bo");
    let h = harness(mock, profiles);

    let (handle, worker) = EnrichmentWorker::spawn(h.enricher.clone(), 2);
    let first = handle.submit(EntityId::new(1).unwrap(), vec![platform("web")]).unwrap();
    let second = handle
        .enqueue(EntityId::new(2).unwrap(), vec![platform("video")])
        .await
        .unwrap();
    assert_ne!(first, second);
    drop(handle);

    worker.await.unwrap();
    assert_eq!(h.backend.demographics_len(), 2);
    assert_eq!(h.mock.submissions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn report_reads_only_fresh_cached_demographics() {
    let h = harness(completing_job("job-1"), profiles(42, &["video-hosting"]));
    h.enricher
        .enrich_subject(42, &[platform("video-hosting")])
        .await
        .unwrap();
    h.enricher
        .store()
        .put_demographics(
            &key(42, "forum"),
            json!({"interests": ["old"]}),
            EntryMeta::research(Confidence::Low, Utc::now() - TimeDelta::days(120)),
        )
        .await
        .unwrap();

    let report = ReportDemographics::new(h.enricher.store().clone());
    let found = report
        .for_entity(
            EntityId::new(42).unwrap(),
            &[platform("video-hosting"), platform("forum"), platform("blog")],
        )
        .await;

    assert_eq!(found.len(), 1);
    assert_eq!(found[&platform("video-hosting")].data_confidence, Confidence::Medium);
    assert_eq!(h.mock.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn report_treats_store_errors_as_missing() {
    let backend = Arc::new(MemoryBackend::new().fail_next(100));
    let store = CacheStore::new(backend, Arc::new(LocalConnection));
    let report = ReportDemographics::new(store);

    assert!(report.for_subject(&key(42, "video-hosting")).await.is_none());
}
