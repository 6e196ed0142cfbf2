//! Chaos test: store nodes slower than the lookup timeout.
//!
//! A stalled node, whether slow to answer or impossible to connect to,
//! must cost its own records an ERROR each and nothing more: the job finishes in bounded time and records on healthy nodes are
//! classified normally.

use std::time::{Duration, Instant};

use mailsift_engine::JobStatus;
use mailsift_integration_tests::{TestCluster, csv_of, job_body};
use mailsift_queue::MemoryBroker;
use mailsift_types::{AckPolicy, JobId, Outcome};

/// One node answers after 300 ms with a 50 ms timeout.
#[tokio::test]
#[ntest::timeout(10000)]
async fn test_slow_node_times_out_its_records_only() {
    let c = TestCluster::new(3).with_lookup_timeout(50);
    c.slow_node(0, 300).await;

    let slow: Vec<String> = (0..3).map(|k| c.email_on_node(0, &format!("slow{k}-"))).collect();
    let fast_bounced = c.email_on_node(1, "fastb");
    let fast_valid = c.email_on_node(2, "fastv");
    c.bounce(&fast_bounced).await;
    c.bounce(&slow[0]).await;

    let mut emails = slow.clone();
    emails.push(fast_bounced.clone());
    emails.push(fast_valid.clone());

    let started = Instant::now();
    let report = c
        .pipeline()
        .await
        .process_text(JobId::from("slow"), &csv_of(&emails))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(report.status, JobStatus::Completed);
    for record in &report.outcomes[..3] {
        assert_eq!(record.outcome, Outcome::Error, "{} should time out", record.email);
    }
    assert_eq!(report.outcomes[3].outcome, Outcome::Bounced);
    assert_eq!(report.outcomes[4].outcome, Outcome::Valid);
    // Three timed-out lookups, not three full stalls.
    assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");
}

/// Latency below the timeout only slows things down.
#[tokio::test]
#[ntest::timeout(10000)]
async fn test_latency_under_timeout_is_harmless() {
    let c = TestCluster::new(3).with_lookup_timeout(500);
    for i in 0..c.len() {
        c.slow_node(i, 5).await;
    }
    let emails: Vec<String> = (0..c.len()).map(|i| c.email_on_node(i, "ok")).collect();
    c.subscribe(&emails[1]).await;

    let report = c
        .pipeline()
        .await
        .process_text(JobId::from("lat"), &csv_of(&emails))
        .await;
    assert_eq!(report.counts.get(Outcome::Error), 0);
    assert_eq!(report.counts.get(Outcome::Subscribed), 1);
    assert_eq!(report.counts.get(Outcome::Valid), 2);
}

/// A worker keeps consuming while a node stalls; jobs touching only that
/// node are acked with every record ERROR.
#[tokio::test]
#[ntest::timeout(10000)]
async fn test_worker_survives_stalled_node() {
    let c = TestCluster::new(2).with_lookup_timeout(30);
    c.slow_node(0, 1_000).await;

    let stalled = c.write_file("stalled.csv", &csv_of(&[c.email_on_node(0, "s")]));
    let healthy = c.write_file("healthy.csv", &csv_of(&[c.email_on_node(1, "h")]));
    let broker = MemoryBroker::new();
    broker.push(job_body("stalled", stalled));
    broker.push(job_body("healthy", healthy));

    let w = c.start_worker(&broker, AckPolicy::Always).await;
    broker.wait_settled(2).await;

    let reports = w.reports();
    assert_eq!(reports[0].counts.get(Outcome::Error), 1);
    assert_eq!(reports[1].counts.get(Outcome::Valid), 1);
    assert_eq!(broker.acked().len(), 2);
    w.stop().await;
}

/// A node whose connection attempts hang forever is bounded by the lookup
/// timeout on every record, and other nodes answer normally meanwhile.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ntest::timeout(10000)]
async fn test_blackholed_node_bounded_by_lookup_timeout() {
    let c = TestCluster::new(3).with_lookup_timeout(50);
    c.blackhole_node(0).await;

    let dark: Vec<String> = (0..3).map(|k| c.email_on_node(0, &format!("dark{k}-"))).collect();
    let lit = c.email_on_node(1, "lit");
    c.bounce(&lit).await;
    let mut emails = dark.clone();
    emails.push(lit.clone());

    let pipeline = c.pipeline().await;
    let started = Instant::now();
    let report = pipeline
        .process_text(JobId::from("dark"), &csv_of(&emails))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(report.status, JobStatus::Completed);
    for record in &report.outcomes[..3] {
        assert_eq!(record.outcome, Outcome::Error, "{} should time out", record.email);
    }
    assert_eq!(report.outcomes[3].outcome, Outcome::Bounced);
    assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");

    // A record on a healthy node is answered while an open to the dark
    // node is still pending.
    let pending = tokio::spawn({
        let text = csv_of(&dark[..1]);
        let pipeline = pipeline.clone();
        async move { pipeline.process_text(JobId::from("pending"), &text).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let started = Instant::now();
    let report = pipeline
        .process_text(JobId::from("lit"), &csv_of(&[&lit]))
        .await;
    assert_eq!(report.outcomes[0].outcome, Outcome::Bounced);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(pending.await.unwrap().outcomes[0].outcome, Outcome::Error);
}
