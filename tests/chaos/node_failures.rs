//! Chaos test: store nodes failing and recovering under load.
//!
//! Five nodes, a stream of jobs, and a background task killing and
//! reviving random nodes. Every job must be settled, and no record may be
//! misclassified: a record is either its true outcome or ERROR.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mailsift_integration_tests::{TestCluster, csv_of, job_body};
use mailsift_queue::MemoryBroker;
use mailsift_types::{AckPolicy, Outcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time;

const JOBS: usize = 20;
const RECORDS_PER_JOB: usize = 25;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_random_node_failures_never_misclassify() {
    let c = Arc::new(TestCluster::new(5));
    for i in 0..c.len() {
        c.slow_node(i, 1).await;
    }

    // --- Seed ---
    let mut truth: HashMap<String, Outcome> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(7);
    for j in 0..JOBS {
        for r in 0..RECORDS_PER_JOB {
            let email = format!("j{j}r{r}@chaos.test");
            let outcome = match rng.random_range(0..3) {
                0 => {
                    c.bounce(&email).await;
                    Outcome::Bounced
                }
                1 => {
                    c.subscribe(&email).await;
                    Outcome::Subscribed
                }
                _ => Outcome::Valid,
            };
            truth.insert(email, outcome);
        }
    }

    let broker = MemoryBroker::new();
    for j in 0..JOBS {
        let emails: Vec<String> = (0..RECORDS_PER_JOB)
            .map(|r| format!("j{j}r{r}@chaos.test"))
            .collect();
        let path = c.write_file(&format!("job-{j}.csv"), &csv_of(&emails));
        broker.push(job_body(&format!("job-{j}"), path));
    }

    // --- Chaos ---
    let stop = Arc::new(AtomicBool::new(false));
    let chaos = tokio::spawn({
        let c = c.clone();
        let stop = stop.clone();
        async move {
            let mut rng = StdRng::seed_from_u64(42);
            while !stop.load(Ordering::Relaxed) {
                let victim = rng.random_range(0..c.len());
                c.kill_node(victim).await;
                time::sleep(Duration::from_millis(15)).await;
                c.revive_node(victim).await;
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    });

    let w = c.start_worker(&broker, AckPolicy::Always).await;
    broker.wait_settled(JOBS).await;
    stop.store(true, Ordering::Relaxed);
    chaos.await.unwrap();

    // --- Verify ---
    let reports = w.reports();
    assert_eq!(reports.len(), JOBS);
    assert_eq!(broker.acked().len(), JOBS);

    let mut classified = 0usize;
    for report in &reports {
        assert_eq!(report.outcomes.len(), RECORDS_PER_JOB);
        for record in &report.outcomes {
            let want = truth[&record.email];
            assert!(
                record.outcome == want || record.outcome == Outcome::Error,
                "{} classified {} but is {}",
                record.email,
                record.outcome,
                want
            );
            if record.outcome != Outcome::Error {
                classified += 1;
            }
        }
    }
    // At most one node is down at a time.
    assert!(classified > 0, "nothing was classified");

    w.stop().await;
}

/// Jobs processed after a node recovers are fully classified again.
#[tokio::test]
#[ntest::timeout(5000)]
async fn test_recovered_node_serves_again() {
    let c = TestCluster::new(3);
    let email = c.email_on_node(2, "back");
    c.bounce(&email).await;
    let pipeline = c.pipeline().await;
    let text = csv_of(&[&email]);

    c.kill_node(2).await;
    let report = pipeline.process_text("down".into(), &text).await;
    assert_eq!(report.outcomes[0].outcome, Outcome::Error);

    c.revive_node(2).await;
    let report = pipeline.process_text("up".into(), &text).await;
    assert_eq!(report.outcomes[0].outcome, Outcome::Bounced);
}
