//! Integration test: routing through the live router.
//!
//! The router owned by a worker must place every address exactly where a
//! standalone ring over the same node list does, so that addresses seeded
//! on their owning node are found again.

use mailsift_engine::JobStatus;
use mailsift_integration_tests::TestCluster;
use mailsift_placement::Ring;
use mailsift_types::{JobId, Outcome};

fn sample_emails(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("user{i}@example.com")).collect()
}

/// Router and standalone ring agree on every owner.
#[tokio::test]
async fn test_router_agrees_with_standalone_ring() {
    let c = TestCluster::new(5);
    let router = c.router().await;
    let standalone = Ring::with_nodes(c.node_ids(), mailsift_integration_tests::REPLICAS).unwrap();

    for email in sample_emails(1_000) {
        assert_eq!(
            router.route(&email).as_ref(),
            standalone.route(&email),
            "owner of {email}"
        );
    }
}

/// Two independently built routers place addresses identically.
#[tokio::test]
async fn test_routing_deterministic_across_workers() {
    let c = TestCluster::new(4);
    let a = c.router().await;
    let b = c.router().await;

    for email in sample_emails(500) {
        assert_eq!(a.route(&email), b.route(&email));
    }
}

/// Every node receives some addresses.
#[tokio::test]
async fn test_every_node_owns_addresses() {
    let c = TestCluster::new(3);
    let mut owned = vec![0usize; c.len()];
    for email in sample_emails(3_000) {
        owned[c.owner(&email)] += 1;
    }
    assert!(owned.iter().all(|&n| n > 0), "ownership {owned:?}");
}

/// An address seeded on each node is found through the pipeline.
#[tokio::test]
async fn test_seeded_addresses_found_on_every_node() {
    let c = TestCluster::new(5);
    let mut emails = Vec::new();
    for i in 0..c.len() {
        let bounced = c.email_on_node(i, "bounced");
        let subscribed = c.email_on_node(i, "subscribed");
        c.bounce(&bounced).await;
        c.subscribe(&subscribed).await;
        emails.push((bounced, Outcome::Bounced));
        emails.push((subscribed, Outcome::Subscribed));
        emails.push((c.email_on_node(i, "fresh"), Outcome::Valid));
    }

    let text = mailsift_integration_tests::csv_of(
        &emails.iter().map(|(e, _)| e.as_str()).collect::<Vec<_>>(),
    );
    let report = c.pipeline().await.process_text(JobId::from("route"), &text).await;

    assert_eq!(report.status, JobStatus::Completed);
    for (record, (email, want)) in report.outcomes.iter().zip(&emails) {
        assert_eq!(&record.email, email);
        assert_eq!(record.outcome, *want, "outcome of {email}");
    }
    assert_eq!(report.counts.total(), 15);
}

/// An address whose owner differs only in case is a different key.
#[tokio::test]
async fn test_addresses_are_case_sensitive_keys() {
    let c = TestCluster::new(3);
    c.bounce("Ada@Example.com").await;
    let pipeline = c.pipeline().await;

    let report = pipeline
        .process_text(JobId::from("case"), "email\nAda@Example.com\nada@example.com\n")
        .await;
    assert_eq!(report.outcomes[0].outcome, Outcome::Bounced);
    assert_eq!(report.outcomes[1].outcome, Outcome::Valid);
}
