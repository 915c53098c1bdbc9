//! End-to-end runs of the orchestrator against an in-process CA.

mod common;

use certkeeper::inspect::parse_certificate_pem;
use certkeeper::{inspect, KeyMaterial, OutputKind, RenewalReason, WebrootPublisher};

use common::{names, FakeCa, Sandbox};

fn read(sandbox: &Sandbox, kind: OutputKind) -> String {
    std::fs::read_to_string(sandbox.installer().path_for("web", kind)).unwrap()
}

#[tokio::test]
async fn test_first_issuance_installs_all_outputs() {
    let sandbox = Sandbox::new();
    let ca = FakeCa::new(&sandbox.webroot);
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com", "www.example.com"], false);

    let outcome = orchestrator.run(&ca, &publisher).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.reason, RenewalReason::Missing);

    for kind in OutputKind::ALL {
        assert!(
            sandbox.installer().path_for("web", kind).exists(),
            "{:?} missing",
            kind
        );
    }
    assert_eq!(ca.validated(), names(&["example.com", "www.example.com"]));
    assert!(sandbox.leftover_challenges().is_empty());

    let full_chain = read(&sandbox, OutputKind::FullChain);
    assert_eq!(Some(full_chain.clone()), ca.issued_chain());
    assert!(full_chain.starts_with(&read(&sandbox, OutputKind::Certificate)));
    assert!(full_chain.ends_with(&read(&sandbox, OutputKind::Chain)));
}

#[tokio::test]
async fn test_installed_certificate_inspects_as_issued() {
    let sandbox = Sandbox::new();
    let ca = FakeCa::new(&sandbox.webroot);
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    sandbox
        .orchestrator(&["example.com", "api.example.com"], false)
        .run(&ca, &publisher)
        .await
        .unwrap();

    let leaf = parse_certificate_pem(read(&sandbox, OutputKind::Certificate).as_bytes()).unwrap();
    let inspected =
        inspect(&sandbox.installer().path_for("web", OutputKind::Certificate)).unwrap();
    assert_eq!(inspected.sans, names(&["api.example.com", "example.com"]));
    assert_eq!(inspected.not_after, leaf.not_after);

    let key = KeyMaterial::from_pem(&read(&sandbox, OutputKind::Key)).unwrap();
    assert_eq!(key.public_key_der(), inspected.public_key);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com"], false);

    let first = FakeCa::new(&sandbox.webroot);
    assert!(orchestrator.run(&first, &publisher).await.unwrap().changed);
    let before = sandbox.snapshot();

    let second = FakeCa::new(&sandbox.webroot);
    let outcome = orchestrator.run(&second, &publisher).await.unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.reason, RenewalReason::Current);
    assert_eq!(second.calls(), 0);
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn test_current_certificate_skips_the_ca() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com", "www.example.com"], false);

    let seed = FakeCa::new(&sandbox.webroot).with_validity_days(60);
    orchestrator.run(&seed, &publisher).await.unwrap();

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = orchestrator.run(&ca, &publisher).await.unwrap();
    assert!(!outcome.changed);
    assert_eq!(ca.calls(), 0);
}

#[tokio::test]
async fn test_rejected_authorization_leaves_previous_files() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);

    let seed = FakeCa::new(&sandbox.webroot);
    sandbox
        .orchestrator(&["example.com"], false)
        .run(&seed, &publisher)
        .await
        .unwrap();
    let before = sandbox.snapshot();

    let ca = FakeCa::new(&sandbox.webroot).rejecting("www.example.com");
    let err = sandbox
        .orchestrator(&["example.com", "www.example.com"], false)
        .run(&ca, &publisher)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "challenge_rejected");
    assert!(err.to_string().contains("www.example.com"));
    assert!(err.to_string().contains("Invalid response"));
    assert!(sandbox.leftover_challenges().is_empty());
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn test_san_change_reissues_with_fresh_key() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);

    let seed = FakeCa::new(&sandbox.webroot);
    sandbox
        .orchestrator(&["example.com", "www.example.com"], false)
        .run(&seed, &publisher)
        .await
        .unwrap();
    let old_key = read(&sandbox, OutputKind::Key);

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = sandbox
        .orchestrator(&["example.com", "www.example.com", "api.example.com"], false)
        .run(&ca, &publisher)
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.reason, RenewalReason::SansChanged);
    assert_ne!(read(&sandbox, OutputKind::Key), old_key);

    let installed =
        inspect(&sandbox.installer().path_for("web", OutputKind::Certificate)).unwrap();
    assert_eq!(
        installed.sans,
        names(&["api.example.com", "example.com", "www.example.com"])
    );
}

#[tokio::test]
async fn test_expiring_certificate_keeps_its_key() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com"], false);

    let seed = FakeCa::new(&sandbox.webroot).with_validity_days(10);
    orchestrator.run(&seed, &publisher).await.unwrap();
    let old_key = read(&sandbox, OutputKind::Key);
    let old_cert = read(&sandbox, OutputKind::Certificate);

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = orchestrator.run(&ca, &publisher).await.unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.reason, RenewalReason::Expiring);
    assert_eq!(read(&sandbox, OutputKind::Key), old_key);
    assert_ne!(read(&sandbox, OutputKind::Certificate), old_cert);
}

#[tokio::test]
async fn test_forced_run_replaces_key() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);

    let seed = FakeCa::new(&sandbox.webroot);
    sandbox
        .orchestrator(&["example.com"], false)
        .run(&seed, &publisher)
        .await
        .unwrap();
    let old_key = read(&sandbox, OutputKind::Key);

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = sandbox
        .orchestrator(&["example.com"], true)
        .run(&ca, &publisher)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.reason, RenewalReason::Forced);
    assert_ne!(read(&sandbox, OutputKind::Key), old_key);
}

#[tokio::test]
async fn test_mismatched_key_is_repaired() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com"], false);

    let seed = FakeCa::new(&sandbox.webroot);
    orchestrator.run(&seed, &publisher).await.unwrap();

    // Simulate an interrupted install: new key, old certificate
    let stray = KeyMaterial::generate().unwrap().into_pem();
    std::fs::write(sandbox.installer().path_for("web", OutputKind::Key), stray).unwrap();

    let decision = orchestrator.decide();
    assert_eq!(decision.reason, RenewalReason::Missing);
    assert!(decision.existing.is_none());

    let ca = FakeCa::new(&sandbox.webroot);
    assert!(orchestrator.run(&ca, &publisher).await.unwrap().changed);

    let key = KeyMaterial::from_pem(&read(&sandbox, OutputKind::Key)).unwrap();
    let cert = inspect(&sandbox.installer().path_for("web", OutputKind::Certificate)).unwrap();
    assert_eq!(key.public_key_der(), cert.public_key);
    assert_eq!(orchestrator.decide().reason, RenewalReason::Current);
}

#[tokio::test]
async fn test_interrupted_install_is_reissued() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);

    let seed = FakeCa::new(&sandbox.webroot);
    sandbox
        .orchestrator(&["example.com"], false)
        .run(&seed, &publisher)
        .await
        .unwrap();

    // Block the chain so a forced reinstall stops part way
    let chain_path = sandbox.installer().path_for("web", OutputKind::Chain);
    std::fs::remove_file(&chain_path).unwrap();
    std::fs::create_dir(&chain_path).unwrap();

    let ca = FakeCa::new(&sandbox.webroot);
    let err = sandbox
        .orchestrator(&["example.com"], true)
        .run(&ca, &publisher)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "install");
    std::fs::remove_dir(&chain_path).unwrap();

    let orchestrator = sandbox.orchestrator(&["example.com"], false);
    assert_eq!(orchestrator.decide().reason, RenewalReason::Missing);

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = orchestrator.run(&ca, &publisher).await.unwrap();
    assert!(outcome.changed);
    assert!(ca.calls() > 0);

    let key = KeyMaterial::from_pem(&read(&sandbox, OutputKind::Key)).unwrap();
    let full_chain = read(&sandbox, OutputKind::FullChain);
    let full_chain_leaf = parse_certificate_pem(full_chain.as_bytes()).unwrap();
    assert_eq!(full_chain_leaf.public_key, key.public_key_der());
    assert_eq!(
        full_chain,
        format!(
            "{}{}",
            read(&sandbox, OutputKind::Certificate),
            read(&sandbox, OutputKind::Chain)
        )
    );
}

#[tokio::test]
async fn test_stale_full_chain_triggers_issuance() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["example.com"], false);

    let seed = FakeCa::new(&sandbox.webroot);
    orchestrator.run(&seed, &publisher).await.unwrap();

    let other = Sandbox::new();
    let other_ca = FakeCa::new(&other.webroot);
    other
        .orchestrator(&["example.com"], false)
        .run(&other_ca, &WebrootPublisher::new(&other.webroot))
        .await
        .unwrap();
    std::fs::write(
        sandbox.installer().path_for("web", OutputKind::FullChain),
        read(&other, OutputKind::FullChain),
    )
    .unwrap();

    let decision = orchestrator.decide();
    assert_eq!(decision.reason, RenewalReason::Missing);
    assert!(decision.existing.is_none());
}

#[tokio::test]
async fn test_ip_and_trailing_dot_names_are_issued() {
    let sandbox = Sandbox::new();
    let publisher = WebrootPublisher::new(&sandbox.webroot);
    let orchestrator = sandbox.orchestrator(&["www.example.com.", "2001:0DB8:0::1"], false);

    let ca = FakeCa::new(&sandbox.webroot);
    let outcome = orchestrator.run(&ca, &publisher).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(ca.validated(), names(&["2001:db8::1", "www.example.com"]));

    let installed =
        inspect(&sandbox.installer().path_for("web", OutputKind::Certificate)).unwrap();
    assert_eq!(installed.sans, names(&["2001:db8::1", "www.example.com"]));

    let again = FakeCa::new(&sandbox.webroot);
    assert!(!orchestrator.run(&again, &publisher).await.unwrap().changed);
    assert_eq!(again.calls(), 0);
}
