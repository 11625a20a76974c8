mod common;

use std::path::PathBuf;

use common::{config, write_playbook, CANDIDATE, TARGET};
use promoter_backends::RegistryPromoter;
use promoter_core::fakes::{sample_hash, StaticResolver};
use promoter_core::{ArtifactPromoter, Backend, PromoterError};

fn vars_path(workdir: &std::path::Path) -> PathBuf {
    PathBuf::from(
        std::fs::read_to_string(workdir.join("vars-path"))
            .expect("vars path recorded")
            .trim(),
    )
}

#[tokio::test]
async fn playbook_receives_extra_vars_and_file_is_removed() {
    let work = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let script = write_playbook(
        work.path(),
        r"printf '\033[0;32mok: [localhost] => retagged\033[0m\n'",
        0,
    );
    let promoter = RegistryPromoter::new(
        config(work.path(), &script, images.path(), 30),
        StaticResolver::new(&["base", "nova-api"]),
    );
    let hash = sample_hash(3);

    let outcome = promoter
        .promote(&hash, TARGET, CANDIDATE, true)
        .await
        .expect("promotion");

    assert_eq!(outcome.backend, Backend::Registry);
    assert!(outcome.detail.contains("2 containers"));

    let vars: serde_yaml::Value = serde_yaml::from_str(
        &std::fs::read_to_string(work.path().join("captured-vars.yaml")).unwrap(),
    )
    .unwrap();
    assert_eq!(vars["named_label"].as_str(), Some(TARGET));
    assert_eq!(vars["candidate_label"].as_str(), Some(CANDIDATE));
    assert_eq!(vars["full_hash"].as_str(), Some(hash.full_hash().as_str()));
    assert_eq!(vars["commit_hash"].as_str(), Some(hash.commit_hash()));
    assert_eq!(vars["source_namespace"].as_str(), Some("tripleomaster"));
    assert_eq!(vars["containers_list"][1].as_str(), Some("nova-api"));
    assert_eq!(vars["release"].as_str(), Some("master"));

    assert!(!vars_path(work.path()).exists());

    let logs: Vec<_> = std::fs::read_dir(work.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let log = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(log.contains("ok: [localhost] => retagged"));
    assert!(!log.contains('\x1b'));
}

#[tokio::test]
async fn failing_playbook_is_a_promotion_error_with_log_tail() {
    let work = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let script = write_playbook(
        work.path(),
        "echo 'TASK [push containers] fatal: unauthorized: authentication required'",
        2,
    );
    let promoter = RegistryPromoter::new(
        config(work.path(), &script, images.path(), 30),
        StaticResolver::new(&["base"]),
    );

    let err = promoter
        .promote(&sample_hash(3), TARGET, CANDIDATE, true)
        .await
        .unwrap_err();

    match err {
        PromoterError::Promotion(message) => {
            assert!(message.contains("exit code 2"));
            assert!(message.contains("fatal: unauthorized"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!vars_path(work.path()).exists());
}

#[tokio::test]
async fn hung_playbook_times_out() {
    let work = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let script = write_playbook(work.path(), "sleep 10", 0);
    let promoter = RegistryPromoter::new(
        config(work.path(), &script, images.path(), 1),
        StaticResolver::new(&["base"]),
    );

    let err = promoter
        .promote(&sample_hash(3), TARGET, CANDIDATE, true)
        .await
        .unwrap_err();

    assert!(matches!(err, PromoterError::Promotion(m) if m.contains("timed out")));
}
