
use bsp_node::agent::bundle::{fetch_bundle, unpack_bundle, BUNDLE_FILE, WORK_DIR};
use bsp_node::agent::LocalBundleStore;
use bsp_node::error::BspError;
use test_harness::write_bundle;

#[tokio::test]
async fn test_fetch_copies_and_unpacks() {
    let dir = tempfile::tempdir().unwrap();
    let remote = write_bundle(
        dir.path(),
        "job.tar.gz",
        &[("bin/run.sh", "echo run\n"), ("conf/job.conf", "supersteps=10\n")],
    );
    let job_dir = dir.path().join("local/jobs/job_1");

    let work = fetch_bundle(&LocalBundleStore, &remote, &job_dir).await.unwrap();

    assert_eq!(work, job_dir.join(WORK_DIR));
    assert!(job_dir.join(BUNDLE_FILE).is_file());
    assert_eq!(
        std::fs::read_to_string(work.join("bin/run.sh")).unwrap(),
        "echo run\n"
    );
    assert_eq!(
        std::fs::read_to_string(work.join("conf/job.conf")).unwrap(),
        "supersteps=10\n"
    );
}

#[tokio::test]
async fn test_missing_remote_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let err = fetch_bundle(
        &LocalBundleStore,
        &dir.path().join("nope.tar.gz"),
        &dir.path().join("local/jobs/job_1"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BspError::Io(_)));
}

#[tokio::test]
async fn test_corrupt_archive_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("broken.tar.gz");
    std::fs::write(&archive, b"definitely not gzip").unwrap();

    let err = unpack_bundle(&archive, &dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, BspError::Io(_)));
}
