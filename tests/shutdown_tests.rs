use std::time::Duration;

use bsp_node::shutdown::install_shutdown_handler;

#[tokio::test]
async fn test_sigterm_cancels_token() {
    let token = install_shutdown_handler().unwrap();
    assert!(!token.is_cancelled());

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(std::process::id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("SIGTERM should cancel the shutdown token");
}
