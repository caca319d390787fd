use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use taskherd::bag::ConfigBag;
use taskherd::driver::{Driver, DriverRegistry, ExecDriver, ProgressSender, EXEC_DRIVER};
use taskherd::error::DriverError;
use taskherd::scheduler::Job;

fn exec_job(config: ConfigBag) -> Job {
    Job::new("exec-test", EXEC_DRIVER, config)
}

/// Run a job to completion and collect the lines it reported.
async fn run_job(driver: &ExecDriver, job: &Job) -> (Result<(), DriverError>, Vec<String>) {
    let (progress, mut updates) = ProgressSender::channel();
    let result = driver.run(job, progress).await;

    let mut lines = Vec::new();
    while let Ok(update) = updates.try_recv() {
        assert_eq!(update.progress, 0.0);
        lines.push(update.message);
    }
    (result, lines)
}

fn sh(script: &str) -> ConfigBag {
    ConfigBag::new()
        .with("cmd", "/bin/sh")
        .with("args", json!(["-c", script]))
}

#[tokio::test]
async fn test_execute_simple_command() {
    let driver = ExecDriver::new();
    let job = exec_job(ConfigBag::new().with("cmd", "echo").with("args", json!(["hello"])));

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert_eq!(lines, vec!["STDOUT >> hello"]);
    assert!(!driver.is_running(&job.id));
}

#[tokio::test]
async fn test_execute_empty_output() {
    let driver = ExecDriver::new();
    let (result, lines) = run_job(&driver, &exec_job(ConfigBag::new().with("cmd", "true"))).await;

    assert!(result.is_ok());
    assert!(lines.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let driver = ExecDriver::new();
    let job = exec_job(ConfigBag::new().with("cmd", "seq").with("args", json!(["1", "1000"])));

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert_eq!(lines.len(), 1000);
    assert_eq!(lines[0], "STDOUT >> 1");
    assert_eq!(lines[999], "STDOUT >> 1000");
}

#[tokio::test]
async fn test_execute_command_failure() {
    let driver = ExecDriver::new();
    let (result, _) = run_job(&driver, &exec_job(sh("exit 3"))).await;

    match result {
        Err(DriverError::ExitStatus(status)) => assert!(status.contains('3'), "{status}"),
        other => panic!("expected exit status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let driver = ExecDriver::new();
    let (result, lines) = run_job(&driver, &exec_job(sh("echo 'error message' >&2; exit 1"))).await;

    assert!(matches!(result, Err(DriverError::ExitStatus(_))));
    assert_eq!(lines, vec!["STDERR >> error message"]);
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let driver = ExecDriver::new();
    let job = exec_job(ConfigBag::new().with("cmd", "nonexistent_command_12345"));

    let (result, _) = run_job(&driver, &job).await;

    assert!(matches!(result, Err(DriverError::Spawn(_))));
    assert!(!driver.is_running(&job.id));
}

#[tokio::test]
async fn test_execute_missing_cmd() {
    let driver = ExecDriver::new();
    let (result, _) = run_job(&driver, &exec_job(ConfigBag::new().with("dir", "/tmp"))).await;
    assert!(matches!(result, Err(DriverError::MissingConfig("cmd"))));
}

#[tokio::test]
async fn test_execute_arguments_are_not_shell_expanded() {
    let driver = ExecDriver::new();
    let job = exec_job(
        ConfigBag::new()
            .with("cmd", "echo")
            .with("args", json!(["hello $USER", "*"])),
    );

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert_eq!(lines, vec!["STDOUT >> hello $USER *"]);
}

#[tokio::test]
async fn test_execute_in_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let driver = ExecDriver::new();
    let job = exec_job(
        ConfigBag::new()
            .with("cmd", "ls")
            .with("dir", dir.path().to_string_lossy().to_string()),
    );

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert_eq!(lines, vec!["STDOUT >> marker.txt"]);
}

#[tokio::test]
async fn test_execute_with_clean_environment() {
    let driver = ExecDriver::new();
    let job = exec_job(
        ConfigBag::new()
            .with("cmd", "/usr/bin/env")
            .with("env", json!(["GREETING=hi"])),
    );

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert_eq!(lines, vec!["STDOUT >> GREETING=hi"]);
}

#[tokio::test]
async fn test_execute_with_inherited_environment() {
    let driver = ExecDriver::new();
    let job = exec_job(
        ConfigBag::new()
            .with("cmd", "/usr/bin/env")
            .with("env", json!(["GREETING=hi"]))
            .with("inherit_env", true),
    );

    let (result, lines) = run_job(&driver, &job).await;

    assert!(result.is_ok());
    assert!(lines.contains(&"STDOUT >> GREETING=hi".to_string()));
    assert!(lines.iter().any(|line| line.starts_with("STDOUT >> PATH=")));
}

#[tokio::test]
async fn test_cancel_running_process() {
    let driver = Arc::new(ExecDriver::new());
    let job = exec_job(ConfigBag::new().with("cmd", "sleep").with("args", json!(["30"])));

    let handle = {
        let driver = driver.clone();
        let job = job.clone();
        tokio::spawn(async move {
            let (progress, _updates) = ProgressSender::channel();
            driver.run(&job, progress).await
        })
    };

    for _ in 0..200 {
        if driver.is_running(&job.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // the pid is recorded right after spawn
    tokio::time::sleep(Duration::from_millis(100)).await;
    driver.cancel(&job).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("process did not stop")
        .unwrap();
    assert!(matches!(result, Err(DriverError::Interrupted(_))));
    assert!(!driver.is_running(&job.id));
}

#[tokio::test]
async fn test_cancel_job_that_is_not_running() {
    let driver = ExecDriver::new();
    let job = exec_job(ConfigBag::new().with("cmd", "true"));
    assert!(matches!(
        driver.cancel(&job).await,
        Err(DriverError::NotRunning(id)) if id == job.id
    ));
}

#[tokio::test]
async fn test_registry_lookup() {
    let registry = DriverRegistry::with_defaults();
    assert!(registry.contains(EXEC_DRIVER));
    assert_eq!(registry.names(), vec![EXEC_DRIVER.to_string()]);
    assert_eq!(registry.get(EXEC_DRIVER).unwrap().name(), EXEC_DRIVER);
    assert!(matches!(
        registry.get("docker"),
        Err(DriverError::UnknownDriver(name)) if name == "docker"
    ));
}
