//! Container sandbox tests.
//!
//! These need a running Docker daemon and a local `alpine` image, so they
//! are ignored by default: `cargo test -- --ignored` runs them.

use tempfile::TempDir;

use tutorial_runner::sandbox::{CommandSpec, ContainerSandbox, Sandbox};
use tutorial_runner::{Document, Engine, Error, RunnerConfig, SandboxKind};

fn container_config(base: &TempDir, isolated: bool) -> RunnerConfig {
    let mut config = RunnerConfig::default()
        .with_workspace_dir(base.path())
        .with_sandbox(SandboxKind::Container);
    config.container.image = "alpine:3".to_string();
    config.container.isolated = isolated;
    config
}

#[tokio::test]
#[ignore] // Requires docker
async fn bound_container_shares_files_with_host() {
    let base = TempDir::new().unwrap();
    let mut sandbox = ContainerSandbox::new(&container_config(&base, false), "bound");
    sandbox.initialize().await.expect("container should start");

    let out = sandbox
        .run(&CommandSpec::new("echo out; echo err >&2; echo made > made.txt").with_working_dir("sub"))
        .await
        .unwrap();
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout, "out\n");
    assert_eq!(out.stderr, "err\n");

    let host_file = sandbox.host_path().join("sub/made.txt");
    assert_eq!(std::fs::read_to_string(host_file).unwrap(), "made\n");

    sandbox.cleanup(false).await;
    assert!(!sandbox.host_path().exists());
}

#[tokio::test]
#[ignore] // Requires docker
async fn isolated_container_round_trips_files_through_exec() {
    let base = TempDir::new().unwrap();
    let mut sandbox = ContainerSandbox::new(&container_config(&base, true), "isolated");
    sandbox.initialize().await.expect("container should start");

    let content = "quotes ' \" and $dollars\nsecond line";
    sandbox.write_file("deep/dir/file.txt", content).await.unwrap();
    assert!(sandbox.file_exists("deep/dir/file.txt").await.unwrap());
    assert_eq!(sandbox.read_file("deep/dir/file.txt").await.unwrap(), content);
    assert!(!sandbox.host_path().join("deep").exists());

    sandbox.cleanup(true).await;
    let copied = sandbox.host_path().join("deep/dir/file.txt");
    assert_eq!(std::fs::read_to_string(copied).unwrap(), content);
}

#[tokio::test]
#[ignore] // Requires docker
async fn engine_runs_a_document_in_a_container() {
    let base = TempDir::new().unwrap();
    let document = Document::parse(
        r#"
steps:
  - { id: mk, ordinal: 1, type: run, command: "mkdir -p app" }
  - { id: cd, ordinal: 2, type: run, command: "cd app" }
  - { id: where, ordinal: 3, type: run, command: "pwd > where.txt" }
  - id: check
    ordinal: 4
    type: check
    check: { type: file-state, path: app/where.txt, equals: "/workspace/app\n" }
"#,
    )
    .unwrap();

    let result = Engine::new(container_config(&base, false))
        .execute(&document)
        .await
        .expect("run should not abort");
    assert!(result.is_complete(), "{:?}", result.failed_step());
}

#[tokio::test]
#[ignore] // Requires docker
async fn missing_image_reports_build_command() {
    let base = TempDir::new().unwrap();
    let mut config = container_config(&base, false);
    config.container.image = "tutorial-runner-definitely-missing:latest".to_string();

    let mut sandbox = ContainerSandbox::new(&config, "missing-image");
    let err = sandbox.initialize().await.unwrap_err();
    sandbox.cleanup(false).await;

    match err {
        Error::ImageMissing { remediation, .. } => {
            assert!(remediation.starts_with("docker build -t tutorial-runner-definitely-missing:latest"));
        }
        other => panic!("expected ImageMissing, got {:?}", other),
    }
}
