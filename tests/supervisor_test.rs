use std::time::Duration;

use orchestrate::supervisor::{self, LaunchSpec, ShellWorkerBackend, WorkerBackend, WorkerProcess};

fn spec(dir: &std::path::Path, command: &str) -> LaunchSpec {
    LaunchSpec {
        task_id: "t1".to_string(),
        command: command.to_string(),
        workdir: dir.to_path_buf(),
        log_path: dir.join("logs/t1.log"),
    }
}

async fn wait_for_exit<P: WorkerProcess>(process: &mut P) -> i32 {
    for _ in 0..200 {
        if let Some(code) = process.poll() {
            return code;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("worker did not exit");
}

#[tokio::test]
async fn worker_output_is_captured_in_the_task_log() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ShellWorkerBackend;

    let mut process = backend
        .start(&spec(dir.path(), "echo out-line; echo err-line >&2"))
        .unwrap();
    let code = wait_for_exit(&mut process).await;
    assert_eq!(code, 0);

    let log = std::fs::read_to_string(dir.path().join("logs/t1.log")).unwrap();
    assert!(log.contains("out-line"));
    assert!(log.contains("err-line"), "stderr must share the log: {}", log);
}

#[tokio::test]
async fn exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ShellWorkerBackend;

    let mut process = backend.start(&spec(dir.path(), "exit 7")).unwrap();
    assert_eq!(wait_for_exit(&mut process).await, 7);
    // poll stays idempotent after the exit was observed
    assert_eq!(process.poll(), Some(7));
}

#[tokio::test]
async fn worker_runs_in_its_workdir() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ShellWorkerBackend;

    let mut process = backend
        .start(&spec(dir.path(), "pwd > where.txt"))
        .unwrap();
    wait_for_exit(&mut process).await;

    let recorded = std::fs::read_to_string(dir.path().join("where.txt")).unwrap();
    let recorded = std::path::Path::new(recorded.trim()).canonicalize().unwrap();
    assert_eq!(recorded, dir.path().canonicalize().unwrap());
}

#[tokio::test]
async fn terminate_kills_the_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ShellWorkerBackend;

    // The sleep is a child of the sh wrapper; group-targeted signals must
    // reach it too.
    let mut process = backend
        .start(&spec(dir.path(), "sleep 300 & sleep 300"))
        .unwrap();
    assert!(process.poll().is_none());

    let code = supervisor::terminate(&mut process, Duration::from_secs(5)).await;
    assert_eq!(code, 128 + 15);
}

#[tokio::test]
async fn launch_failure_reports_the_task() {
    let backend = ShellWorkerBackend;
    let spec = LaunchSpec {
        task_id: "t1".to_string(),
        command: "true".to_string(),
        workdir: std::path::PathBuf::from("/nonexistent-workdir-xyz"),
        log_path: std::env::temp_dir().join("orchestrate-launch-failure.log"),
    };

    let mut process = match backend.start(&spec) {
        // Spawn may fail eagerly or on first poll depending on platform.
        Err(e) => {
            assert!(e.to_string().contains("t1"));
            return;
        }
        Ok(process) => process,
    };
    let code = wait_for_exit(&mut process).await;
    assert_ne!(code, 0);
}
