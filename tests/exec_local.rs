//! Standalone executions against the local backend.

#![cfg(unix)]

mod common;

use std::future::IntoFuture;
use std::time::Duration;

use common::{count_lines, CaptureSink};
use futures_util::StreamExt;
use unishell::{
    ExecOptions, ExecutionState, LocalConfig, OutputSource, PipeSinks, Unishell, UnishellError,
};

// ============================================================================
// Await / details / reject
// ============================================================================

#[tokio::test]
async fn test_await_yields_trimmed_output() {
    let client = Unishell::local_default();
    let out = client.exec("printf '  hello world \\n\\n'").await.unwrap();
    assert_eq!(out, "hello world");
}

#[tokio::test]
async fn test_details_output_matches_trimmed_value() {
    let client = Unishell::local_default();
    let exec = client.exec("echo first; echo second >&2");
    let trimmed = exec.clone().await.unwrap();
    let details = exec.details().await.unwrap();

    assert_eq!(details.code, 0);
    assert!(!details.killed);
    assert_eq!(details.stdout, b"first\n");
    assert_eq!(details.stderr, b"second\n");
    assert_eq!(details.output_string().trim(), trimmed);
    assert_eq!(details.cmd, "echo first; echo second >&2");
}

#[tokio::test]
async fn test_non_zero_exit_resolves_normally() {
    let client = Unishell::local_default();
    let out = client.exec("echo partial; exit 3").await.unwrap();
    assert_eq!(out, "partial");

    let details = client.exec("exit 3").details().await.unwrap();
    assert_eq!(details.code, 3);
    assert!(details.failed());
}

#[tokio::test]
async fn test_reject_carries_exit_code_and_output() {
    let client = Unishell::local_default();
    let err = client
        .exec("echo boom >&2; exit 7")
        .reject()
        .await
        .unwrap_err();

    let rejection = err.as_rejection().expect("rejection error");
    assert_eq!(rejection.code(), 7);
    assert_eq!(rejection.message, "boom\n");
    assert_eq!(rejection.result.stderr, b"boom\n");
}

#[tokio::test]
async fn test_reject_and_details_compose_either_way() {
    let client = Unishell::local_default();
    let exec = client.exec("exit 2");

    let a = exec.reject().details().await.unwrap_err();
    let b = exec.details().reject().await.unwrap_err();
    assert_eq!(a.as_rejection().unwrap().code(), 2);
    assert_eq!(b.as_rejection().unwrap().code(), 2);
}

#[tokio::test]
async fn test_reject_passes_success_through() {
    let client = Unishell::local_default();
    assert_eq!(client.exec("echo ok").reject().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_killed_process_is_reported() {
    let client = Unishell::local_default();
    let details = client.exec("kill -9 $$").details().await.unwrap();
    assert!(details.killed);
    assert_eq!(details.code, 128 + 9);

    let err = client.exec("kill -TERM $$").reject().await.unwrap_err();
    assert!(err.as_rejection().unwrap().killed());
}

#[tokio::test]
async fn test_single_invocation_per_exec() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("counter");
    let client = Unishell::local_default();

    let exec = client.exec(format!("echo x >> '{}'; exit 1", counter.display()));
    let _ = exec.details().await;
    let _ = exec.details().await;
    let _ = exec.reject().await;
    let _ = exec.reject().details().await;
    let _ = exec.clone().await;

    assert_eq!(count_lines(&counter), 1);
}

#[tokio::test]
async fn test_exec_is_eager() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let client = Unishell::local_default();

    let exec = client.exec(format!("touch '{}'", marker.display()));
    for _ in 0..100 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(marker.exists(), "command should run without being awaited");
    exec.await.unwrap();
}

// ============================================================================
// Pipe / stream
// ============================================================================

#[tokio::test]
async fn test_two_sinks_receive_identical_streams() {
    let client = Unishell::local_default();
    let a = CaptureSink::new();
    let b = CaptureSink::new();

    let exec = client
        .exec("for i in 1 2 3; do echo line$i; sleep 0.05; done")
        .pipe(PipeSinks::new().stdout(a.clone()))
        .pipe(PipeSinks::new().stdout(b.clone()));
    let details = exec.details().await.unwrap();

    assert_eq!(a.text(), "line1\nline2\nline3\n");
    assert_eq!(a.bytes(), b.bytes());
    assert_eq!(details.stdout, a.bytes());
    assert!(a.is_shut_down());
    assert!(b.is_shut_down());
}

#[tokio::test]
async fn test_pipe_splits_streams_and_combines() {
    let client = Unishell::local_default();
    let out = CaptureSink::new();
    let err = CaptureSink::new();
    let all = CaptureSink::new();

    let details = client
        .exec("echo to-out; echo to-err >&2")
        .pipe(
            PipeSinks::new()
                .stdout(out.clone())
                .stderr(err.clone())
                .output(all.clone()),
        )
        .details()
        .await
        .unwrap();

    assert_eq!(out.text(), "to-out\n");
    assert_eq!(err.text(), "to-err\n");
    assert_eq!(all.bytes().len(), details.output.len());
    assert!(all.text().contains("to-out\n"));
    assert!(all.text().contains("to-err\n"));
}

#[tokio::test]
async fn test_stream_yields_chunks() {
    let client = Unishell::local_default();
    let exec = client.exec("echo a; echo b >&2");
    let stream = exec.stream();

    let details = exec.details().await.unwrap();
    let chunks: Vec<_> = stream.collect().await;

    let stdout: Vec<u8> = chunks
        .iter()
        .filter(|c| c.source == OutputSource::Stdout)
        .flat_map(|c| c.raw.clone())
        .collect();
    assert_eq!(stdout, details.stdout);
}

#[tokio::test]
async fn test_stdin_source_is_forwarded() {
    let client = Unishell::local_default();
    let out = client
        .exec("tr a-z A-Z")
        .pipe(PipeSinks::new().stdin(std::io::Cursor::new(b"shout\n".to_vec())))
        .await
        .unwrap();
    assert_eq!(out, "SHOUT");
}

#[tokio::test]
async fn test_unclaimed_stdin_is_closed_on_await() {
    let client = Unishell::local_default();
    let out = tokio::time::timeout(
        Duration::from_secs(5),
        client.exec("cat; echo done").into_future(),
    )
        .await
        .expect("cat should see EOF")
        .unwrap();
    assert_eq!(out, "done");
}

#[tokio::test]
async fn test_abandoned_handle_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");
    let client = Unishell::local_default();

    drop(client.exec(format!("cat >/dev/null; touch '{}'", marker.display())));
    for _ in 0..100 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(marker.exists(), "dropped handle should still see EOF on stdin");
}

#[tokio::test]
async fn test_stream_only_consumer_sees_end_of_run() {
    let client = Unishell::local_default();
    let stream = client.exec("cat; echo finished").stream();

    let chunks: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream should end once the handle is gone");
    let output: Vec<u8> = chunks.into_iter().flat_map(|c| c.raw).collect();
    assert_eq!(output, b"finished\n");
}

// ============================================================================
// Options and failures
// ============================================================================

#[tokio::test]
async fn test_exec_with_options() {
    let dir = tempfile::tempdir().unwrap();
    let client = Unishell::local_default();

    let out = client
        .exec_with(
            "echo \"$NAME\"; pwd",
            ExecOptions::new().cwd(dir.path()).env("NAME", "unishell"),
        )
        .await
        .unwrap();

    let cwd = dir.path().canonicalize().unwrap();
    assert_eq!(out, format!("unishell\n{}", cwd.display()));
}

#[tokio::test]
async fn test_spawn_error_on_bad_cwd() {
    let client = Unishell::local_with(LocalConfig::with_cwd("/definitely/not/a/dir"));
    let exec = client.exec("true");

    assert_eq!(exec.state(), ExecutionState::Failed);
    let err = exec.details().await.unwrap_err();
    assert!(matches!(err, UnishellError::Spawn { ref cmd, .. } if cmd == "true"));
}

#[tokio::test]
async fn test_missing_binary_is_a_result_not_an_error() {
    let client = Unishell::local_default();
    let details = client.exec("no-such-binary-here").details().await.unwrap();
    assert_eq!(details.code, 127);
}

#[tokio::test]
async fn test_independent_execs_run_concurrently() {
    let client = Unishell::local_default();
    let started = std::time::Instant::now();

    let a = client.exec("sleep 0.5; echo a");
    let b = client.exec("sleep 0.5; echo b");
    let (a, b) = tokio::join!(a.into_future(), b.into_future());

    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert!(started.elapsed() < Duration::from_millis(950));
}
