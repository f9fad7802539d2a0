//! End-to-end runs: launch a shell child, let it write into the run directory, shut down,
//! and check what reached the remote store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use runsync::context::RunContext;
use runsync::coordinator::{RunEnvironment, RunManager, ShutdownReport};
use runsync::core::lifecycle::{ResumeMode, RunLifecycleState};
use runsync::core::policy::{PolicyKind, SavePolicy};
use runsync::core::wire::WireMessage;
use runsync::error::SyncError;
use runsync::exit_codes;
use runsync::io::config::SyncConfig;
use runsync::io::run_state::load_run_state;
use runsync::io::store::{MirrorStore, RemoteStore, ResumeStatus};
use runsync::io::wire_channel::{WireClient, WireServer};
use runsync::test_support::{RecordingStore, fast_config};

struct Harness {
    temp: tempfile::TempDir,
    manager: RunManager,
}

fn harness(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(RunContext::new(
        "run1",
        "me",
        "proj",
        &temp.path().join("run"),
    ));
    let manager = RunManager::new(ctx, store, config).expect("manager");
    Harness {
        temp,
        manager,
    }
}

/// Run `script` under `sh -c` to completion and shut down.
fn run_script(manager: &mut RunManager, script: &str) -> ShutdownReport {
    manager
        .init_run(&RunEnvironment::default())
        .expect("init run");
    manager
        .run_user_process("sh", &["-c".to_string(), script.to_string()])
        .expect("launch");
    let code = manager
        .await_completion(&AtomicBool::new(false))
        .expect("await");
    manager.shutdown(code)
}

fn first_seq(lines: &BTreeMap<u64, String>) -> Option<u64> {
    lines.keys().next().copied()
}

#[test]
fn full_run_streams_uploads_and_verifies() {
    let store = Arc::new(RecordingStore::new());
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    let report = run_script(
        &mut h.manager,
        r#"echo hello from the run
printf '{"_step": 0, "loss": 1.0}\n{"_step": 1, "loss": 0.5}\n' >> "$RUNSYNC_DIR/history.jsonl"
echo weights > "$RUNSYNC_DIR/weights.bin"
echo '{"loss": 0.5, "_runtime": 3}' > "$RUNSYNC_DIR/summary.json"
"#,
    );

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.state, RunLifecycleState::Finished);
    assert!(report.synced(), "{}", report.render());
    assert!(report.verified_files >= 4);
    assert_eq!(
        report.summary,
        vec![("loss".to_string(), "0.5".to_string())]
    );

    let uploaded = store.uploaded_names();
    for name in ["weights.bin", "summary.json", "metadata.json", "output.log"] {
        assert!(uploaded.iter().any(|n| n == name), "{name} not uploaded: {uploaded:?}");
    }
    assert_eq!(store.uploads_of("weights.bin"), vec![b"weights\n".to_vec()]);

    let history = store.resolved_lines("history.jsonl");
    assert_eq!(history.len(), 2);
    assert_eq!(first_seq(&history), Some(1));
    assert!(store.completion("history.jsonl").is_some());

    let console = store.resolved_lines("output.log");
    assert!(console.values().next().is_some_and(|line| line.starts_with("sh -c")));
    assert!(console.values().any(|line| line.contains("hello from the run")));
    let done = store.completion("output.log").expect("console completion");
    assert_eq!(done.exit_code, Some(0));

    assert!(!h.manager.queue().is_alive());
    for file in h.manager.watched() {
        assert_eq!(file.finish_calls, 1, "{} finished more than once", file.logical_name);
    }

    let state = load_run_state(&h.manager.ctx().paths.run_state_path).expect("run state");
    assert_eq!(state.state, RunLifecycleState::Finished);
    assert_eq!(state.exit_code, Some(0));
    assert!(state.sync_errors.is_empty());
}

#[test]
fn exit_codes_become_terminal_states() {
    for (script, code, state) in [
        ("exit 0", exit_codes::OK, RunLifecycleState::Finished),
        ("exit 3", 3, RunLifecycleState::Failed),
        ("kill -TERM $$", exit_codes::KILLED, RunLifecycleState::Killed),
    ] {
        let store = Arc::new(RecordingStore::new());
        let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
        let report = run_script(&mut h.manager, script);
        assert_eq!(report.exit_code, code, "{script}");
        assert_eq!(report.state, state, "{script}");
        let meta = fs::read_to_string(h.manager.ctx().path_of("metadata.json")).expect("metadata");
        assert!(meta.contains(&format!("\"exitcode\": {code}")), "{meta}");
    }
}

#[test]
fn resumed_run_continues_streams_after_remote_lines() {
    let status = ResumeStatus {
        storage_id: "remote-7".to_string(),
        history_tail: vec![r#"{"_step": 14, "loss": 0.9}"#.to_string()],
        history_line_count: 15,
        log_line_count: 4,
        summary: Some(serde_json::json!({"loss": 0.9})),
        ..ResumeStatus::default()
    };
    let store = Arc::new(RecordingStore::new().with_resume("run1", status));
    let mut config = fast_config();
    config.resume.mode = ResumeMode::Must;
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, config);

    let outcome = h
        .manager
        .init_run(&RunEnvironment::default())
        .expect("resume");
    assert!(outcome.resumed);
    assert_eq!(outcome.storage_id, "remote-7");
    assert_eq!(outcome.starting_step, 14);
    assert_eq!(store.upserts()[0].storage_id.as_deref(), Some("remote-7"));

    let history_path = h.manager.ctx().path_of("history.jsonl");
    assert_eq!(
        fs::read_to_string(&history_path).expect("seeded tail"),
        "{\"_step\": 14, \"loss\": 0.9}\n"
    );
    assert!(h.manager.ctx().path_of("summary.json").exists());

    h.manager
        .run_user_process(
            "sh",
            &[
                "-c".to_string(),
                r#"printf '{"_step": 15}\n{"_step": 16}\n' >> "$RUNSYNC_DIR/history.jsonl""#
                    .to_string(),
            ],
        )
        .expect("launch");
    let code = h
        .manager
        .await_completion(&AtomicBool::new(false))
        .expect("await");
    let report = h.manager.shutdown(code);
    assert!(report.synced(), "{}", report.render());

    let history = store.resolved_lines("history.jsonl");
    assert_eq!(
        history.into_iter().collect::<Vec<_>>(),
        vec![
            (16, "{\"_step\": 15}".to_string()),
            (17, "{\"_step\": 16}".to_string()),
        ]
    );
    assert_eq!(first_seq(&store.resolved_lines("output.log")), Some(5));
}

#[test]
fn attached_run_ends_with_the_code_sent_over_the_wire() {
    let store = Arc::new(RecordingStore::new());
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    h.manager
        .init_run(&RunEnvironment::default())
        .expect("init run");

    let mut child = Command::new("sleep")
        .arg("30")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn sleeper");
    let captured = h.temp.path().join("captured.log");
    fs::write(&captured, "hello from the attached process\n").expect("write capture");
    let stdout: Box<dyn Read + Send> = Box::new(File::open(&captured).expect("open capture"));

    let mut server = WireServer::bind().expect("bind");
    let client = WireClient::connect(server.port().expect("port")).expect("connect");
    let foreground = thread::spawn(move || {
        let first = server.listen(Duration::from_secs(5));
        server
            .send(
                WireMessage::Done { exit_code: Some(3) },
                Duration::from_secs(5),
            )
            .expect("send done");
        first
    });

    h.manager
        .attach_to_existing_process(child.id(), Some(stdout), None, Some(client))
        .expect("attach");
    let code = h
        .manager
        .await_completion(&AtomicBool::new(false))
        .expect("await");
    assert_eq!(foreground.join().expect("foreground"), Some(WireMessage::Ready));
    assert_eq!(code, 3);

    let report = h.manager.shutdown(code);
    let _ = child.kill();
    let _ = child.wait();
    assert_eq!(report.state, RunLifecycleState::Failed);
    assert!(report.synced(), "{}", report.render());
    let console = store.resolved_lines("output.log");
    assert!(
        console
            .values()
            .any(|line| line.contains("hello from the attached process")),
        "{console:?}"
    );
    let state = load_run_state(&h.manager.ctx().paths.run_state_path).expect("run state");
    assert_eq!(state.exit_code, Some(3));
}

#[test]
fn interrupt_stops_the_user_process_as_killed() {
    for script in ["exec sleep 30", "trap '' TERM; exec sleep 30"] {
        let store = Arc::new(RecordingStore::new());
        let mut config = fast_config();
        config.process.kill_grace_secs = 1;
        let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, config);
        h.manager
            .init_run(&RunEnvironment::default())
            .expect("init run");
        h.manager
            .run_user_process("sh", &["-c".to_string(), script.to_string()])
            .expect("launch");

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::Release);
        });
        let started = Instant::now();
        let code = h.manager.await_completion(&interrupt).expect("await");
        trigger.join().expect("trigger");
        assert_eq!(code, exit_codes::KILLED, "{script}");
        assert!(started.elapsed() < Duration::from_secs(10), "{script}");

        let report = h.manager.shutdown(code);
        assert_eq!(report.state, RunLifecycleState::Killed, "{script}");
        let meta = fs::read_to_string(h.manager.ctx().path_of("metadata.json")).expect("metadata");
        assert!(meta.contains("\"exitcode\": 255"), "{meta}");
        let state = load_run_state(&h.manager.ctx().paths.run_state_path).expect("run state");
        assert_eq!(state.state, RunLifecycleState::Killed);
    }
}

#[test]
fn renamed_checkpoint_is_uploaded_under_its_final_name() {
    let store = Arc::new(RecordingStore::new());
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    let report = run_script(
        &mut h.manager,
        r#"echo weights > "$RUNSYNC_DIR/ckpt_part.bin"
sleep 0.5
mv "$RUNSYNC_DIR/ckpt_part.bin" "$RUNSYNC_DIR/ckpt_final.bin"
sleep 0.5
"#,
    );
    assert!(report.synced(), "{}", report.render());
    assert!(store.uploads_of("ckpt_part.bin").is_empty());
    assert_eq!(store.uploads_of("ckpt_final.bin"), vec![b"weights\n".to_vec()]);
    let names: Vec<_> = h
        .manager
        .watched()
        .into_iter()
        .map(|file| file.logical_name)
        .collect();
    assert!(names.contains(&"ckpt_final.bin".to_string()), "{names:?}");
    assert!(!names.contains(&"ckpt_part.bin".to_string()), "{names:?}");
}

#[test]
fn must_mode_without_remote_run_is_a_conflict() {
    let store = Arc::new(RecordingStore::new());
    let mut config = fast_config();
    config.resume.mode = ResumeMode::Must;
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, config);
    let err = h
        .manager
        .init_run(&RunEnvironment::default())
        .expect_err("no run to resume");
    assert!(matches!(err, SyncError::ResumeConflict { .. }), "{err}");
    assert!(store.upserts().is_empty());
}

#[test]
fn digest_mismatch_fails_the_sync() {
    let store = Arc::new(RecordingStore::new());
    store.corrupt_digest("weights.bin");
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    let report = run_script(&mut h.manager, r#"echo w > "$RUNSYNC_DIR/weights.bin""#);

    assert_eq!(report.exit_code, 0);
    assert!(!report.synced());
    assert!(report.errors.iter().any(|err| matches!(
        err,
        SyncError::VerificationMismatch { name, .. } if name == "weights.bin"
    )));
    assert!(report.render().contains("sync failed"));
    let state = load_run_state(&h.manager.ctx().paths.run_state_path).expect("run state");
    assert_eq!(state.state, RunLifecycleState::Finished);
    assert_eq!(state.sync_errors.len(), report.errors.len());
}

#[test]
fn throttled_checkpoint_keeps_one_handler() {
    let store = Arc::new(RecordingStore::new());
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    h.manager
        .register_save_policy("ckpt_*.txt", SavePolicy::Throttled)
        .expect("register");
    let report = run_script(
        &mut h.manager,
        r#"for i in 1 2 3; do echo "epoch $i" > "$RUNSYNC_DIR/ckpt_0.txt"; sleep 0.1; done"#,
    );
    assert!(report.synced(), "{}", report.render());

    let ckpt: Vec<_> = h
        .manager
        .watched()
        .into_iter()
        .filter(|file| file.logical_name == "ckpt_0.txt")
        .collect();
    assert_eq!(ckpt.len(), 1);
    assert_eq!(ckpt[0].policy, PolicyKind::Throttled);
    assert_eq!(ckpt[0].finish_calls, 1);

    let uploads = store.uploads_of("ckpt_0.txt");
    assert!(!uploads.is_empty());
    assert_eq!(uploads.last(), Some(&b"epoch 3\n".to_vec()));
}

#[test]
fn control_file_save_policy_applies_to_later_files() {
    let store = Arc::new(RecordingStore::new());
    let mut h = harness(Arc::clone(&store) as Arc<dyn RemoteStore>, fast_config());
    let report = run_script(
        &mut h.manager,
        r#"mkdir -p "$RUNSYNC_DIR/.runsync"
echo '{"glob": "*.pt", "policy": "live"}' >> "$RUNSYNC_DIR/.runsync/save_policy.jsonl"
sleep 0.5
echo model > "$RUNSYNC_DIR/model.pt"
sleep 0.5
"#,
    );
    assert!(report.synced(), "{}", report.render());
    assert_eq!(
        h.manager.dispatcher().policy_of("model.pt"),
        Some(PolicyKind::Immediate)
    );
    assert!(!store.uploads_of("model.pt").is_empty());
    assert!(
        h.manager
            .watched()
            .iter()
            .all(|file| !file.logical_name.starts_with(".runsync"))
    );
}

#[test]
fn mirror_store_holds_the_finished_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mirror_root = temp.path().join("mirror");
    let store: Arc<dyn RemoteStore> = Arc::new(MirrorStore::new(&mirror_root));
    let mut h = harness(store, fast_config());
    let report = run_script(
        &mut h.manager,
        r#"echo '{"_step": 0}' >> "$RUNSYNC_DIR/history.jsonl"
echo data > "$RUNSYNC_DIR/table.csv"
"#,
    );
    assert!(report.synced(), "{}", report.render());

    let run = mirror_root.join("proj").join("run1");
    assert!(run.join("run.json").is_file());
    assert_eq!(
        fs::read_to_string(run.join("files").join("table.csv")).expect("mirrored file"),
        "data\n"
    );
    assert!(run.join("streams").join("history.jsonl.jsonl").is_file());
    assert!(mirrored_names(&run.join("files")).contains(&"metadata.json".to_string()));
}

fn mirrored_names(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .expect("files dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}
