//! TailscaleDaemon against shell-script stand-ins for the two binaries.
//!
//! Everything runs in one test: writing an executable while another test
//! thread forks can fail with ETXTBSY.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tailgate_common::state::JoinCredential;
use tailgate_node::daemon::{DaemonError, DaemonSpec, NetworkDaemon, RestartPolicy, TailscaleDaemon};
use tailgate_node::local_api::LocalApiClient;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn daemon(dir: &Path, tailscaled: PathBuf, tailscale: PathBuf) -> TailscaleDaemon {
    let spec = DaemonSpec {
        tailscaled_bin: tailscaled,
        tailscale_bin: tailscale,
        socket_path: dir.join("ts.sock"),
        state_file: dir.join("ts.state"),
        tun_mode: "userspace-networking".to_string(),
        hostname: "grafana-server".to_string(),
    };
    TailscaleDaemon::new(
        spec,
        LocalApiClient::new(dir.join("ts.sock"), Duration::from_millis(200)),
        RestartPolicy::with_max_restarts(0),
    )
}

#[tokio::test]
async fn test_tailscale_daemon_commands() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path();
    let args_log = root.join("args.log");

    let tailscaled = write_script(
        root,
        "tailscaled",
        &format!("echo \"$@\" > {}\nexec sleep 30", root.join("daemon.args").display()),
    );
    let tailscale_ok = write_script(
        root,
        "tailscale",
        &format!(
            "echo \"$@\" > {}\nprintf S2 > {}",
            args_log.display(),
            root.join("ts.state").display()
        ),
    );
    let tailscale_bad = write_script(
        root,
        "tailscale-bad",
        "echo \"backend error: invalid key $7\" >&2\nexit 1",
    );

    // ── start + probe + shutdown ───────────────────────────────────────
    let ok = daemon(root, tailscaled.clone(), tailscale_ok);
    let handle = ok.start().await.unwrap();

    let mut daemon_args = String::new();
    for _ in 0..100 {
        if let Ok(s) = std::fs::read_to_string(root.join("daemon.args")) {
            if !s.is_empty() {
                daemon_args = s;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        daemon_args.trim(),
        format!(
            "--socket {} --state {} --tun userspace-networking",
            root.join("ts.sock").display(),
            root.join("ts.state").display()
        )
    );

    // No control socket is served by the stand-in.
    assert!(matches!(ok.probe().await, Err(DaemonError::LocalApi(_))));

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .unwrap();

    // ── successful join ────────────────────────────────────────────────
    let key = JoinCredential::new("tskey-auth-xyz").unwrap();
    ok.join(Some(&key)).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&args_log).unwrap().trim(),
        format!(
            "--socket {} up --hostname grafana-server --authkey tskey-auth-xyz",
            root.join("ts.sock").display()
        )
    );
    assert_eq!(std::fs::read(root.join("ts.state")).unwrap(), b"S2");

    // ── failed join, key redacted ──────────────────────────────────────
    let bad = daemon(root, tailscaled, tailscale_bad);
    match bad.join(Some(&key)).await.unwrap_err() {
        DaemonError::JoinFailed { stderr, .. } => {
            assert!(stderr.contains("backend error: invalid key"));
            assert!(stderr.contains("[REDACTED]"));
            assert!(!stderr.contains("tskey-auth-xyz"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // ── missing binary ─────────────────────────────────────────────────
    let missing = daemon(root, root.join("nope"), root.join("nope"));
    assert!(matches!(
        missing.start().await,
        Err(DaemonError::Spawn { .. })
    ));
}
