#![cfg(unix)]

use std::sync::{Arc, Mutex};

use admin_ipc::{send_request, AdminRequest, AdminResponse, AdminStatus};
use anyhow::anyhow;
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn status_and_snapshot_flow() {
    let dir = tempfile::tempdir().expect("temp dir");
    let socket_path = dir.path().join("admin.sock");
    let socket_str = socket_path
        .to_str()
        .expect("socket path should be utf-8")
        .to_string();

    let latest = Arc::new(Mutex::new(None::<serde_json::Value>));
    let handler_latest = Arc::clone(&latest);

    let server_socket = socket_str.clone();
    let server_task = tokio::spawn(async move {
        admin_ipc::run_server(&server_socket, move |req| {
            let latest = handler_latest
                .lock()
                .map_err(|_| anyhow!("state poisoned"))?;

            match req {
                AdminRequest::Status => Ok(AdminResponse::Status(AdminStatus {
                    run_id: "run-123".to_string(),
                    builds: 4,
                    failures: 1,
                    last_status: latest
                        .as_ref()
                        .and_then(|snap| snap.get("status"))
                        .and_then(|status| status.as_str())
                        .map(str::to_string),
                })),
                AdminRequest::Snapshot => Ok(AdminResponse::Snapshot(latest.clone())),
            }
        })
        .await
    });

    // Allow the server task to start listening.
    sleep(Duration::from_millis(50)).await;

    let empty = send_request(&socket_str, &AdminRequest::Snapshot)
        .await
        .expect("snapshot before any build");
    match empty {
        AdminResponse::Snapshot(value) => assert!(value.is_none()),
        _ => panic!("expected snapshot response"),
    }

    let status = send_request(&socket_str, &AdminRequest::Status)
        .await
        .expect("status before any build");
    match status {
        AdminResponse::Status(AdminStatus {
            run_id,
            builds,
            failures,
            last_status,
        }) => {
            assert_eq!(run_id, "run-123");
            assert_eq!(builds, 4);
            assert_eq!(failures, 1);
            assert!(last_status.is_none());
        }
        _ => panic!("expected status response"),
    }

    *latest.lock().expect("state lock") = Some(serde_json::json!({
        "status": "Contributing",
        "total_funds": "850.0",
    }));

    let filled = send_request(&socket_str, &AdminRequest::Snapshot)
        .await
        .expect("snapshot after build");
    match filled {
        AdminResponse::Snapshot(Some(value)) => {
            assert_eq!(value["status"], "Contributing");
        }
        _ => panic!("expected populated snapshot"),
    }

    let status = send_request(&socket_str, &AdminRequest::Status)
        .await
        .expect("status after build");
    match status {
        AdminResponse::Status(AdminStatus { last_status, .. }) => {
            assert_eq!(last_status.as_deref(), Some("Contributing"));
        }
        _ => panic!("expected status response after build"),
    }

    server_task.abort();

    // Cleanup the socket file explicitly for extra safety.
    let _ = std::fs::remove_file(socket_path);
}
