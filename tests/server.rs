//! End-to-end job lifecycle tests against a real store and worker pool.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use common::{finished, wait_for, Fixture};
use slicerq::{Error, JobRecord, Mesh, Status};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_runs_to_completion() {
    let f = Fixture::new().await;
    let server = f.server(2).await;

    let job = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "hiQ")
        .await
        .unwrap();
    assert_eq!(job.status, Status::Accepted);
    assert_eq!(job.progress, 0.0);
    assert_eq!(job.url, format!("http://localhost:8888/slicer/jobs/{}", job.id));

    let done = finished(&server, job.id).await;
    assert_eq!(done.status, Status::Complete);
    assert_eq!(done.progress, 1.0);
    assert_eq!(
        done.output_url,
        Some(format!("http://localhost:8888/slicer/gcodes/{}", job.id))
    );

    let mut gcode = String::new();
    server
        .result(job.id)
        .await
        .unwrap()
        .read_to_string(&mut gcode)
        .await
        .unwrap();
    assert_eq!(gcode, "solid cube\nendsolid cube\n");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn uploaded_bytes_are_staged() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    let job = server
        .submit(
            Mesh::Bytes {
                name: "Part.STL".into(),
                data: b"solid part\nendsolid part\n".to_vec(),
            },
            "slic3r",
            "hiQ",
        )
        .await
        .unwrap();
    let staged = f
        .dir
        .path()
        .join("data")
        .join("meshes")
        .join(format!("{}.stl", job.id));
    assert!(staged.is_file());

    let done = finished(&server, job.id).await;
    assert_eq!(done.status, Status::Complete);

    server.remove(job.id).await.unwrap();
    assert!(!staged.exists());
    assert!(!f
        .dir
        .path()
        .join("data/gcode")
        .join(format!("{}.gcode", job.id))
        .exists());
    assert_matches!(server.status(job.id).await, Err(Error::NotFound(_)));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_submissions_create_nothing() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    assert_matches!(
        server.submit(Mesh::Reference(f.mesh_ref()), "slic3r", "").await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server.submit(Mesh::Reference(f.mesh_ref()), "cura", "hiQ").await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server.submit(Mesh::Reference(f.mesh_ref()), "slic3r", "ultra").await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server
            .submit(Mesh::Reference("/no/such/cube.stl".into()), "slic3r", "hiQ")
            .await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server
            .submit(
                Mesh::Reference("https://example.com/download?file=cube.stl".into()),
                "slic3r",
                "hiQ"
            )
            .await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server
            .submit(
                Mesh::Bytes {
                    name: "notes.txt".into(),
                    data: b"hello".to_vec(),
                },
                "slic3r",
                "hiQ"
            )
            .await,
        Err(Error::Validation(_))
    );
    assert_matches!(
        server
            .submit(
                Mesh::Bytes {
                    name: "cube.stl".into(),
                    data: vec![],
                },
                "slic3r",
                "hiQ"
            )
            .await,
        Err(Error::Validation(_))
    );

    for status in [Status::Accepted, Status::Processing, Status::Failed] {
        assert!(f.store.list_by_status(status).await.unwrap().is_empty());
    }
    assert_eq!(server.queue_depth(), 0);
    assert_matches!(server.status(Uuid::new_v4()).await, Err(Error::NotFound(_)));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_dequeue() {
    let f = Fixture::new().await;
    let server = f.server(1).await;
    let mut updates = server.subscribe();

    let busy = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "slow")
        .await
        .unwrap();
    wait_for(&server, busy.id, Status::Processing).await;

    let queued = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "hiQ")
        .await
        .unwrap();
    assert_eq!(server.queue_depth(), 1);
    server.cancel(queued.id).await.unwrap();
    assert_eq!(server.queue_depth(), 0);

    let done = finished(&server, queued.id).await;
    assert_eq!(done.status, Status::Cancelled);

    server.cancel(busy.id).await.unwrap();
    finished(&server, busy.id).await;

    while let Ok(update) = updates.try_recv() {
        if update.id == queued.id {
            assert_ne!(update.status, Status::Processing);
        }
    }

    // Cancelling again is a no-op.
    server.cancel(queued.id).await.unwrap();
    assert_eq!(
        server.status(queued.id).await.unwrap().status,
        Status::Cancelled
    );

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_execution_kills_backend() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    let job = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "slow")
        .await
        .unwrap();
    wait_for(&server, job.id, Status::Processing).await;
    // Give the shell time to exec into sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.cancel(job.id).await.unwrap();
    let done = finished(&server, job.id).await;
    assert_eq!(done.status, Status::Cancelled);
    assert!(done.output_url.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_matches!(
        server.result(job.id).await,
        Err(Error::NotReady {
            status: Status::Cancelled,
            ..
        })
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn backend_failure_is_recorded() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    let job = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "fail")
        .await
        .unwrap();
    let done = finished(&server, job.id).await;
    assert_eq!(done.status, Status::Failed);
    assert_eq!(done.error_detail.as_deref(), Some("non-manifold mesh"));
    assert_matches!(server.result(job.id).await, Err(Error::NotReady { .. }));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_runs_jobs_in_submission_order() {
    let f = Fixture::new().await;
    let server = std::sync::Arc::new(f.server(1).await);
    let mut updates = server.subscribe();

    let first = {
        let server = server.clone();
        let mesh = f.mesh_ref();
        tokio::spawn(async move { server.submit(Mesh::Reference(mesh), "slic3r", "hiQ").await })
            .await
            .unwrap()
            .unwrap()
    };
    let second = {
        let server = server.clone();
        let mesh = f.mesh_ref();
        tokio::spawn(async move { server.submit(Mesh::Reference(mesh), "slic3r", "hiQ").await })
            .await
            .unwrap()
            .unwrap()
    };

    let mut started = Vec::new();
    let mut terminal: HashMap<Uuid, usize> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while terminal.len() < 2 {
            let update: JobRecord = updates.recv().await.unwrap();
            match update.status {
                Status::Processing if !started.contains(&update.id) => started.push(update.id),
                status if status.is_terminal() => *terminal.entry(update.id).or_default() += 1,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(started, vec![first.id, second.id]);
    assert_eq!(terminal.get(&first.id), Some(&1));
    assert_eq!(terminal.get(&second.id), Some(&1));

    let server = std::sync::Arc::into_inner(server).unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_fails_interrupted_and_requeues_accepted() {
    let f = Fixture::new().await;

    let mut interrupted = JobRecord::new(
        Uuid::new_v4(),
        "http://localhost:8888/slicer/jobs/a".into(),
        f.mesh_ref(),
        "slic3r".into(),
        "hiQ".into(),
    );
    interrupted.begin().unwrap();
    let waiting = JobRecord::new(
        Uuid::new_v4(),
        "http://localhost:8888/slicer/jobs/b".into(),
        f.mesh_ref(),
        "slic3r".into(),
        "hiQ".into(),
    );
    f.store.put(&interrupted).await.unwrap();
    f.store.put(&waiting).await.unwrap();

    let server = f.server(1).await;

    let failed = server.status(interrupted.id).await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.error_detail.as_deref(), Some("interrupted by restart"));

    let done = finished(&server, waiting.id).await;
    assert_eq!(done.status, Status::Complete);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn remove_refuses_active_jobs() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    let job = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "slow")
        .await
        .unwrap();
    assert_matches!(server.remove(job.id).await, Err(Error::NotReady { .. }));

    server.cancel(job.id).await.unwrap();
    finished(&server, job.id).await;
    server.remove(job.id).await.unwrap();
    assert_matches!(server.cancel(job.id).await, Err(Error::NotFound(_)));
    // Mesh given by reference belongs to the caller.
    assert!(f.mesh.is_file());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_keeps_queued_jobs_for_next_start() {
    let f = Fixture::new().await;
    let server = f.server(1).await;

    let busy = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "slow")
        .await
        .unwrap();
    wait_for(&server, busy.id, Status::Processing).await;
    let queued = server
        .submit(Mesh::Reference(f.mesh_ref()), "slic3r", "hiQ")
        .await
        .unwrap();

    server.cancel(busy.id).await.unwrap();
    finished(&server, busy.id).await;
    // The worker may or may not have picked up the second job yet.
    server.shutdown().await.unwrap();

    let status = f.store.get(queued.id).await.unwrap().status;
    assert!(matches!(status, Status::Accepted | Status::Complete));

    let server = f.server(1).await;
    let done = finished(&server, queued.id).await;
    assert_eq!(done.status, Status::Complete);
    server.shutdown().await.unwrap();
}
