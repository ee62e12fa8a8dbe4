#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use slicerq::backend::{Backend, Backends, Invocation};
use slicerq::db::DbHandle;
use slicerq::server::{Server, ServerConfig};
use slicerq::{JobRecord, Status};
use tempfile::TempDir;
use uuid::Uuid;

/// Behaviour keyed by preset: `slow` sleeps until killed, `fail` exits 2,
/// anything else copies the mesh to the output.
const SCRIPT: &str = r#"
case "$3" in
  slow) exec sleep 30 ;;
  fail) echo "non-manifold mesh" >&2; exit 2 ;;
  *) echo "=> Generating perimeters"; cat "$1" > "$2" ;;
esac
"#;

pub const PRESETS: &[&str] = &["hiQ", "slow", "fail"];

/// Stands in for slic3r by running a shell script.
pub struct FakeSlicer;

impl Backend for FakeSlicer {
    fn name(&self) -> &str {
        "slic3r"
    }

    fn has_preset(&self, preset: &str) -> bool {
        PRESETS.contains(&preset)
    }

    fn invocation(&self, input: &Path, output: &Path, preset: &str) -> slicerq::Result<Invocation> {
        Ok(Invocation {
            program: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                SCRIPT.into(),
                "sh".into(),
                input.into(),
                output.into(),
                preset.into(),
            ],
        })
    }

    fn progress(&self, line: &str) -> Option<f64> {
        (line.trim() == "=> Generating perimeters").then_some(0.3)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub db_url: String,
    pub store: DbHandle,
    pub mesh: PathBuf,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = DbHandle::new(&db_url).await.unwrap();
        let mesh = dir.path().join("cube.stl");
        std::fs::write(&mesh, "solid cube\nendsolid cube\n").unwrap();
        Fixture {
            dir,
            db_url,
            store,
            mesh,
        }
    }

    pub fn config(&self, workers: u16) -> ServerConfig {
        ServerConfig {
            data_dir: self.dir.path().join("data"),
            base_url: "http://localhost:8888/slicer".into(),
            workers,
            job_timeout: Some(Duration::from_secs(20)),
        }
    }

    pub async fn server(&self, workers: u16) -> Server {
        let mut backends = Backends::new();
        backends.register(FakeSlicer);
        Server::start(self.store.clone(), backends, self.config(workers))
            .await
            .unwrap()
    }

    pub fn mesh_ref(&self) -> String {
        self.mesh.display().to_string()
    }
}

/// Polls until the job reaches `status` or five seconds pass.
pub async fn wait_for(server: &Server, id: Uuid, status: Status) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = server.status(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {status}"))
}

pub async fn finished(server: &Server, id: Uuid) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(10), server.wait(id))
        .await
        .unwrap_or_else(|_| panic!("job {id} never finished"))
        .unwrap()
}
