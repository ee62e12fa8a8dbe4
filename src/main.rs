use anyhow::{bail, Context, Error};
use clap::Parser;

use slicerq::backend::{Backends, Slic3r};
use slicerq::db::DbHandle;
use slicerq::server::{Server, ServerConfig};
use slicerq::{telemetry, JobRecord, Mesh, Status};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Slice mesh files into G-code")]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "database_url",
        env = "SLICERQ_DATABASE_URL",
        help = "SQLite database URL",
        default_value = "sqlite://slicerq.db"
    )]
    database_url: String,

    #[arg(
        short = 'n',
        long = "workers",
        env = "SLICERQ_WORKERS",
        help = "Number of backend processes run in parallel",
        default_value = "3"
    )]
    workers: u16,

    #[arg(
        long = "data_dir",
        env = "SLICERQ_DATA_DIR",
        help = "Directory for meshes and generated G-code",
        default_value = "data"
    )]
    data_dir: PathBuf,

    #[arg(
        long = "base_url",
        env = "SLICERQ_BASE_URL",
        help = "Public URL prefix for jobs and G-code",
        default_value = "http://localhost:8888/slicer"
    )]
    base_url: String,

    #[arg(
        long = "slic3r",
        env = "SLICERQ_SLIC3R_BIN",
        help = "Path to the slic3r binary",
        default_value = "slic3r"
    )]
    slic3r_bin: PathBuf,

    #[arg(
        long = "preset_dir",
        env = "SLICERQ_PRESET_DIR",
        help = "Directory of slic3r .ini presets",
        default_value = "presets"
    )]
    preset_dir: PathBuf,

    #[arg(short = 'p', long = "preset", help = "Preset to slice with", default_value = "hiQ")]
    preset: String,

    #[arg(
        long = "job_timeout",
        env = "SLICERQ_JOB_TIMEOUT",
        help = "Kill a backend after this many seconds"
    )]
    job_timeout: Option<u64>,

    #[arg(
        long = "poll_interval",
        env = "SLICERQ_POLL_INTERVAL",
        help = "Milliseconds between status checks",
        default_value = "100"
    )]
    poll_interval: u64,

    #[arg(
        long = "jaeger_endpoint",
        env = "SLICERQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    jaeger_endpoint: Option<String>,

    #[arg(
        short = 'o',
        long = "output_dir",
        help = "Where to write G-code; stdout when omitted"
    )]
    output_dir: Option<PathBuf>,

    #[arg(required = true, help = "Mesh files (.stl, .amf) or http(s) URLs")]
    meshes: Vec<String>,
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let mut backends = Backends::new();
    backends.register(
        Slic3r::new(&config.slic3r_bin)
            .load_presets(&config.preset_dir)
            .with_context(|| format!("loading presets from {}", config.preset_dir.display()))?,
    );

    let store = DbHandle::new(&config.database_url).await?;
    let server = Server::start(
        store,
        backends,
        ServerConfig {
            data_dir: config.data_dir.clone(),
            base_url: config.base_url.clone(),
            workers: config.workers,
            job_timeout: config.job_timeout.map(Duration::from_secs),
        },
    )
    .await?;

    let mut jobs = vec![];
    for mesh in &config.meshes {
        match server
            .submit(Mesh::Reference(mesh.clone()), "slic3r", &config.preset)
            .await
        {
            Ok(job) => {
                info!(job_id = %job.id, mesh = %mesh, "Submitted");
                jobs.push(job);
            }
            Err(err) => error!(mesh = %mesh, error = %err, "Rejected"),
        }
    }

    let mut failed = 0;
    for job in jobs {
        let done = poll(&server, &job, &config, &cancel_token).await?;
        println!("{}", serde_json::to_string(&done)?);
        if done.status != Status::Complete {
            failed += 1;
            continue;
        }
        write_result(&server, &done, config.output_dir.as_ref()).await?;
    }

    println!("Waiting for server to shutdown...");
    server.shutdown().await?;

    if failed > 0 {
        bail!("{failed} job(s) did not complete");
    }
    Ok(())
}

/// Checks the job at a fixed interval until it is terminal. Ctrl-C cancels
/// the job and keeps polling until the cancellation lands.
async fn poll(
    server: &Server,
    job: &JobRecord,
    config: &ConfigContext,
    cancel_token: &CancellationToken,
) -> Result<JobRecord, Error> {
    let mut tick = tokio::time::interval(Duration::from_millis(config.poll_interval));
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled(), if !cancelled => {
                warn!(job_id = %job.id, "Cancelling");
                server.cancel(job.id).await?;
                cancelled = true;
            },
            _ = tick.tick() => {
                let current = server.status(job.id).await?;
                debug!(job_id = %job.id, status = %current.status, progress = current.progress);
                if current.status.is_terminal() {
                    return Ok(current);
                }
            }
        }
    }
}

async fn write_result(
    server: &Server,
    job: &JobRecord,
    output_dir: Option<&PathBuf>,
) -> Result<(), Error> {
    let mut gcode = server.result(job.id).await?;
    match output_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            let dest = dir.join(format!("{}.gcode", job.id));
            let mut file = tokio::fs::File::create(&dest).await?;
            tokio::io::copy(&mut gcode, &mut file).await?;
            info!(job_id = %job.id, dest = %dest.display(), "Wrote G-code");
        }
        None => {
            tokio::io::copy(&mut gcode, &mut tokio::io::stdout()).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "slicerq=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    let result = app.await?;
    println!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
