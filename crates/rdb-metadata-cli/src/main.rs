//! Print the contents of a metadata file as JSON.
//!
//! Usage:
//!
//! ```text
//! rdb-metadata cluster <path>
//! rdb-metadata auth <path>
//! ```
//!
//! Opening a file written by an older release migrates it to the current
//! format, exactly as a server start would.

use std::io::{self, Write};
use std::path::PathBuf;

use eyre::{WrapErr, bail};
use rdb_metadata::{
    AuthPersistentFile, BranchHistory, ClusterMetadata, ClusterPersistentFile, MetadataConfig,
    PersistentFile, ServerId,
};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
struct ClusterReport {
    server_id: ServerId,
    metadata: ClusterMetadata,
    branch_history: BranchHistory,
}

fn usage() -> eyre::Report {
    eyre::eyre!("usage: rdb-metadata <cluster|auth> <path>")
}

fn write_json(value: &impl Serialize) -> eyre::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rdb_metadata=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (command, path) = match args.as_slice() {
        [_, command, path] => (command.as_str(), PathBuf::from(path)),
        _ => return Err(usage()),
    };
    let config = MetadataConfig::from_env();
    info!("inspecting {} ({:?})", path.display(), config);

    match command {
        "cluster" => {
            let file = ClusterPersistentFile::open_existing(&path, &config)
                .wrap_err_with(|| format!("failed to open {}", path.display()))?;
            let history = file.branch_history_manager();
            let report = ClusterReport {
                server_id: file.read_server_id(),
                metadata: file.read_metadata()?,
                branch_history: history.export_branch_history(history.known_branches()),
            };
            write_json(&report)
        }
        "auth" => {
            let file = AuthPersistentFile::open_existing(&path, &config)
                .wrap_err_with(|| format!("failed to open {}", path.display()))?;
            write_json(&file.read_metadata()?)
        }
        other => bail!("unknown command {other:?}; {}", usage()),
    }
}
