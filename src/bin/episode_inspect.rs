//! episode_inspect - print persisted violation episodes as JSON

use anyhow::{anyhow, Result};
use clap::Parser;

use zone_witness::{EpisodeStatus, PersistenceAdapter, SqliteEpisodeStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the episode database.
    #[arg(long, env = "ZONE_WITNESS_DB_PATH", default_value = "zone_witness.db")]
    db_path: String,
    /// Fetch one episode by id.
    #[arg(long)]
    id: Option<String>,
    /// Number of most recent episodes to list.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Only list episodes with this status (pending|recorded).
    #[arg(long)]
    status: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut store = SqliteEpisodeStore::open(&args.db_path)?;

    if let Some(id) = &args.id {
        let record = store
            .fetch(id)?
            .ok_or_else(|| anyhow!("no episode with id {}", id))?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let status = args.status.as_deref().map(EpisodeStatus::parse).transpose()?;
    let records: Vec<_> = store
        .list_recent(args.limit)?
        .into_iter()
        .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
        .collect();
    log::info!("{} episode(s) from {}", records.len(), args.db_path);
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
