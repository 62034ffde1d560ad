use std::env;

use library::{EngineConfig, Library};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut roots: Vec<String> = env::args().skip(1).collect();
    if roots.is_empty() {
        roots = env::var("SCAN_ROOTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|root| !root.is_empty())
            .map(str::to_string)
            .collect();
    }
    if roots.is_empty() {
        return Err("no root URLs given (args or SCAN_ROOTS)".into());
    }

    let library = Library::new(EngineConfig::default())?;
    let summary = library.scan(roots).await?;
    let stats = library.get_stats();

    println!(
        "Scanned {} files ({} found): {} artists, {} albums, {} tracks",
        summary.files_scanned, summary.tracks_found, stats.artists, stats.albums, stats.tracks
    );

    Ok(())
}
