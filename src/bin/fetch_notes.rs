//! Print the titles of the notes the API currently lists.

use anyhow::Result;
use dotenvy::dotenv;
use peernotez::client::NotesClient;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let client = NotesClient::from_env();
    tracing::info!(api_url = client.api_url(), "fetching notes");
    for note in client.fetch_notes().await? {
        println!("{}\t{}", note.id, note.title);
    }

    Ok(())
}
