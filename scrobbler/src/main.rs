#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ytmusic_scrobbler::run().await
}
