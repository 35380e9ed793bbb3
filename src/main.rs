#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gatc::bootstrapper::run().await
}
