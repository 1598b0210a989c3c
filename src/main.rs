#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    convoy_cli::run().await
}
