#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamchat_lib::run().await
}
