#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deadline_reminders_lib::run().await
}
