use clap::Parser;

use fsv_app::{AppSettings, Cli, Session};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let command = Cli::parse().command();

    fsv_observability::init();

    let settings = AppSettings::from_env()?;
    let session = Session::open(&settings).await?;

    let output = fsv_app::run(&session, command).await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
