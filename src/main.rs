use anyhow::Context as _;
use preventa_sync::{config, diagnostics, events::OrderEvents, storage};
use serde_json::json;

const USAGE: &str = "expected --version, --health, --provision <connection-string> or --forget";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = config::resolve_data_dir();
    let mut args = std::env::args().skip(1);

    match args.next().as_deref() {
        Some("--version") => {
            println!("{}", serde_json::to_string_pretty(&diagnostics::get_about_info())?);
            Ok(())
        }
        Some("--health") => {
            let (db, config) = preventa_sync::open(&data_dir)?;
            let engine = preventa_sync::build_engine(db, &config, OrderEvents::new())?;
            let health =
                diagnostics::get_system_health(&engine).context("failed to collect health")?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Some("--provision") => {
            let raw = args
                .next()
                .with_context(|| format!("--provision needs a connection string ({USAGE})"))?;
            let connection =
                storage::provision(&raw).context("failed to provision device credentials")?;
            let stored = json!({
                "apiUrl": connection.url,
                "hasToken": connection.key.is_some(),
                "vendorId": connection.vendor_id,
            });
            println!("{}", serde_json::to_string_pretty(&stored)?);
            Ok(())
        }
        Some("--forget") => {
            storage::clear_credentials().context("failed to delete device credentials")?;
            println!("device credentials deleted");
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown argument: {other} ({USAGE})"),
        None => {
            let _guard = preventa_sync::init_logging(&diagnostics::log_dir(&data_dir));
            preventa_sync::run(data_dir).await
        }
    }
}
