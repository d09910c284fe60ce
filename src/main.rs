use fleet_vm_manager::{cli, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run().await
}
