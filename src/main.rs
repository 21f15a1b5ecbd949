use anyhow::Result;

use pongsrv::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::from_env();
    pongsrv::serve(config).await
}
