use std::io;

use log::{info, warn};
use tokio::{net::TcpListener, signal};

use model_host::{builder::HostBuilder, config::HostConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = HostConfig::from_env()?;
    let addr = config.addr();
    let mut host = HostBuilder::new(config).build()?;

    let list = TcpListener::bind(&addr).await?;
    info!("listening at {addr}");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = list.accept() => accepted?,
            _ = signal::ctrl_c() => {
                info!("received SIGTERM");
                break;
            }
        };

        info!("peer connected from {peer}");
        let (rx, tx) = stream.into_split();

        tokio::select! {
            ret = host.serve(rx, tx) => {
                if let Err(e) = ret {
                    warn!("connection with {peer} failed: {e}");
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGTERM");
                break;
            }
        }
    }

    Ok(())
}
