use tandem_callcontrol::server::Server;
use tracing::error;

#[tokio::main]
async fn main() {
    tandem_log::init();
    if let Err(e) = Server::run().await {
        error!("call control stopped: {e:#}");
    }
}
