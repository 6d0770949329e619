use clap::Parser;
use huddle::config::ServerConfig;
use huddle::signaling::SignalingServer;
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::parse();
    let bind_addr = config.bind_addr();

    println!("   Huddle Signaling Server");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::new(&config);

    tokio::select! {
        result = server.run(&bind_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, {} rooms open", server.directory().room_count());
            Ok(())
        }
    }
}
