use clap::Parser;
use pfs_config::{PfsConfig, ServerList};
use pfs_metaserver::MetaService;
use pfs_proto::v1::metadata_service_server::MetadataServiceServer;
use tonic::transport::Server;
use tracing::info;

/// Metadata service for the parallel file system.
#[derive(Parser, Debug)]
struct Args {
    /// Address-list file: line 0 is this service's own bind address, the
    /// rest are the file servers in stripe-index order.
    #[arg(long)]
    server_list: String,

    /// Block size in bytes; combined with `--stripe-blocks` gives the
    /// chunk size chunk boundaries are computed over.
    #[arg(long, default_value_t = pfs_config::BLOCK_SIZE)]
    block_size: u64,

    #[arg(long, default_value_t = pfs_config::STRIPE_BLOCKS)]
    stripe_blocks: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("pfs_metaserver=info,tonic=warn")
        .init();

    let args = Args::parse();
    let servers = ServerList::from_file(&args.server_list)?;

    let config = PfsConfig {
        block_size: args.block_size,
        stripe_blocks: args.stripe_blocks,
        ..PfsConfig::default()
    };

    let addr = pfs_config::bind_addr(servers.metaserver())?;
    let service = MetaService::new(config, servers.width());

    info!(%addr, width = servers.width(), "starting metaserver");
    Server::builder()
        .add_service(MetadataServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
