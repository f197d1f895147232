use clap::Parser;
use pfs_config::ServerList;
use pfs_fileserver::{ChunkStore, FileServerService};
use pfs_proto::v1::file_service_server::FileServiceServer;
use tonic::transport::Server;
use tracing::info;

/// File service for the parallel file system: stores one server's share of
/// every file's chunks.
#[derive(Parser, Debug)]
struct Args {
    /// Address-list file shared with the metaserver; line 0 is the
    /// metaserver, lines 1..N are file servers in stripe-index order.
    #[arg(long)]
    server_list: String,

    /// This server's position among the file servers (0-based).
    #[arg(long)]
    index: u32,

    /// Directory chunk files are stored under.
    #[arg(long, default_value = "./files")]
    data_dir: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("pfs_fileserver=info,tonic=warn")
        .init();

    let args = Args::parse();
    let servers = ServerList::from_file(&args.server_list)?;
    let my_addr = servers
        .fileserver(args.index)
        .ok_or_else(|| format!("no file server at index {}", args.index))?;
    let addr = pfs_config::bind_addr(my_addr)?;

    let service = FileServerService::new(ChunkStore::new(&args.data_dir), args.index);

    info!(%addr, index = args.index, data_dir = %args.data_dir, "starting fileserver");
    Server::builder()
        .add_service(FileServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
