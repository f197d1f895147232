//! Manual connectivity check: pings the metadata service and every file
//! service named in a server list, and initializes a client session.

use clap::Parser;
use pfs_config::ServerList;
use pfs_proto::v1::file_service_client::FileServiceClient;
use pfs_proto::v1::metadata_service_client::MetadataServiceClient;
use pfs_proto::v1::{InitializeRequest, PingRequest};
use tonic::Request;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Address-list file: line 0 is the metaserver, lines 1..N are file
    /// servers in stripe-index order.
    #[arg(long)]
    server_list: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("pfsctl=info,tonic=warn")
        .init();

    let args = Args::parse();
    let servers = ServerList::from_file(&args.server_list)?;

    let mut meta = MetadataServiceClient::connect(servers.metaserver().to_string()).await?;
    meta.ping(Request::new(PingRequest {})).await?;
    let init = meta
        .initialize(Request::new(InitializeRequest {}))
        .await?
        .into_inner();
    info!(client_id = init.client_id, "metaserver reachable");

    for (index, addr) in servers.fileservers().iter().enumerate() {
        let mut client = FileServiceClient::connect(addr.clone()).await?;
        client.ping(Request::new(PingRequest {})).await?;
        info!(index, %addr, "fileserver reachable");
    }

    println!("all {} servers reachable", servers.fileservers().len() + 1);
    Ok(())
}
