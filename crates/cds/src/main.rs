//! Command-line harness (spec.md §6): given a base directory and a list of
//! files, ingests each file into a data store rooted at that directory and
//! prints the resulting item id, one per line.
//!
//! Passing `--listen <addr>` turns on the peer-to-peer overlay: the process
//! binds a transport, registers the network index and network device
//! responders, and (optionally, via `--join`) joins an existing peer before
//! ingesting. Without `--listen` the harness runs purely local-device mode.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cds_device::{Device, LocalDevice};
use cds_device_net::NetworkDevice;
use cds_gateway::{Gateway, GatewayOptions};
use cds_index::{Index, IndexOptions};
use cds_index_net::IndexNet;
use cds_store::DataStore;
use cds_swarm::{Peer, Swarm};
use cds_transport::{ContentProvider, Transport, TransportOptions};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Directory the store keeps its index, device content, peer roster, and
    /// spool under.
    base_dir: PathBuf,

    /// Files to ingest.
    files: Vec<PathBuf>,

    /// Datagram address to listen on for the peer transport. Enables the
    /// peer-to-peer overlay; omit to run single-process, local-device only.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// An existing peer to join, formatted `<peer-id>@<address>:<port>`.
    /// Requires --listen.
    #[arg(long)]
    join: Option<String>,

    /// Attempt uPnP port forwarding for the transport's HTTP content server.
    /// Requires --listen.
    #[arg(long)]
    gateway: bool,
}

/// Serves the local device's bytes over the HTTP content side-channel
/// (spec.md §6).
struct DeviceContentProvider(Arc<LocalDevice>);

#[async_trait]
impl ContentProvider for DeviceContentProvider {
    async fn fetch(&self, _target: &str, item: &str) -> std::result::Result<bytes::Bytes, String> {
        let mut reader = self.0.get(item).await.map_err(|e| e.to_string())?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.map_err(|e| e.to_string())?;
        Ok(bytes::Bytes::from(buf))
    }
}

fn parse_join(s: &str) -> anyhow::Result<Peer> {
    let (id, rest) = s
        .split_once('@')
        .context("expected <peer-id>@<address>:<port>")?;
    let (address, port) = rest
        .rsplit_once(':')
        .context("expected <peer-id>@<address>:<port>")?;
    Ok(Peer::new(
        id.parse().context("peer id is not a uuid")?,
        address.to_string(),
        port.parse().context("port is not a valid u16")?,
    ))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    match run(opts).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let index = Index::open(opts.base_dir.join("index"), IndexOptions::default())
        .await
        .context("opening index")?;
    let local_device = Arc::new(LocalDevice::new(opts.base_dir.join("device")));

    let mut devices: Vec<(String, Arc<dyn Device>)> =
        vec![("local".to_string(), local_device.clone() as Arc<dyn Device>)];
    let mut index_net = None;

    if let Some(listen) = opts.listen {
        let swarm = Arc::new(Swarm::open(&opts.base_dir).await.context("opening peer roster")?);
        let local_id = match swarm.get_local_node().await {
            Ok(peer) => peer.id,
            Err(_) => Uuid::new_v4(),
        };

        // Resolve the gateway's external address, if any, before the local
        // node is registered, so peers never learn a bind address they can't
        // route to (see the design notes on local-peer address ordering).
        let mut advertise_ip = listen.ip().to_string();
        let gateway = if opts.gateway {
            let gw = Gateway::new(GatewayOptions::default());
            match gw.ready().await {
                Ok(()) => match gw.get_external_address().await {
                    Ok(ip) => {
                        advertise_ip = ip.to_string();
                        Some(gw)
                    }
                    Err(e) => {
                        warn!("could not resolve external address, advertising bind address: {e:#}");
                        Some(gw)
                    }
                },
                Err(e) => {
                    warn!("uPnP discovery failed, continuing without port forwarding: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        swarm
            .update_local_node(Peer::new(local_id, advertise_ip, listen.port()))
            .await
            .context("writing local node record")?;

        let provider: Arc<dyn ContentProvider> = Arc::new(DeviceContentProvider(local_device.clone()));
        let transport = Transport::bind(
            listen,
            local_id.to_string(),
            TransportOptions::default(),
            provider,
            gateway.as_ref(),
        )
        .await
        .context("binding peer transport")?;

        let net_index = IndexNet::new(index.clone(), swarm.clone(), transport.channel.clone(), local_id.to_string());
        net_index.register_handlers();

        let network_device = NetworkDevice::new(
            local_device.clone(),
            net_index.clone(),
            swarm.clone(),
            transport.channel.clone(),
            local_id.to_string(),
            transport.http.local_addr.port(),
        );
        network_device.register_handlers();

        if let Some(join) = &opts.join {
            let peer = parse_join(join).context("parsing --join")?;
            info!(peer = %peer.id, "joining peer");
            net_index.join(peer).await.context("joining peer")?;
        }

        info!(%local_id, %listen, "peer transport listening");
        devices.push(("network".to_string(), network_device as Arc<dyn Device>));
        index_net = Some(net_index);
    } else if opts.join.is_some() || opts.gateway {
        anyhow::bail!("--join and --gateway require --listen");
    }

    let store = DataStore::new(devices, index, index_net, opts.base_dir.join("tmp"));

    let mut had_error = false;
    for path in &opts.files {
        match ingest(&store, path).await {
            Ok(item) => println!("{}\t{}", item.id, path.display()),
            Err(e) => {
                error!(file = %path.display(), "{e:#}");
                had_error = true;
            }
        }
    }

    store.close().await.context("flushing index")?;

    if had_error {
        anyhow::bail!("one or more files failed to ingest");
    }
    Ok(())
}

async fn ingest(store: &DataStore, path: &std::path::Path) -> anyhow::Result<cds_store::Item> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {path:?}"))?;
    let metadata = serde_json::json!({
        "filename": path.file_name().and_then(|n| n.to_str()),
    });
    store
        .save(file, None, metadata)
        .await
        .with_context(|| format!("ingesting {path:?}"))
}
