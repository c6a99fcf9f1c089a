mod proxy;

use anyhow::bail;
use clap::ArgGroup;
use clap::Parser;
use log::info;
use proxy::Proxy;
use std::net::SocketAddr;
use std::time::Duration;

/// linkshark - rudp proxy that relays datagrams and logs each decoded header
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["listen", "bind"])))]
struct Args {
    /// Listen on port
    #[arg(group = "source", short, long)]
    listen: Option<u16>,

    /// Listen with specific bind address (ip:port)
    #[arg(group = "source", short, long)]
    bind: Option<SocketAddr>,

    /// Target server (address:port)
    #[arg(short, long, required = true)]
    target: SocketAddr,

    /// Verbosity level (up to -vvv)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // tokio::main makes rust-analyzer fragile,
    // so put the code in a separate place.
    real_main().await
}

async fn real_main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let bind_addr: SocketAddr = if let Some(listen_port) = args.listen {
        if args.target.is_ipv4() {
            format!("0.0.0.0:{}", listen_port).parse()?
        } else {
            format!("[::]:{}", listen_port).parse()?
        }
    } else if let Some(bind_addr) = args.bind {
        bind_addr
    } else {
        bail!("One of --listen or --bind must be specified");
    };

    info!("linkshark: relaying {} -> {}", bind_addr, args.target);
    let _proxy = Proxy::new(bind_addr, args.target, args.verbose);
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
