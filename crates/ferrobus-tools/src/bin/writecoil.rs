use clap::{Parser, ValueEnum};
use ferrobus_tools::common::{connect_master, init_tracing, TcpConnectionArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CoilState {
    On,
    Off,
}

#[derive(Debug, Parser)]
#[command(name = "writecoil", about = "Write a single coil (FC05)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long)]
    address: u16,
    #[arg(long, value_enum)]
    state: CoilState,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = connect_master(&args.conn).await?;

    let on = args.state == CoilState::On;
    master.write_single_coil(args.address, on).await?;
    println!("coil={} set to {:?}", args.address, args.state);

    master.disconnect().await;
    Ok(())
}
