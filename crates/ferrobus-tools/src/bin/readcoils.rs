use clap::Parser;
use ferrobus_tools::common::{connect_master, init_tracing, TcpConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "readcoils", about = "Read coils (FC01)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long)]
    start: u16,
    #[arg(long)]
    quantity: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = connect_master(&args.conn).await?;

    let values = master.read_coils(args.start, args.quantity).await?;
    for (offset, value) in values.iter().enumerate() {
        println!("coil={} value={}", args.start + offset as u16, value);
    }

    master.disconnect().await;
    Ok(())
}
