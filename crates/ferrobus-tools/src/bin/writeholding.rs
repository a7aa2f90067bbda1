use clap::Parser;
use ferrobus_tools::common::{connect_master, init_tracing, TcpConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "writeholding", about = "Write holding registers (FC06/FC16)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long)]
    start: u16,
    /// One or more register values; a single value uses FC06.
    #[arg(long, required = true, num_args = 1..)]
    values: Vec<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = connect_master(&args.conn).await?;

    if let [value] = args.values.as_slice() {
        master.write_single_register(args.start, *value).await?;
    } else {
        master.write_multiple_registers(args.start, &args.values).await?;
    }
    println!("wrote {} register(s) starting at {}", args.values.len(), args.start);

    master.disconnect().await;
    Ok(())
}
