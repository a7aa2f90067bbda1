use clap::Parser;
use ferrobus_tools::common::{connect_master, init_tracing, TcpConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "identify", about = "Report slave id (FC17) and device identification (FC43)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    /// Read device id code: 1 basic, 2 regular, 3 extended.
    #[arg(long, default_value_t = 1)]
    read_code: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = connect_master(&args.conn).await?;

    match master.report_slave_id().await {
        Ok(report) => {
            println!(
                "slave id: {:02X?} run indicator: {}",
                report.slave_id,
                if report.run_indicator { "on" } else { "off" }
            );
        }
        Err(err) => println!("report slave id failed: {err}"),
    }

    match master.read_device_identification(args.read_code, 0).await {
        Ok(ident) => {
            println!("conformity level: 0x{:02X}", ident.conformity_level);
            for object in ident.objects {
                println!(
                    "object 0x{:02X}: {}",
                    object.object_id,
                    String::from_utf8_lossy(&object.value)
                );
            }
        }
        Err(err) => println!("read device identification failed: {err}"),
    }

    master.disconnect().await;
    Ok(())
}
