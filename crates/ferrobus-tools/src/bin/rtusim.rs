use clap::Parser;
use ferrobus_slave::{
    DataBank, DeviceIdObject, DeviceIdentity, FrameGap, RtuSlave, RtuSlaveConfig, SlaveIdReport,
};
use ferrobus_tools::common::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "rtusim", about = "Serve an in-memory RTU slave on a serial port")]
struct Args {
    /// Serial device path, e.g. /dev/ttyUSB0.
    #[arg(long)]
    port: String,
    #[arg(long, default_value_t = 1)]
    slave_id: u8,
    #[arg(long, default_value_t = 19_200)]
    baud: u32,
    /// Use the 4.5-character frame gap instead of the standard 3.5.
    #[arg(long)]
    conservative_gap: bool,
    #[arg(long, default_value_t = 1024)]
    points: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let frame_gap = if args.conservative_gap {
        FrameGap::Conservative
    } else {
        FrameGap::Standard
    };
    let config = RtuSlaveConfig::new(args.slave_id)
        .with_baud_rate(args.baud)
        .with_frame_gap(frame_gap);

    let bank = DataBank::new(args.points, args.points, args.points, args.points);
    let mut slave = RtuSlave::open(&args.port, config)?;
    bank.install(slave.handlers_mut());

    let slave_id = args.slave_id;
    slave.on_report_slave_id(Box::new(move || {
        Ok(SlaveIdReport {
            slave_id: vec![slave_id],
            run_indicator: true,
        })
    }));
    slave.on_read_device_identification(Box::new(|_, _| {
        Ok(DeviceIdentity {
            conformity_level: 0x01,
            objects: vec![
                DeviceIdObject {
                    object_id: 0x00,
                    value: b"ferrobus".to_vec(),
                },
                DeviceIdObject {
                    object_id: 0x01,
                    value: b"rtusim".to_vec(),
                },
                DeviceIdObject {
                    object_id: 0x02,
                    value: env!("CARGO_PKG_VERSION").as_bytes().to_vec(),
                },
            ],
        })
    }));

    println!(
        "serving rtu slave {} on {} at {} baud",
        args.slave_id, args.port, args.baud
    );
    slave.run().await?;
    Ok(())
}
