//! Manual test driver for the serlink protocol.
//!
//! Run one side as master and the other as slave on a crossed serial line:
//!
//! ```text
//! serlink /dev/ttyUSB0 master
//! serlink /dev/ttyUSB1 slave
//! ```

use std::io::BufRead;

use anyhow::{bail, Context};
use serlink_core::{
    available_ports, ApciParameters, ConnectionEvent, Master, SerialConfig, SerialTransport,
    DEFAULT_BAUD_RATE,
};
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("usage: serlink <device> <master|slave> [baud]");
    eprintln!();
    eprintln!("available ports:");
    for name in available_ports() {
        eprintln!("  {}", name);
    }
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        usage();
    }

    let device = &args[0];
    let is_master = match args[1].as_str() {
        "master" => true,
        "slave" => false,
        other => bail!("unknown role '{}', expected master or slave", other),
    };
    let baud = match args.get(2) {
        Some(b) => b
            .parse::<u32>()
            .with_context(|| format!("invalid baud rate '{}'", b))?,
        None => DEFAULT_BAUD_RATE,
    };

    let transport = SerialTransport::new(SerialConfig::new(device.clone(), baud));
    let mut master = Master::new(Box::new(transport), ApciParameters::default());

    master.set_receive_handler(Box::new(|msg| {
        println!("recv {} bytes: {}", msg.len(), String::from_utf8_lossy(msg));
        true
    }));
    master.set_connection_handler(Box::new(|event| {
        println!("link event: {:?}", event);
        // stop the polling loop once the link is gone
        event != ConnectionEvent::LinkBroken
    }));

    master.start();

    if is_master {
        master.begin_transfer();
        master.send(b"This is Test Data from Master!");
    } else {
        master.send(b"This is Test Data from Slave!");
    }

    println!("link running on {} at {} baud, press Enter to quit", device, baud);
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;

    if is_master {
        master.end_transfer();
        // give the STOP frame a chance to go out before tearing down
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    master.stop();
    Ok(())
}
