//! Browse Demo - list, upload and download files on a module's flash.
//!
//! This demo shows:
//! - Connecting to a module behind a serial bridge
//! - Sending plain AT commands and listening for unsolicited events
//! - Opening the flash filesystem and reporting transfer progress
//!
//! # Running
//!
//! ```sh
//! # expose the serial port, e.g.
//! socat UNIX-LISTEN:/tmp/modem.sock,fork /dev/ttyUSB0,b115200,raw,echo=0
//!
//! RUST_LOG=modemlink=debug cargo run --example browse -- /tmp/modem.sock [config.json]
//! ```

use modemlink::transport::connect_bridge;
use modemlink::{AtEvent, FileContent, ModemBuilder, ModemConfig, ProgressEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7000".to_string());
    let config = match args.next() {
        Some(path) => ModemConfig::from_json_file(path)?,
        None => ModemConfig::default(),
    };

    let stream = connect_bridge(&addr).await?;
    let modem = ModemBuilder::from_config(config).start(stream).await?;

    modem.at().add_listener(|event: &AtEvent| {
        println!("event: {}", event.text);
    });
    println!("signal: {}", modem.send("AT+CSQ").await?);

    let files = modem.file_manager().await?;
    files.add_progress_listener(|event: &ProgressEvent| match event {
        ProgressEvent::Progress { operation, percent } => println!("{}: {}%", operation, percent),
        ProgressEvent::Done { operation, success } => println!("{} done ({})", operation, success),
    });

    println!(
        "{} of {} bytes free",
        files.free_space().await?,
        files.disk_space().await?
    );
    for entry in files.file_listing().iter() {
        let kind = if entry.is_directory() { "<dir>" } else { "" };
        println!("{:>8} {:5} {}", entry.size(), kind, entry.path());
    }

    let note = FileContent::new("hello.txt", "written by modemlink\r\n");
    files.put_file(&note, true).await?;
    let back = files.get_file("hello.txt").await?;
    println!("read back {} bytes", back.data().len());

    files.close().await?;
    Ok(())
}
