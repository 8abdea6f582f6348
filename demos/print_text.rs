use std::io::{self, Write};
use std::time::Duration;

use labelprinter::ble::{resolve_endpoint, scan, GattIds};
use labelprinter::{PrintOptions, PrintOutcome, PrintSession};

/// Example: Interactive label printing session
/// - Scans for BLE printers
/// - Lets user select device
/// - Prints each entered line until an empty line
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for BLE devices for 3 seconds...");
    let devices = scan(Duration::from_secs(3)).await?;
    if devices.is_empty() {
        println!(
            "No devices found. Make sure your Bluetooth adapter is up and the printer is powered on and advertising."
        );
        return Ok(());
    }

    println!("Found devices:");
    for (i, d) in devices.iter().enumerate() {
        println!("  {}) id={} name={:?} rssi={:?}", i + 1, d.id, d.name, d.rssi);
    }

    // Ask user to pick a device
    let mut input = String::new();
    let chosen = loop {
        print!("Select device number to connect to (1-{}): ", devices.len());
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        if let Ok(n) = input.trim().parse::<usize>() {
            if n >= 1 && n <= devices.len() {
                break &devices[n - 1];
            }
        }
        println!("Invalid selection.");
    };

    println!("Connecting to device id={} name={:?} ...", chosen.id, chosen.name);
    let endpoint = resolve_endpoint(&chosen.id, Duration::from_secs(10), GattIds::default()).await;
    if endpoint.is_none() {
        println!("Could not find the printer's write characteristic, lines will not be printed.");
    }
    let session = PrintSession::new(endpoint, PrintOptions::default());

    loop {
        print!("Text to print (empty line to quit): ");
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        let line = input.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let mut payload = line.to_string();
        payload.push_str("\r\n");
        match session.print_text(&payload).await {
            Ok(PrintOutcome::Printed { segments, bytes }) => {
                println!("Sent {} byte(s) in {} write(s).", bytes, segments)
            }
            Ok(PrintOutcome::CapabilityUnavailable) => println!("Not connected, nothing sent."),
            Err(e) => eprintln!("Print failed: {}", e),
        }
    }

    if let Some(endpoint) = session.into_endpoint() {
        endpoint.disconnect().await?;
    }
    Ok(())
}
