use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use sem6000::{ConnectionParams, Pin, Result, Sem6000};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());
    let pin: Pin = args.next().as_deref().unwrap_or("0000").parse()?;

    info!("🔌 SEM6000 Basic Control Example");
    info!("Connecting to {}...", address);

    let mut plug = match Sem6000::connect_ble(ConnectionParams::new(address), Some(pin)).await {
        Ok(plug) => {
            info!("✅ Connected and authorized");
            plug
        }
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    };

    // Sync the plug clock first so timers and statistics line up
    plug.set_date_and_time(chrono::Local::now().naive_local())
        .await?;

    let serial = plug.request_device_serial().await?;
    let name = plug.request_device_name().await?;
    info!("📇 Device: {} (serial {})", name, serial);

    info!("⚡ Switching power on...");
    if let Err(e) = plug.power_on().await {
        error!("❌ Failed to power on: {}", e);
        return Err(e);
    }

    sleep(Duration::from_secs(2)).await;

    let measurement = plug.request_measurement().await?;
    info!("📊 Measurement:");
    info!(
        "  Power: {}",
        if measurement.is_power_active { "ON" } else { "OFF" }
    );
    info!("  Load: {} mW", measurement.power_in_milliwatt);
    info!("  Voltage: {} V", measurement.voltage_in_volt);
    info!("  Current: {} mA", measurement.current_in_milliampere);
    info!("  Frequency: {} Hz", measurement.frequency_in_hertz);
    info!(
        "  Total: {} kWh",
        measurement.total_consumption_in_kilowatt_hour
    );

    info!("⏲️ Switching off again in 30 seconds via timer...");
    plug.set_timer(false, Duration::from_secs(30)).await?;

    let status = plug.request_timer_status().await?;
    info!(
        "  Timer running: {}, target {:02}:{:02}:{:02}",
        status.is_timer_running, status.target_hour, status.target_minute, status.target_second
    );

    info!("🔌 Disconnecting...");
    plug.disconnect().await?;
    info!("✅ Disconnected successfully");

    Ok(())
}
