use tracing::{error, info, warn};
use sem6000::{ConnectionParams, Pin, Result, Sem6000};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());
    let pin: Pin = args.next().as_deref().unwrap_or("0000").parse()?;

    let params = ConnectionParams::new(address);

    info!("🔍 Scanning for SEM6000 plugs...");
    match Sem6000::discover(&params).await {
        Ok(devices) if devices.is_empty() => warn!("No plugs advertising"),
        Ok(devices) => {
            for device in devices {
                info!(
                    "  {} {} (RSSI {:?})",
                    device.address,
                    device.name.as_deref().unwrap_or("unnamed"),
                    device.rssi
                );
            }
        }
        Err(e) => error!("❌ Scan failed: {}", e),
    }

    let mut plug = Sem6000::connect_ble(params, Some(pin)).await?;

    let list = plug.request_scheduler().await?;
    info!("🗓️ {} scheduler(s) stored", list.number_of_schedulers);

    for entry in &list.entries {
        let scheduler = &entry.scheduler;
        let weekdays: Vec<String> = scheduler
            .repeat_on_weekdays
            .indices()
            .map(|day| day.to_string())
            .collect();

        info!(
            "  #{} {} switch {} at {:04}-{:02}-{:02} {:02}:{:02} repeat [{}]",
            entry.slot_id,
            if scheduler.is_active { "active" } else { "inactive" },
            if scheduler.is_action_turn_on { "on" } else { "off" },
            scheduler.year,
            scheduler.month,
            scheduler.day,
            scheduler.hour,
            scheduler.minute,
            weekdays.join(",")
        );
    }

    let random_mode = plug.request_random_mode_status().await?;
    info!(
        "🎲 Random mode {} between {:02}:{:02} and {:02}:{:02}",
        if random_mode.is_active { "active" } else { "inactive" },
        random_mode.start_hour,
        random_mode.start_minute,
        random_mode.end_hour,
        random_mode.end_minute
    );

    plug.disconnect().await?;
    Ok(())
}
