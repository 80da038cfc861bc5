use tracing::{error, info};
use sem6000::{ConnectionParams, ConsumptionPeriod, Pin, Result, Sem6000};

fn format_series(series: &[Option<u32>]) -> String {
    series
        .iter()
        .map(|value| value.map_or_else(|| "-".to_string(), |wh| wh.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());
    let pin: Pin = args.next().as_deref().unwrap_or("0000").parse()?;

    info!("📈 SEM6000 Consumption Report");

    let mut plug = match Sem6000::connect_ble(ConnectionParams::new(address), Some(pin)).await {
        Ok(plug) => plug,
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    };

    let settings = plug.request_settings().await?;
    info!(
        "💶 Prices: {} ct normal, {} ct reduced",
        settings.normal_price_in_cent, settings.reduced_period_price_in_cent
    );

    for period in [
        ConsumptionPeriod::Last23Hours,
        ConsumptionPeriod::Last30Days,
        ConsumptionPeriod::Last12Months,
    ] {
        match plug.request_consumption(period).await {
            Ok(series) => {
                let total: u64 = series.iter().flatten().map(|wh| u64::from(*wh)).sum();
                info!("{} (Wh, newest first): {}", period, format_series(&series));
                info!(
                    "  Total {} Wh, about {} ct",
                    total,
                    total * u64::from(settings.normal_price_in_cent) / 1000
                );
            }
            Err(e) => error!("❌ Failed to read consumption of {}: {}", period, e),
        }
    }

    plug.disconnect().await?;
    Ok(())
}
