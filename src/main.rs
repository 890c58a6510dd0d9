use anyhow::Context;
use chrono::NaiveDate;
use embassy_executor::Spawner;
use embassy_futures::{
    join::join,
    select::{select, Either},
};
use embassy_time::{Duration, Timer};
use fitscale_ble::ble::BleEvent;
use fitscale_ble::scales::traits::{ChannelSink, ReadingChannel, ReadingSink};
use fitscale_ble::simulated::{
    advertisement_frame, notification_frame, scale_advertisement, weight_notification,
    SimulatedTransport,
};
use fitscale_ble::system::config::{BodyProfile, DriverConfig, ScaleConfig};
use fitscale_ble::{AcquisitionMode, ScaleFacade, ScaleReading, Sex, WeightUnit};
use log::{error, info};
use std::sync::Arc;

const DEMO_ADDRESS: &str = "D0:4D:2C:11:22:33";
const FRAME_INTERVAL: Duration = Duration::from_millis(120);

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn default_config() -> DriverConfig {
    DriverConfig {
        scale: ScaleConfig {
            use_advertisements: true,
            ..Default::default()
        },
        profile: BodyProfile {
            sex: Sex::Female,
            birthdate: NaiveDate::from_ymd_opt(1988, 4, 12).unwrap_or_default(),
            height_m: 1.68,
        },
    }
}

fn mac_bytes(address: &str) -> [u8; 6] {
    let mut mac = [0u8; 6];
    let parts: Vec<u8> = address
        .split([':', '-'])
        .filter_map(|part| u8::from_str_radix(part, 16).ok())
        .collect();
    if parts.len() == 6 {
        mac.copy_from_slice(&parts);
    }
    mac
}

fn print_reading(reading: &ScaleReading) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(reading)?);
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path))?;
            DriverConfig::from_json(&json)?
        }
        None => default_config(),
    };
    let address = config.scale.address.clone().unwrap_or_else(|| DEMO_ADDRESS.to_string());

    let transport = Arc::new(SimulatedTransport::new());
    let readings = Arc::new(ReadingChannel::new());
    let sink = ChannelSink::new(Arc::clone(&readings));
    let facade = ScaleFacade::new(
        config.scale,
        config.profile,
        Arc::clone(&transport),
        move |reading: ScaleReading| sink.deliver(reading),
    )?;
    info!("Replaying simulated {:?} session for {}", facade.mode(), address);

    let replay = async {
        match facade.mode() {
            AcquisitionMode::Advertisement => replay_broadcasts(&transport, &address).await,
            AcquisitionMode::Gatt => replay_notifications(&transport, &address).await,
        }
        Timer::after(FRAME_INTERVAL).await;
        facade.stop().await;
    };

    let printer = async {
        loop {
            let reading = readings.receive().await;
            if let Err(e) = print_reading(&reading) {
                error!("Failed to print reading: {:?}", e);
            }
        }
    };

    if let Either::First((result, _)) = select(join(facade.run(), replay), printer).await {
        result?;
    }
    while let Ok(reading) = readings.try_receive() {
        print_reading(&reading)?;
    }
    Ok(())
}

/// Someone steps on: weight ramps up, settles, then impedance arrives
async fn replay_broadcasts(transport: &SimulatedTransport, address: &str) {
    let mac = mac_bytes(address);
    let settled = 62_400;
    let ramp = [18_200, 41_750, 58_900, 62_150, 62_380];

    let frames = ramp
        .iter()
        .map(|&grams| (grams, 0))
        .chain(std::iter::repeat((settled, 0)).take(10))
        .chain(std::iter::repeat((settled, 512)).take(3));

    for (grams, impedance) in frames {
        let adv = scale_advertisement(address, advertisement_frame(mac, grams, impedance));
        transport.push_event(BleEvent::Advertisement(adv)).await;
        Timer::after(FRAME_INTERVAL).await;
    }
}

async fn replay_notifications(transport: &SimulatedTransport, address: &str) {
    let adv = scale_advertisement(address, Vec::new());
    transport.push_event(BleEvent::Advertisement(adv)).await;
    Timer::after(FRAME_INTERVAL).await;

    for (grams, impedance) in [(62_400, None), (62_400, Some(512))] {
        let frame = notification_frame(grams, impedance, WeightUnit::Kg);
        transport.push_event(weight_notification(address, frame)).await;
        Timer::after(FRAME_INTERVAL).await;
    }

    transport
        .push_event(BleEvent::Disconnected {
            address: address.to_string(),
        })
        .await;
}
