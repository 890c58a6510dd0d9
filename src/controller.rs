use crate::{
    ble::{Advertisement, BleEvent, BleTransport, Scanner},
    body_metrics::{BodyMetrics, MetricInputs},
    scales::{
        advertisement::AdvertisementListener,
        etekcity::{ConnectionSession, ConnectionStatus},
        traits::{ReadingSink, ScaleError},
    },
    system::config::{BodyProfile, ScaleConfig},
    types::{ScaleReading, WeightUnit},
};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_futures::{
    join::join,
    select::{select, Either},
    yield_now,
};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex},
    channel::Channel,
    mutex::Mutex,
    signal::Signal,
};
use log::{debug, info, warn};
use std::sync::Arc;

// Advertisements waiting for the connect loop; extras are dropped while it is busy
const CONNECT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Gatt,
    Advertisement,
}

/// Adds body-composition metrics to every reading before handing it to the
/// caller's callback
pub struct MetricsSink<F> {
    profile: BodyProfile,
    callback: F,
}

impl<F> MetricsSink<F>
where
    F: Fn(ScaleReading) -> anyhow::Result<()>,
{
    pub fn new(profile: BodyProfile, callback: F) -> Self {
        Self { profile, callback }
    }
}

impl<F> ReadingSink for MetricsSink<F>
where
    F: Fn(ScaleReading) -> anyhow::Result<()>,
{
    fn deliver(&self, mut reading: ScaleReading) -> anyhow::Result<()> {
        let inputs = MetricInputs {
            weight_kg: reading.weight_kg(),
            height_m: self.profile.height_m,
            age: self.profile.age_today(),
            sex: self.profile.sex,
            impedance_ohm: reading.impedance_ohm(),
        };
        BodyMetrics::compute(&inputs).merge_into(&mut reading.measurements);
        (self.callback)(reading)
    }
}

enum Acquisition<T: BleTransport, F: Fn(ScaleReading) -> anyhow::Result<()>> {
    Gatt(ConnectionSession<T, MetricsSink<F>>),
    Advertisement {
        listener: Mutex<CriticalSectionRawMutex, AdvertisementListener>,
        sink: MetricsSink<F>,
        display_unit: BlockingMutex<CriticalSectionRawMutex, Cell<Option<WeightUnit>>>,
    },
}

/// Entry point for applications: picks GATT or advertisement acquisition
/// from the config and delivers metric-enriched readings to one callback.
pub struct ScaleFacade<T, F>
where
    T: BleTransport,
    F: Fn(ScaleReading) -> anyhow::Result<()>,
{
    config: ScaleConfig,
    transport: Arc<T>,
    acquisition: Acquisition<T, F>,
    running: AtomicBool,
    cancel: Signal<CriticalSectionRawMutex, ()>,
}

impl<T, F> ScaleFacade<T, F>
where
    T: BleTransport,
    F: Fn(ScaleReading) -> anyhow::Result<()>,
{
    pub fn new(
        config: ScaleConfig,
        profile: BodyProfile,
        transport: Arc<T>,
        callback: F,
    ) -> Result<Self, ScaleError> {
        config.validate()?;
        profile.validate()?;

        let sink = MetricsSink::new(profile, callback);
        let acquisition = if config.use_advertisements {
            if config.address.is_none() {
                warn!("No scale address configured, accepting readings from any scale nearby");
            }
            Acquisition::Advertisement {
                listener: Mutex::new(AdvertisementListener::new(
                    config.tuning.clone(),
                    config.address.as_deref(),
                )),
                sink,
                display_unit: BlockingMutex::new(Cell::new(config.display_unit)),
            }
        } else {
            let address = config.address.as_deref().ok_or(ScaleError::MissingAddress)?;
            Acquisition::Gatt(ConnectionSession::new(
                address,
                Arc::clone(&transport),
                config.display_unit,
                sink,
            )?)
        };

        Ok(Self {
            config,
            transport,
            acquisition,
            running: AtomicBool::new(false),
            cancel: Signal::new(),
        })
    }

    pub fn mode(&self) -> AcquisitionMode {
        match self.acquisition {
            Acquisition::Gatt(_) => AcquisitionMode::Gatt,
            Acquisition::Advertisement { .. } => AcquisitionMode::Advertisement,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connection state of the GATT session; `None` in advertisement mode
    pub async fn status(&self) -> Option<ConnectionStatus> {
        match &self.acquisition {
            Acquisition::Gatt(session) => Some(session.status().await),
            Acquisition::Advertisement { .. } => None,
        }
    }

    pub async fn hw_version(&self) -> Option<String> {
        match &self.acquisition {
            Acquisition::Gatt(session) => session.hw_version().await,
            Acquisition::Advertisement { .. } => None,
        }
    }

    pub async fn sw_version(&self) -> Option<String> {
        match &self.acquisition {
            Acquisition::Gatt(session) => session.sw_version().await,
            Acquisition::Advertisement { .. } => None,
        }
    }

    pub async fn display_unit(&self) -> Option<WeightUnit> {
        match &self.acquisition {
            Acquisition::Gatt(session) => session.display_unit().await,
            Acquisition::Advertisement { display_unit, .. } => display_unit.lock(|u| u.get()),
        }
    }

    /// In GATT mode the unit is written to the scale on the next connect;
    /// in advertisement mode it only labels the readings.
    pub async fn set_display_unit(&self, unit: WeightUnit) {
        match &self.acquisition {
            Acquisition::Gatt(session) => session.set_display_unit(unit).await,
            Acquisition::Advertisement { display_unit, .. } => {
                display_unit.lock(|u| u.set(Some(unit)));
            }
        }
    }

    /// Drive acquisition until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<(), ScaleError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scale facade already running");
            return Ok(());
        }
        self.cancel.reset();

        let result = match &self.acquisition {
            Acquisition::Gatt(session) => self.run_gatt(session).await,
            Acquisition::Advertisement {
                listener,
                sink,
                display_unit,
            } => {
                info!("Starting advertisement listener");
                let mut listener = listener.lock().await;
                listener
                    .run(
                        &*self.transport,
                        self.config.scan_strategy(),
                        &self.cancel,
                        |reading| {
                            let unit = display_unit.lock(|u| u.get()).unwrap_or_default();
                            sink.deliver(reading.to_scale_reading(unit))
                        },
                    )
                    .await
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_gatt(
        &self,
        session: &ConnectionSession<T, MetricsSink<F>>,
    ) -> Result<(), ScaleError> {
        info!("Starting GATT session for {}", session.address());
        let scanner = Scanner::new(&*self.transport, self.config.scan_strategy());
        scanner.start().await?;

        let connect_queue: Channel<CriticalSectionRawMutex, Advertisement, CONNECT_QUEUE_DEPTH> =
            Channel::new();

        // Notifications and disconnects are handled inline; connecting can
        // take seconds, so it runs in its own loop
        let router = async {
            loop {
                match self.transport.events().receive().await {
                    BleEvent::Advertisement(adv) => {
                        if session.matches(&adv.address) && connect_queue.try_send(adv).is_err() {
                            debug!("Connect queue full, dropping advertisement");
                        }
                    }
                    BleEvent::Notification {
                        address,
                        characteristic,
                        value,
                    } => {
                        session.handle_notification(&address, characteristic, &value).await;
                    }
                    BleEvent::Disconnected { address } => session.handle_disconnect(&address).await,
                }
            }
        };
        let connector = async {
            loop {
                let adv = connect_queue.receive().await;
                session.handle_advertisement(&adv).await;
            }
        };

        if let Either::Second(_) = select(join(router, connector), self.cancel.wait()).await {
            debug!("GATT session cancelled");
        }

        session.stop().await;
        scanner.stop().await;
        Ok(())
    }

    /// Cancel [`run`](Self::run) and wait until it has released the scan and
    /// any connection. Any number of tasks may wait here at once.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.cancel.signal(());
        while self.is_running() {
            yield_now().await;
        }
        info!("Scale facade stopped");
    }
}
