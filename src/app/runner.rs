use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::cli::Args;
use crate::app::odometer::{LinkStatus, Odometer};
use crate::config::io::ConfigIO;
use crate::config::types::{Config, DeviceConfig, ScanMode};
use crate::device::connection::BtleRadioProvider;
use crate::device::manager::{EventEnvelope, SessionManager};
use crate::device::protocol::Reading;
use crate::device::service::{session_service, wait_until, SessionHandle};
use crate::device::types::DeviceEvent;
use crate::error::{AppRunError, SessionError};

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                // this is probably the first start of the app
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", &err);
            }
            Config::default()
        },
    }
}

struct Consumer {
    session: SessionHandle,
    events: Receiver<EventEnvelope>,
    odometer: Odometer,
    device: DeviceConfig,
    reading_limit: Option<u64>,
    shutdown: CancellationToken,
}

impl Consumer {
    async fn start_scan(&mut self) -> Result<(), SessionError> {
        let simulated = self.odometer.scan_mode.is_simulated();
        info!("Starting {} scan", self.odometer.scan_mode);
        self.session.start_scan(simulated).await?;

        // the Scanning event may still be queued behind the next poll tick
        self.odometer.status = LinkStatus::Scanning;
        Ok(())
    }

    /// Runs until `shutdown`, the reading limit, or an error that can not be recovered from.
    async fn run(&mut self) -> Result<(), SessionError> {
        self.start_scan().await?;

        let mut poll_interval = interval_at(Instant::now() + self.device.poll_interval(), self.device.poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rescan_at: Option<Instant> = None;
        let mut readings: u64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(());
                },
                envelope = self.events.next() => {
                    let Some(envelope) = envelope else {
                        return Err(SessionError::ServiceStopped);
                    };

                    if !self.odometer.apply(&envelope) {
                        debug!("Discarding stale event #{}", envelope.sequence);
                        continue;
                    }

                    match &envelope.event {
                        DeviceEvent::Connected { .. } => {
                            // it's time for our first value reading
                            self.session.poll().await?;
                        },
                        DeviceEvent::NotConnected { reason } => {
                            info!("Not connected ({:?}), scanning again later", reason);
                            rescan_at.get_or_insert_with(|| Instant::now() + self.device.reconnect_delay());
                        },
                        DeviceEvent::ValueAvailable { reading: Reading::Distance(_), .. } => {
                            readings += 1;
                        },
                        DeviceEvent::ValueAvailable { .. } => {
                            if let Some(message) = self.odometer.messages().last() {
                                println!("message: {}", message);
                            }
                        },
                        DeviceEvent::Scanning => {},
                    }

                    println!("{}", self.odometer);

                    if self.reading_limit.is_some_and(|limit| readings >= limit) {
                        info!("Received {} readings", readings);
                        return Ok(());
                    }
                },
                _ = poll_interval.tick() => {
                    // the device may silently drop a request, so keep asking. A poll during a scan
                    // would report NotConnected and cut the scan short.
                    if self.odometer.status != LinkStatus::Scanning {
                        self.session.poll().await?;
                    }
                },
                _ = wait_until(rescan_at) => {
                    rescan_at = None;
                    self.start_scan().await?;
                },
            }
        }
    }
}

pub async fn run_application(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.as_deref())?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = load_config(&config_io).await;
    let mut odometer = Odometer::from_last_known(&config.last);
    odometer.switch_mode(args.scan_mode().unwrap_or(config.last.scan_mode));

    let radio = match odometer.scan_mode {
        ScanMode::Live => BtleRadioProvider::new(config.device.clone()).await,
        ScanMode::Simulated => BtleRadioProvider::unavailable(config.device.clone()),
    };

    let app_cancel = CancellationToken::new();
    let shutdown = app_cancel.child_token();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted");
                    shutdown.cancel();
                },
                Err(err) => warn!("Can not listen for ctrl-c: {}", err),
            }
        }
    });

    let (event_sender, events) = channel::<EventEnvelope>(64);
    let (manager, inbox) = SessionManager::new(config.device.clone(), Box::new(radio), Box::new(event_sender));
    let (session, service) = session_service(app_cancel.clone(), manager, inbox);

    let mut consumer = Consumer {
        session,
        events,
        odometer,
        device: config.device.clone(),
        reading_limit: args.readings,
        shutdown,
    };
    let result = consumer.run().await;

    app_cancel.cancel();
    if let Err(err) = service.await {
        warn!("Session service did not stop cleanly: {}", err);
    }

    config.last = consumer.odometer.to_last_known();
    if let Err(err) = config_io.save(&config).await {
        error!("Failed to save config: {}", &err);
    }

    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;
    use super::*;
    use crate::config::types::LastKnown;
    use crate::device::radio::{DiscoveryFilter, LinkEventSender, RadioLink, RadioProvider};
    use crate::device::types::{DeviceAddress, LinkEvent};
    use crate::error::DeviceError;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    struct FakeLink {
        calls: CallLog,
    }

    impl FakeLink {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RadioLink for FakeLink {
        fn start_discovery(&mut self, _filter: &DiscoveryFilter) -> Result<(), DeviceError> {
            self.record("scan");
            Ok(())
        }

        fn stop_discovery(&mut self) {}

        fn connect(&mut self, _address: &DeviceAddress) -> Result<(), DeviceError> {
            self.record("connect");
            Ok(())
        }

        fn discover_services(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read_characteristic(&mut self, _id: Uuid) -> Result<(), DeviceError> {
            self.record("read");
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn close(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct FakeRadio {
        calls: CallLog,
        links: Arc<Mutex<Vec<LinkEventSender>>>,
    }

    impl FakeRadio {
        fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|recorded| **recorded == call).count()
        }

        fn latest_link(&self) -> LinkEventSender {
            self.links.lock().unwrap().last().cloned().unwrap()
        }

        fn connect_device(&self) {
            let link = self.latest_link();
            link.send(LinkEvent::DeviceFound { name: Some("DDO".to_string()), address: DeviceAddress("AA:BB".to_string()) });
            link.send(LinkEvent::LinkEstablished);
            link.send(LinkEvent::ServicesDiscovered { success: true });
        }
    }

    impl RadioProvider for FakeRadio {
        fn open(&mut self, events: LinkEventSender) -> Result<Box<dyn RadioLink>, DeviceError> {
            self.links.lock().unwrap().push(events);
            Ok(Box::new(FakeLink { calls: self.calls.clone() }))
        }
    }

    struct Running {
        radio: FakeRadio,
        shutdown: CancellationToken,
        task: JoinHandle<(Consumer, Result<(), SessionError>)>,
    }

    fn run_consumer(scan_mode: ScanMode, reading_limit: Option<u64>) -> Running {
        let radio = FakeRadio::default();
        let device = DeviceConfig::default();
        let (event_sender, events) = channel::<EventEnvelope>(64);
        let (manager, inbox) = SessionManager::new(device.clone(), Box::new(radio.clone()), Box::new(event_sender));
        let (session, _service) = session_service(CancellationToken::new(), manager, inbox);
        let shutdown = CancellationToken::new();

        let mut consumer = Consumer {
            session,
            events,
            odometer: Odometer::from_last_known(&LastKnown { scan_mode, ..LastKnown::default() }),
            device,
            reading_limit,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(async move {
            let result = consumer.run().await;
            (consumer, result)
        });

        Running { radio, shutdown, task }
    }

    // lets every task handle what is queued; the paused clock moves only a little
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn polls_as_soon_as_connected() {
        let running = run_consumer(ScanMode::Live, None);
        settle().await;

        running.radio.connect_device();
        settle().await;

        assert_eq!(running.radio.count("read"), 1);
        running.shutdown.cancel();
        let (consumer, result) = running.task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(consumer.odometer.status, LinkStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_poll_while_scanning() {
        let running = run_consumer(ScanMode::Live, None);

        // several poll intervals, but shorter than the scan timeout
        sleep(Duration::from_millis(2500)).await;

        assert_eq!(running.radio.count("scan"), 1);
        assert_eq!(running.radio.count("read"), 0);
        running.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_every_interval_while_connected() {
        let running = run_consumer(ScanMode::Live, None);
        settle().await;
        running.radio.connect_device();

        sleep(Duration::from_millis(3500)).await;

        // one right after connecting, then one per second
        assert_eq!(running.radio.count("read"), 4);
        running.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rescans_once_after_the_reconnect_delay() {
        let running = run_consumer(ScanMode::Live, None);
        settle().await;
        running.radio.connect_device();
        settle().await;

        running.radio.latest_link().send(LinkEvent::LinkDropped);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(running.radio.count("scan"), 1);

        // the poll at one second reports NotConnected again, which must not delay the rescan
        sleep(Duration::from_millis(600)).await;
        assert_eq!(running.radio.count("scan"), 2);

        running.radio.connect_device();
        settle().await;
        assert_eq!(running.radio.count("connect"), 2);
        running.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_the_reading_limit() {
        let running = run_consumer(ScanMode::Simulated, Some(3));

        let (consumer, result) = timeout(Duration::from_secs(10), running.task).await.unwrap().unwrap();

        assert!(result.is_ok());
        assert!(consumer.odometer.distance_mm > 0);
        assert!(consumer.odometer.updated_at.is_some());
    }
}
