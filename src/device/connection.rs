//! `RadioLink` on top of btleplug.
//!
//! Each request spawns a task that reports its outcome as a `LinkEvent`. All tasks of one link
//! are children of the link's cancellation token, so `close` stops everything at once.

use std::collections::HashMap;
use std::sync::Arc;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future::ready;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::DeviceConfig;
use crate::device::radio::{DiscoveryFilter, LinkEventSender, RadioLink, RadioProvider};
use crate::device::types::{DeviceAddress, LinkEvent};
use crate::error::DeviceError;

async fn first_adapter() -> Result<Adapter, DeviceError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    let adapter = adapters.into_iter().next().ok_or(DeviceError::AdapterUnavailable)?;
    info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    Ok(adapter)
}

/// Shared by every link of one provider. A link claims the slot before it connects and gives it
/// back only after its disconnect has completed, so a new link never connects to a peripheral that
/// an old link is still tearing down.
#[derive(Clone, Default)]
pub struct PeripheralSlot {
    lock: Arc<Mutex<()>>,
}

pub struct PeripheralClaim {
    _guard: OwnedMutexGuard<()>,
}

impl PeripheralSlot {
    pub async fn claim(&self) -> PeripheralClaim {
        PeripheralClaim { _guard: self.lock.clone().lock_owned().await }
    }
}

pub struct BtleRadioProvider {
    adapter: Option<Adapter>,
    runtime: Handle,
    config: DeviceConfig,
    slot: PeripheralSlot,
}

impl BtleRadioProvider {
    /// Looks for a bluetooth adapter. Not finding one is not an error here; it is reported when a
    /// live session is started.
    pub async fn new(config: DeviceConfig) -> Self {
        let adapter = match first_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(err) => {
                warn!("Bluetooth is unavailable: {}", err);
                None
            },
        };

        BtleRadioProvider { adapter, runtime: Handle::current(), config, slot: PeripheralSlot::default() }
    }

    /// A provider that never touches bluetooth, for runs that only use the simulated device.
    pub fn unavailable(config: DeviceConfig) -> Self {
        BtleRadioProvider { adapter: None, runtime: Handle::current(), config, slot: PeripheralSlot::default() }
    }
}

impl RadioProvider for BtleRadioProvider {
    fn open(&mut self, events: LinkEventSender) -> Result<Box<dyn RadioLink>, DeviceError> {
        let adapter = self.adapter.clone().ok_or(DeviceError::AdapterUnavailable)?;

        Ok(Box::new(BtleRadio {
            adapter,
            runtime: self.runtime.clone(),
            events,
            service_uuid: self.config.service_uuid,
            characteristic_uuid: self.config.characteristic_uuid,
            slot: self.slot.clone(),
            cancel: CancellationToken::new(),
            scan_cancel: None,
            link: Arc::new(Mutex::new(LinkState::default())),
        }))
    }
}

#[derive(Default)]
struct LinkState {
    discovered: HashMap<DeviceAddress, Peripheral>,
    peripheral: Option<Peripheral>,
    characteristic: Option<Characteristic>,
    claim: Option<PeripheralClaim>,
}

pub struct BtleRadio {
    adapter: Adapter,
    runtime: Handle,
    events: LinkEventSender,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    slot: PeripheralSlot,
    // cancelled by close()
    cancel: CancellationToken,
    scan_cancel: Option<CancellationToken>,
    link: Arc<Mutex<LinkState>>,
}

async fn report_peripheral(adapter: &Adapter, id: &PeripheralId, link: &Mutex<LinkState>, events: &LinkEventSender) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Could not query adapter for peripheral {:?}: {:?}", id, err);
            return;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
        },
        Ok(Some(properties)) => {
            let address = DeviceAddress(properties.address.to_string());
            link.lock().await.discovered.insert(address.clone(), peripheral);
            events.send(LinkEvent::DeviceFound { name: properties.local_name, address });
        },
    }
}

async fn scan(adapter: Adapter, link: Arc<Mutex<LinkState>>, events: LinkEventSender, cancel: CancellationToken) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;

    // Some platforms ignore the service filter and some devices do not advertise their services,
    // so scan for everything and let the session match on the name.
    adapter.start_scan(ScanFilter::default()).await?;

    // devices that were already known before the scan started
    for peripheral in adapter.peripherals().await? {
        report_peripheral(&adapter, &peripheral.id(), &link, &events).await;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    report_peripheral(&adapter, &id, &link, &events).await;
                },
                Some(_) => {},
                None => break,
            },
        }
    }

    if let Err(err) = adapter.stop_scan().await {
        debug!("Stopping scan failed: {:?}", err);
    }
    Ok(())
}

/// Reports `LinkDropped` once `id` shows up in `disconnects`. The stream must be subscribed before
/// connecting, otherwise a drop right after the connect is never seen.
async fn watch_disconnect<S, I>(mut disconnects: S, id: I, events: LinkEventSender, cancel: CancellationToken)
where
    S: Stream<Item = I> + Unpin,
    I: PartialEq,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            disconnected = disconnects.next() => match disconnected {
                Some(disconnected) if disconnected == id => {
                    events.send(LinkEvent::LinkDropped);
                    return;
                },
                Some(_) => {},
                None => return,
            },
        }
    }
}

/// Finds the characteristic that values are read from.
fn receive_characteristic<I>(services: I, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<Characteristic, DeviceError>
where
    I: IntoIterator<Item = Service>,
{
    services.into_iter()
        .find(|service| service.uuid == service_uuid)
        .and_then(|service| service.characteristics.into_iter().find(|characteristic| characteristic.uuid == characteristic_uuid))
        .ok_or(DeviceError::MissingCharacteristic)
}

fn read_notifications(peripheral: Peripheral, characteristic: Characteristic, events: LinkEventSender, cancel: CancellationToken) -> impl std::future::Future<Output = Result<(), DeviceError>> {
    async move {
        let mut notification_stream = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;
        info!("Subscribed to characteristic {:?}", characteristic.uuid);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                notification = notification_stream.next() => match notification {
                    Some(data) if data.uuid == characteristic.uuid => events.send(LinkEvent::ValueRead(data.value)),
                    Some(_) => {},
                    None => return Ok(()),
                },
            }
        }
    }
}

impl BtleRadio {
    fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = Result<(), DeviceError>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                result = task => {
                    if let Err(err) = result {
                        warn!("Radio task {} failed: {}", name, err);
                    }
                },
            }
        });
    }
}

impl RadioLink for BtleRadio {
    fn start_discovery(&mut self, filter: &DiscoveryFilter) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::NotLinked);
        }

        info!("Scanning for {} using service {}...", filter.device_name, filter.service);
        self.stop_discovery();

        let scan_cancel = self.cancel.child_token();
        self.scan_cancel = Some(scan_cancel.clone());

        let adapter = self.adapter.clone();
        let link = self.link.clone();
        let events = self.events.clone();
        self.spawn("scan", async move {
            if let Err(err) = scan(adapter, link, events.clone(), scan_cancel).await {
                events.send(LinkEvent::ScanFailed { reason: err.to_string() });
            }
            Ok(())
        });
        Ok(())
    }

    fn stop_discovery(&mut self) {
        if let Some(scan_cancel) = self.scan_cancel.take() {
            scan_cancel.cancel();
        }
    }

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::NotLinked);
        }

        let adapter = self.adapter.clone();
        let link = self.link.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let slot = self.slot.clone();
        let address = address.clone();
        let runtime = self.runtime.clone();

        self.spawn("connect", async move {
            let Some(peripheral) = link.lock().await.discovered.get(&address).cloned() else {
                events.send(LinkEvent::LinkFailed { reason: format!("unknown peripheral {}", address) });
                return Err(DeviceError::UnknownPeripheral { address: address.to_string() });
            };

            // wait until the previous link has finished disconnecting
            let claim = slot.claim().await;
            {
                let mut state = link.lock().await;
                state.peripheral = Some(peripheral.clone());
                state.claim = Some(claim);
            }

            let central_events = match adapter.events().await {
                Ok(central_events) => central_events,
                Err(err) => {
                    events.send(LinkEvent::LinkFailed { reason: err.to_string() });
                    return Err(err.into());
                },
            };
            let disconnects = central_events.filter_map(|event| ready(match event {
                CentralEvent::DeviceDisconnected(id) => Some(id),
                _ => None,
            }));

            info!("Connecting to peripheral {}...", address);
            if let Err(err) = peripheral.connect().await {
                events.send(LinkEvent::LinkFailed { reason: err.to_string() });
                return Ok(());
            }

            runtime.spawn(watch_disconnect(disconnects, peripheral.id(), events.clone(), cancel));
            events.send(LinkEvent::LinkEstablished);
            Ok(())
        });
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::NotLinked);
        }

        let link = self.link.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let service_uuid = self.service_uuid;
        let characteristic_uuid = self.characteristic_uuid;
        let runtime = self.runtime.clone();

        self.spawn("discover services", async move {
            let Some(peripheral) = link.lock().await.peripheral.clone() else {
                events.send(LinkEvent::ServicesDiscovered { success: false });
                return Err(DeviceError::NotLinked);
            };

            info!("Connected; Discovering services...");
            let found = match peripheral.discover_services().await {
                Ok(()) => receive_characteristic(peripheral.services(), service_uuid, characteristic_uuid),
                Err(err) => Err(err.into()),
            };
            let characteristic = match found {
                Ok(characteristic) => characteristic,
                Err(err) => {
                    events.send(LinkEvent::ServicesDiscovered { success: false });
                    return Err(err);
                },
            };

            // the device also pushes values on its own when it supports notifications
            if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                let reader = read_notifications(peripheral.clone(), characteristic.clone(), events.clone(), cancel);
                runtime.spawn(async move {
                    if let Err(err) = reader.await {
                        warn!("Reading notifications failed: {}", err);
                    }
                });
            }

            link.lock().await.characteristic = Some(characteristic);
            events.send(LinkEvent::ServicesDiscovered { success: true });
            Ok(())
        });
        Ok(())
    }

    fn read_characteristic(&mut self, id: Uuid) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::NotLinked);
        }

        let link = self.link.clone();
        let events = self.events.clone();

        self.spawn("read", async move {
            let target = {
                let state = link.lock().await;
                let characteristic = state.characteristic.clone().filter(|characteristic| characteristic.uuid == id);
                state.peripheral.clone().zip(characteristic)
            };
            let Some((peripheral, characteristic)) = target else {
                events.send(LinkEvent::LinkDropped);
                return Err(DeviceError::MissingCharacteristic);
            };

            match peripheral.read(&characteristic).await {
                Ok(value) => {
                    debug!("Characteristic value: {:?}", value);
                    events.send(LinkEvent::ValueRead(value));
                    Ok(())
                },
                Err(err) => {
                    // on a healthy link the next poll simply tries again
                    if !peripheral.is_connected().await.unwrap_or(false) {
                        events.send(LinkEvent::LinkDropped);
                    }
                    Err(err.into())
                },
            }
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop_discovery();

        let link = self.link.clone();
        self.runtime.spawn(async move {
            let (peripheral, claim) = {
                let mut state = link.lock().await;
                state.characteristic = None;
                (state.peripheral.take(), state.claim.take())
            };
            if let Some(peripheral) = peripheral {
                if let Err(err) = peripheral.disconnect().await {
                    debug!("Disconnecting failed: {:?}", err);
                }
            }
            // only now may the next link connect
            drop(claim);
        });
    }

    fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }

        self.disconnect();
        self.cancel.cancel();
    }
}

impl Drop for BtleRadio {
    fn drop(&mut self) {
        self.close();
    }
}
