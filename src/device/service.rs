use std::future::pending;
use futures::channel::mpsc::{channel, Sender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::manager::SessionManager;
use crate::device::radio::LinkInbox;
use crate::error::SessionError;

pub enum SessionCommand {
    StartScan {
        simulated: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Poll,
    Disconnect,
    Close,
}

/// Cheap to clone handle to a running `session_service`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        self.sender.send(command).await.map_err(|_| SessionError::ServiceStopped)
    }

    /// Returns once the new session has been started, so that `RadioUnavailable` reaches the
    /// caller directly.
    pub async fn start_scan(&mut self, simulated: bool) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::StartScan { simulated, reply }).await?;
        response.await.map_err(|_| SessionError::ServiceStopped)?
    }

    pub async fn poll(&mut self) -> Result<(), SessionError> {
        self.send(SessionCommand::Poll).await
    }

    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.send(SessionCommand::Close).await
    }
}

/// Sleeps until `deadline`, or forever if there is none.
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

fn execute(manager: &mut SessionManager, command: SessionCommand) {
    match command {
        SessionCommand::StartScan { simulated, reply } => {
            let result = manager.start_scan(simulated);
            if reply.send(result).is_err() {
                debug!("Caller of start_scan is gone");
            }
        },
        SessionCommand::Poll => {
            // failures have already been reported as events
            if let Err(err) = manager.poll() {
                debug!("Poll failed: {}", err);
            }
        },
        SessionCommand::Disconnect => manager.disconnect(),
        SessionCommand::Close => manager.close(),
    }
}

/// Runs the manager on its own task. This task is the only one that ever touches the manager, so
/// commands, link events and timeouts are handled strictly one after the other.
pub fn session_service(cancel: CancellationToken, mut manager: SessionManager, mut inbox: LinkInbox) -> (SessionHandle, JoinHandle<()>) {
    let (sender, mut receiver) = channel::<SessionCommand>(16);

    let handle = spawn(async move {
        'mainloop: loop {
            let deadline = manager.deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = receiver.next() => match command {
                    Some(command) => execute(&mut manager, command),
                    None => break 'mainloop,
                },
                Some(tagged) = inbox.next() => {
                    manager.dispatch(tagged);
                },
                _ = wait_until(deadline) => {
                    manager.tick(Instant::now());
                },
            }
        }

        manager.close();
        info!("Session service stopped");
    });

    (SessionHandle { sender }, handle)
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc::unbounded;
    use super::*;
    use crate::config::types::DeviceConfig;
    use crate::device::manager::EventEnvelope;
    use crate::device::radio::{LinkEventSender, RadioLink, RadioProvider};
    use crate::device::types::DeviceEvent;
    use crate::error::DeviceError;

    struct NoRadio;

    impl RadioProvider for NoRadio {
        fn open(&mut self, _events: LinkEventSender) -> Result<Box<dyn RadioLink>, DeviceError> {
            Err(DeviceError::AdapterUnavailable)
        }
    }

    #[tokio::test]
    async fn commands_are_executed_in_order() {
        let (sink, mut events) = unbounded::<EventEnvelope>();
        let (manager, inbox) = SessionManager::new(DeviceConfig::default(), Box::new(NoRadio), Box::new(sink));
        let cancel = CancellationToken::new();
        let (mut handle, join) = session_service(cancel.clone(), manager, inbox);

        assert!(handle.start_scan(false).await.unwrap_err().is_radio_unavailable());

        handle.start_scan(true).await.unwrap();
        handle.poll().await.unwrap();
        handle.disconnect().await.unwrap();

        assert!(matches!(events.next().await.unwrap().event, DeviceEvent::Connected { .. }));
        assert!(matches!(events.next().await.unwrap().event, DeviceEvent::ValueAvailable { .. }));
        assert!(matches!(events.next().await.unwrap().event, DeviceEvent::NotConnected { .. }));

        cancel.cancel();
        join.await.unwrap();
        assert!(matches!(handle.poll().await, Err(SessionError::ServiceStopped)));
    }
}
