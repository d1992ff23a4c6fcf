use std::sync::Arc;

use devbox_events::{
    BootstrapEvent, BootstrapStatus, Delivery, EventBus, InstallerEvent, InstallerLogEvent,
    InstallerStatus, Subscriber, Subscription,
};
use parking_lot::Mutex;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordedEvent {
    Bootstrap(BootstrapEvent),
    Installer(InstallerEvent),
    Log(InstallerLogEvent),
}

/// Captures every bootstrap, installer and log event published on a bus,
/// in publish order, until dropped.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    _subscriptions: Vec<Subscription>,
}

#[derive(Clone)]
struct Sink(Arc<Mutex<Vec<RecordedEvent>>>);

impl Subscriber<BootstrapEvent> for Sink {
    fn on_event(&self, event: &BootstrapEvent) -> Delivery {
        self.0.lock().push(RecordedEvent::Bootstrap(event.clone()));
        Delivery::Keep
    }
}

impl Subscriber<InstallerEvent> for Sink {
    fn on_event(&self, event: &InstallerEvent) -> Delivery {
        self.0.lock().push(RecordedEvent::Installer(event.clone()));
        Delivery::Keep
    }
}

impl Subscriber<InstallerLogEvent> for Sink {
    fn on_event(&self, event: &InstallerLogEvent) -> Delivery {
        self.0.lock().push(RecordedEvent::Log(event.clone()));
        Delivery::Keep
    }
}

impl EventRecorder {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Sink(events.clone());
        let subscriptions = vec![
            bus.subscribe::<BootstrapEvent, _>(sink.clone()),
            bus.subscribe::<InstallerEvent, _>(sink.clone()),
            bus.subscribe::<InstallerLogEvent, _>(sink),
        ];
        Self {
            events,
            _subscriptions: subscriptions,
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn bootstrap_events(&self) -> Vec<BootstrapEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Bootstrap(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn installer_events(&self) -> Vec<InstallerEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Installer(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn log_events(&self) -> Vec<InstallerLogEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Log(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn bootstrap_statuses(&self) -> Vec<BootstrapStatus> {
        self.bootstrap_events()
            .into_iter()
            .map(|event| event.status)
            .collect()
    }

    /// `(installer id, status)` pairs in publish order.
    pub fn installer_statuses(&self) -> Vec<(String, InstallerStatus)> {
        self.installer_events()
            .into_iter()
            .map(|event| (event.installer_id, event.status))
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.bootstrap_events()
            .iter()
            .filter(|event| event.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_events::{MachineRef, RuntimeIdentity};

    #[test]
    fn records_in_publish_order_until_dropped() {
        let bus = EventBus::new();
        let machine = MachineRef::new("dev", RuntimeIdentity::new("ws", "env", "owner"));
        let recorder = EventRecorder::attach(&bus);

        bus.publish(BootstrapEvent::available(machine.clone()));
        bus.publish(InstallerEvent::starting(machine.clone(), "git"));
        bus.publish(BootstrapEvent::done(machine.clone()));

        assert_eq!(recorder.events().len(), 3);
        assert_eq!(
            recorder.bootstrap_statuses(),
            vec![BootstrapStatus::Available, BootstrapStatus::Done]
        );
        assert_eq!(recorder.terminal_count(), 1);

        drop(recorder);
        assert_eq!(bus.subscriber_count::<BootstrapEvent>(), 0);
        assert_eq!(bus.subscriber_count::<InstallerLogEvent>(), 0);
    }
}
