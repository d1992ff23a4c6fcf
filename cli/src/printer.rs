use std::io::Write;

use devbox_events::{
    BootstrapEvent, Delivery, EventBus, InstallerEvent, InstallerLogEvent, Subscriber,
    Subscription,
};
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Bootstrap(&'a BootstrapEvent),
    Installer(&'a InstallerEvent),
    InstallerLog(&'a InstallerLogEvent),
}

/// Writes every event on the bus to stdout as one JSON object per line.
#[derive(Clone, Copy)]
struct JsonLines;

impl JsonLines {
    fn emit(&self, line: &Line<'_>) {
        match serde_json::to_string(line) {
            Ok(json) => {
                let mut out = std::io::stdout().lock();
                if let Err(err) = writeln!(out, "{json}").and_then(|()| out.flush()) {
                    warn!("failed to write event: {err}");
                }
            }
            Err(err) => warn!("failed to encode event: {err}"),
        }
    }
}

impl Subscriber<BootstrapEvent> for JsonLines {
    fn on_event(&self, event: &BootstrapEvent) -> Delivery {
        self.emit(&Line::Bootstrap(event));
        Delivery::Keep
    }
}

impl Subscriber<InstallerEvent> for JsonLines {
    fn on_event(&self, event: &InstallerEvent) -> Delivery {
        self.emit(&Line::Installer(event));
        Delivery::Keep
    }
}

impl Subscriber<InstallerLogEvent> for JsonLines {
    fn on_event(&self, event: &InstallerLogEvent) -> Delivery {
        self.emit(&Line::InstallerLog(event));
        Delivery::Keep
    }
}

pub fn attach(bus: &EventBus) -> Vec<Subscription> {
    vec![
        bus.subscribe::<BootstrapEvent, _>(JsonLines),
        bus.subscribe::<InstallerEvent, _>(JsonLines),
        bus.subscribe::<InstallerLogEvent, _>(JsonLines),
    ]
}
