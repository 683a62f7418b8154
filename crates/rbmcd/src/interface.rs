//! The published Redundancy object.
//!
//! Holds the four published properties and fans property changes and the
//! heartbeat pulse out to every subscribed connection. The
//! DisableRedundancyOverride value survives restarts; the rest is derived
//! state and starts over each boot.

use rbmc_common::ipc::{property, PropertyMap, Signal};
use rbmc_common::store::{key, Store};
use rbmc_common::types::Role;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
struct Props {
    role: Role,
    redundancy_enabled: bool,
    failovers_allowed: bool,
    disable_redundancy_override: bool,
}

pub struct RedundancyInterface {
    props: RwLock<Props>,
    signals: broadcast::Sender<Signal>,
    store: Store,
}

impl RedundancyInterface {
    pub fn new(store: Store) -> Self {
        let disable_redundancy_override =
            store.read::<bool>(key::DISABLE_RED).unwrap_or(false);

        let (signals, _) = broadcast::channel(64);

        RedundancyInterface {
            props: RwLock::new(Props {
                role: Role::Unknown,
                redundancy_enabled: false,
                failovers_allowed: false,
                disable_redundancy_override,
            }),
            signals,
            store,
        }
    }

    pub fn role(&self) -> Role {
        self.props.read().unwrap().role
    }

    pub fn set_role(&self, role: Role) {
        let changed = {
            let mut props = self.props.write().unwrap();
            let changed = props.role != role;
            props.role = role;
            changed
        };
        if changed {
            self.publish(property::ROLE, serde_json::json!(u8::from(role)));
        }
    }

    pub fn redundancy_enabled(&self) -> bool {
        self.props.read().unwrap().redundancy_enabled
    }

    pub fn set_redundancy_enabled(&self, enabled: bool) {
        let changed = {
            let mut props = self.props.write().unwrap();
            let changed = props.redundancy_enabled != enabled;
            props.redundancy_enabled = enabled;
            changed
        };
        if changed {
            info!(enabled, "RedundancyEnabled changed");
            self.publish(property::REDUNDANCY_ENABLED, serde_json::json!(enabled));
        }
    }

    pub fn failovers_allowed(&self) -> bool {
        self.props.read().unwrap().failovers_allowed
    }

    pub fn set_failovers_allowed(&self, allowed: bool) {
        let changed = {
            let mut props = self.props.write().unwrap();
            let changed = props.failovers_allowed != allowed;
            props.failovers_allowed = allowed;
            changed
        };
        if changed {
            info!(allowed, "FailoversAllowed changed");
            self.publish(property::FAILOVERS_ALLOWED, serde_json::json!(allowed));
        }
    }

    pub fn disable_redundancy_override(&self) -> bool {
        self.props.read().unwrap().disable_redundancy_override
    }

    /// Records an accepted override change. The policy checks live in the
    /// manager; by the time this runs the new value is a fact to persist
    /// and publish.
    pub fn set_disable_redundancy_override(&self, disable: bool) {
        {
            let mut props = self.props.write().unwrap();
            props.disable_redundancy_override = disable;
        }
        if let Err(e) = self.store.write(key::DISABLE_RED, &disable) {
            error!(error = %e, "Could not serialize DisableRedundancyOverride");
        }
        self.publish(
            property::DISABLE_REDUNDANCY_OVERRIDE,
            serde_json::json!(disable),
        );
    }

    /// Emits one liveness pulse.
    pub fn heartbeat(&self) {
        let _ = self.signals.send(Signal::Heartbeat);
    }

    pub fn property_map(&self) -> PropertyMap {
        let props = *self.props.read().unwrap();
        let mut map = PropertyMap::new();
        map.insert(
            property::ROLE.into(),
            serde_json::json!(u8::from(props.role)),
        );
        map.insert(
            property::REDUNDANCY_ENABLED.into(),
            serde_json::json!(props.redundancy_enabled),
        );
        map.insert(
            property::FAILOVERS_ALLOWED.into(),
            serde_json::json!(props.failovers_allowed),
        );
        map.insert(
            property::DISABLE_REDUNDANCY_OVERRIDE.into(),
            serde_json::json!(props.disable_redundancy_override),
        );
        map
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    fn publish(&self, name: &str, value: serde_json::Value) {
        let mut properties = PropertyMap::new();
        properties.insert(name.to_string(), value);
        let _ = self.signals.send(Signal::PropertiesChanged { properties });
    }
}
