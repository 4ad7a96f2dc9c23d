use std::collections::HashMap;

use crate::element::{BatteryId, BusId, ChildRef, ConsumerId, ParentRef};
use crate::manager::CircuitManager;

pub type ChildSwitchHandler = Box<dyn FnMut(ChildRef)>;
pub type ParentSwitchHandler = Box<dyn FnMut(ParentRef)>;
pub type ConsumerHandler = Box<dyn FnMut(ConsumerId)>;
pub type SourceLoadHandler = Box<dyn FnMut(ParentRef)>;
pub type BatteryHandler = Box<dyn FnMut(BatteryId)>;
pub type BusHandler = Box<dyn FnMut(BusId)>;

/// One state transition observed during a tick or at a switch setter.
/// Events are edge-triggered: they are only raised when the observable
/// actually crossed its boundary.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Event {
    ChildSwitchIn(ChildRef),
    ChildSwitchOut(ChildRef),
    ParentSwitchIn(ParentRef),
    ParentSwitchOut(ParentRef),
    RunningChange(ConsumerId),
    ConsumerLoadChange(ConsumerId),
    SourceLoadChange(ParentRef),
    ChargeLow(BatteryId),
    ChargeEmpty(BatteryId),
    ThroughputChange(BusId),
    MaxCurrentHigh(BusId),
    MaxCurrentOk(BusId),
}

/// Registered callbacks, one slot per event per element. Registering
/// again replaces the previous handler; registering `None` removes it.
#[derive(Default)]
pub(crate) struct EventHandlers {
    child_switch_in: HashMap<ChildRef, ChildSwitchHandler>,
    child_switch_out: HashMap<ChildRef, ChildSwitchHandler>,
    parent_switch_in: HashMap<ParentRef, ParentSwitchHandler>,
    parent_switch_out: HashMap<ParentRef, ParentSwitchHandler>,
    running_change: HashMap<ConsumerId, ConsumerHandler>,
    consumer_load_change: HashMap<ConsumerId, ConsumerHandler>,
    source_load_change: HashMap<ParentRef, SourceLoadHandler>,
    charge_low: HashMap<BatteryId, BatteryHandler>,
    charge_empty: HashMap<BatteryId, BatteryHandler>,
    throughput_change: HashMap<BusId, BusHandler>,
    max_current_high: HashMap<BusId, BusHandler>,
    max_current_ok: HashMap<BusId, BusHandler>,
}

fn set<K: std::hash::Hash + Eq, H>(slots: &mut HashMap<K, H>, key: K, handler: Option<H>) {
    match handler {
        Some(handler) => {
            slots.insert(key, handler);
        }
        None => {
            slots.remove(&key);
        }
    }
}

impl EventHandlers {
    pub(crate) fn fire(&mut self, event: Event) {
        match event {
            Event::ChildSwitchIn(child) => {
                if let Some(handler) = self.child_switch_in.get_mut(&child) {
                    handler(child);
                }
            }
            Event::ChildSwitchOut(child) => {
                if let Some(handler) = self.child_switch_out.get_mut(&child) {
                    handler(child);
                }
            }
            Event::ParentSwitchIn(parent) => {
                if let Some(handler) = self.parent_switch_in.get_mut(&parent) {
                    handler(parent);
                }
            }
            Event::ParentSwitchOut(parent) => {
                if let Some(handler) = self.parent_switch_out.get_mut(&parent) {
                    handler(parent);
                }
            }
            Event::RunningChange(consumer) => {
                if let Some(handler) = self.running_change.get_mut(&consumer) {
                    handler(consumer);
                }
            }
            Event::ConsumerLoadChange(consumer) => {
                if let Some(handler) = self.consumer_load_change.get_mut(&consumer) {
                    handler(consumer);
                }
            }
            Event::SourceLoadChange(parent) => {
                if let Some(handler) = self.source_load_change.get_mut(&parent) {
                    handler(parent);
                }
            }
            Event::ChargeLow(battery) => {
                if let Some(handler) = self.charge_low.get_mut(&battery) {
                    handler(battery);
                }
            }
            Event::ChargeEmpty(battery) => {
                if let Some(handler) = self.charge_empty.get_mut(&battery) {
                    handler(battery);
                }
            }
            Event::ThroughputChange(bus) => {
                if let Some(handler) = self.throughput_change.get_mut(&bus) {
                    handler(bus);
                }
            }
            Event::MaxCurrentHigh(bus) => {
                if let Some(handler) = self.max_current_high.get_mut(&bus) {
                    handler(bus);
                }
            }
            Event::MaxCurrentOk(bus) => {
                if let Some(handler) = self.max_current_ok.get_mut(&bus) {
                    handler(bus);
                }
            }
        }
    }
}

fn assert_switchable_child(child: ChildRef) {
    if let ChildRef::Bus(_) = child {
        panic!("a bus cannot be switched; switch events cannot be registered on it");
    }
}

fn assert_switchable_parent(parent: ParentRef) {
    if let ParentRef::Bus(_) = parent {
        panic!("a bus cannot be switched; switch events cannot be registered on it");
    }
}

/// Event subscription. Handlers are invoked synchronously: switch events
/// directly from the setter that flipped the switch, everything else at
/// the end of `evaluate`, after the tick's numeric state is final.
/// Handlers must not mutate the topology or re-enter `evaluate`.
impl CircuitManager {
    /// # Panics
    /// When `child` refers to a bus; buses are passive conductors.
    pub fn on_child_switch_in(
        &mut self,
        child: impl Into<ChildRef>,
        handler: Option<ChildSwitchHandler>,
    ) {
        let child = child.into();
        assert_switchable_child(child);
        set(&mut self.handlers.child_switch_in, child, handler);
    }

    /// # Panics
    /// When `child` refers to a bus; buses are passive conductors.
    pub fn on_child_switch_out(
        &mut self,
        child: impl Into<ChildRef>,
        handler: Option<ChildSwitchHandler>,
    ) {
        let child = child.into();
        assert_switchable_child(child);
        set(&mut self.handlers.child_switch_out, child, handler);
    }

    /// # Panics
    /// When `parent` refers to a bus; buses are passive conductors.
    pub fn on_parent_switch_in(
        &mut self,
        parent: impl Into<ParentRef>,
        handler: Option<ParentSwitchHandler>,
    ) {
        let parent = parent.into();
        assert_switchable_parent(parent);
        set(&mut self.handlers.parent_switch_in, parent, handler);
    }

    /// # Panics
    /// When `parent` refers to a bus; buses are passive conductors.
    pub fn on_parent_switch_out(
        &mut self,
        parent: impl Into<ParentRef>,
        handler: Option<ParentSwitchHandler>,
    ) {
        let parent = parent.into();
        assert_switchable_parent(parent);
        set(&mut self.handlers.parent_switch_out, parent, handler);
    }

    /// Raised when the consumer's `running` state flips.
    pub fn on_running_change(&mut self, consumer: ConsumerId, handler: Option<ConsumerHandler>) {
        set(&mut self.handlers.running_change, consumer, handler);
    }

    /// Raised when the load honored for the consumer differs from the
    /// previous tick, whether through the host or through shedding.
    pub fn on_consumer_load_change(
        &mut self,
        consumer: ConsumerId,
        handler: Option<ConsumerHandler>,
    ) {
        set(&mut self.handlers.consumer_load_change, consumer, handler);
    }

    /// Raised when a feed's delivered output current differs from the
    /// previous tick. Only feeds taking part in the tick report; a feed
    /// dropping out of its circuit zeroes its output silently.
    ///
    /// # Panics
    /// When `parent` refers to a bus.
    pub fn on_source_load_change(
        &mut self,
        parent: impl Into<ParentRef>,
        handler: Option<SourceLoadHandler>,
    ) {
        let parent = parent.into();
        assert_switchable_parent(parent);
        set(&mut self.handlers.source_load_change, parent, handler);
    }

    /// Raised on the downward crossing of the battery's low-charge level;
    /// re-armed when the charge recovers above it.
    pub fn on_charge_low(&mut self, battery: BatteryId, handler: Option<BatteryHandler>) {
        set(&mut self.handlers.charge_low, battery, handler);
    }

    pub fn on_charge_empty(&mut self, battery: BatteryId, handler: Option<BatteryHandler>) {
        set(&mut self.handlers.charge_empty, battery, handler);
    }

    pub fn on_current_throughput_change(&mut self, bus: BusId, handler: Option<BusHandler>) {
        set(&mut self.handlers.throughput_change, bus, handler);
    }

    pub fn on_max_current_high(&mut self, bus: BusId, handler: Option<BusHandler>) {
        set(&mut self.handlers.max_current_high, bus, handler);
    }

    pub fn on_max_current_ok(&mut self, bus: BusId, handler: Option<BusHandler>) {
        set(&mut self.handlers.max_current_ok, bus, handler);
    }
}
