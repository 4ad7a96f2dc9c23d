use itertools::Itertools;
use uom::si::{electric_current::ampere, f64::*, ratio::ratio};

use crate::battery::{Battery, BatterySpec, BatteryState};
use crate::bus::Bus;
use crate::circuit::Circuit;
use crate::consumer::Consumer;
use crate::converter::Converter;
use crate::element::{
    BatteryId, BusId, ChildRef, ConsumerId, ConverterId, ParentRef, SourceId, VoltageRange,
};
use crate::error::ConnectError;
use crate::event::{Event, EventHandlers};
use crate::source::Source;

/// Owns every element of the network and its partitioning into circuits.
///
/// Elements are created through the `add_*` methods and addressed by the
/// returned ids. Connecting and disconnecting maintains the circuit
/// partitions: a bus-to-bus connect unions two circuits, a disconnect
/// splits along connected components. [`evaluate`](Self::evaluate)
/// advances the whole network by one tick.
pub struct CircuitManager {
    pub(crate) consumers: Vec<Option<Consumer>>,
    pub(crate) sources: Vec<Option<Source>>,
    pub(crate) batteries: Vec<Option<Battery>>,
    pub(crate) converters: Vec<Option<Converter>>,
    pub(crate) buses: Vec<Option<Bus>>,
    pub(crate) circuits: Vec<Circuit>,
    pub(crate) handlers: EventHandlers,
}

impl CircuitManager {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
            sources: Vec::new(),
            batteries: Vec::new(),
            converters: Vec::new(),
            buses: Vec::new(),
            circuits: Vec::new(),
            handlers: EventHandlers::default(),
        }
    }

    // --- element registration ---

    pub fn add_consumer(
        &mut self,
        operating_range: VoltageRange,
        nominal_power: Power,
        location_id: u32,
    ) -> ConsumerId {
        let id = ConsumerId(self.consumers.len());
        self.consumers
            .push(Some(Consumer::new(id, operating_range, nominal_power, location_id)));
        id
    }

    pub fn add_source(
        &mut self,
        operating_range: VoltageRange,
        max_power: Power,
        internal_resistance: ElectricalResistance,
        location_id: u32,
    ) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(Some(Source::new(
            id,
            operating_range,
            max_power,
            internal_resistance,
            location_id,
        )));
        id
    }

    pub fn add_battery(&mut self, spec: BatterySpec) -> BatteryId {
        let id = BatteryId(self.batteries.len());
        self.batteries.push(Some(Battery::new(id, spec)));
        id
    }

    pub fn add_converter(
        &mut self,
        operating_range: VoltageRange,
        max_power: Power,
        conversion_efficiency: Ratio,
        internal_resistance: ElectricalResistance,
    ) -> ConverterId {
        let id = ConverterId(self.converters.len());
        self.converters.push(Some(Converter::new(
            id,
            operating_range,
            max_power,
            conversion_efficiency,
            internal_resistance,
        )));
        id
    }

    /// # Panics
    /// When `voltage` is not positive; a bus defines the voltage of its
    /// surroundings and cannot do so at zero volts.
    pub fn add_bus(&mut self, voltage: ElectricPotential, max_current: ElectricCurrent) -> BusId {
        let id = BusId(self.buses.len());
        self.buses.push(Some(Bus::new(id, voltage, max_current)));
        // Every bus starts out as its own circuit.
        self.circuits.push(Circuit::new(voltage, id));
        id
    }

    // --- element access ---

    pub fn consumer(&self, id: ConsumerId) -> &Consumer {
        self.consumers[id.0].as_ref().expect("consumer was removed")
    }

    pub fn source(&self, id: SourceId) -> &Source {
        self.sources[id.0].as_ref().expect("source was removed")
    }

    pub fn battery(&self, id: BatteryId) -> &Battery {
        self.batteries[id.0].as_ref().expect("battery was removed")
    }

    pub fn converter(&self, id: ConverterId) -> &Converter {
        self.converters[id.0].as_ref().expect("converter was removed")
    }

    pub fn bus(&self, id: BusId) -> &Bus {
        self.buses[id.0].as_ref().expect("bus was removed")
    }

    pub(crate) fn consumer_mut(&mut self, id: ConsumerId) -> &mut Consumer {
        self.consumers[id.0].as_mut().expect("consumer was removed")
    }

    pub(crate) fn source_mut(&mut self, id: SourceId) -> &mut Source {
        self.sources[id.0].as_mut().expect("source was removed")
    }

    pub(crate) fn battery_mut(&mut self, id: BatteryId) -> &mut Battery {
        self.batteries[id.0].as_mut().expect("battery was removed")
    }

    pub(crate) fn converter_mut(&mut self, id: ConverterId) -> &mut Converter {
        self.converters[id.0].as_mut().expect("converter was removed")
    }

    pub(crate) fn bus_mut(&mut self, id: BusId) -> &mut Bus {
        self.buses[id.0].as_mut().expect("bus was removed")
    }

    // --- circuits ---

    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }

    pub fn size(&self) -> usize {
        self.circuits.len()
    }

    pub fn circuit_containing(&self, bus: BusId) -> Option<&Circuit> {
        self.circuits.iter().find(|circuit| circuit.contains_bus(bus))
    }

    pub(crate) fn circuit_index_of_bus(&self, bus: BusId) -> usize {
        self.circuits
            .iter()
            .position(|circuit| circuit.contains_bus(bus))
            .expect("bus belongs to no circuit")
    }

    // --- connection protocol ---

    /// The pure connection check: kind pairing, voltage windows, location,
    /// cardinality and acyclicity, without mutating anything.
    pub fn can_connect(&self, parent: impl Into<ParentRef>, child: impl Into<ChildRef>) -> bool {
        self.check_connect(parent.into(), child.into()).is_ok()
    }

    /// Installs the edge between a parent face and a child face. The edge
    /// is a single record serving both directions. On failure nothing is
    /// mutated.
    pub fn connect(
        &mut self,
        parent: impl Into<ParentRef>,
        child: impl Into<ChildRef>,
    ) -> Result<(), ConnectError> {
        let (parent, child) = (parent.into(), child.into());
        self.check_connect(parent, child)?;
        match (parent, child) {
            (ParentRef::Source(source), ChildRef::Bus(bus)) => {
                self.source_mut(source).child = Some(bus);
                self.bus_mut(bus).parents.push(ParentRef::Source(source));
            }
            (ParentRef::Battery(battery), ChildRef::Bus(bus))
            | (ParentRef::Bus(bus), ChildRef::Battery(battery)) => {
                // A battery occupies both faces of its bus at once.
                self.battery_mut(battery).bus = Some(bus);
                self.bus_mut(bus).parents.push(ParentRef::Battery(battery));
                self.bus_mut(bus).children.push(ChildRef::Battery(battery));
            }
            (ParentRef::Converter(converter), ChildRef::Bus(bus)) => {
                self.converter_mut(converter).child = Some(bus);
                self.bus_mut(bus)
                    .parents
                    .push(ParentRef::Converter(converter));
            }
            (ParentRef::Bus(bus), ChildRef::Consumer(consumer)) => {
                self.consumer_mut(consumer).parent = Some(bus);
                self.bus_mut(bus).children.push(ChildRef::Consumer(consumer));
            }
            (ParentRef::Bus(bus), ChildRef::Converter(converter)) => {
                self.converter_mut(converter).parent = Some(bus);
                self.bus_mut(bus)
                    .children
                    .push(ChildRef::Converter(converter));
            }
            (ParentRef::Bus(parent_bus), ChildRef::Bus(child_bus)) => {
                self.bus_mut(parent_bus).children.push(ChildRef::Bus(child_bus));
                self.bus_mut(child_bus).parents.push(ParentRef::Bus(parent_bus));
                self.merge_circuits(parent_bus, child_bus);
            }
            _ => unreachable!("checked by check_connect"),
        }
        self.refresh_all_members();
        Ok(())
    }

    /// Severs the edge between a parent face and a child face, zeroing the
    /// live currents of the detached element. Severing a bus-to-bus edge
    /// repartitions the circuit into its connected components.
    pub fn disconnect(
        &mut self,
        parent: impl Into<ParentRef>,
        child: impl Into<ChildRef>,
    ) -> Result<(), ConnectError> {
        let (parent, child) = (parent.into(), child.into());
        match (parent, child) {
            (ParentRef::Source(source), ChildRef::Bus(bus)) => {
                if self.source(source).child != Some(bus) {
                    return Err(ConnectError::NotConnected);
                }
                self.source_mut(source).child = None;
                self.bus_mut(bus)
                    .parents
                    .retain(|p| *p != ParentRef::Source(source));
                self.quiesce_source(source);
            }
            (ParentRef::Battery(battery), ChildRef::Bus(bus))
            | (ParentRef::Bus(bus), ChildRef::Battery(battery)) => {
                if self.battery(battery).bus != Some(bus) {
                    return Err(ConnectError::NotConnected);
                }
                self.battery_mut(battery).bus = None;
                self.bus_mut(bus)
                    .parents
                    .retain(|p| *p != ParentRef::Battery(battery));
                self.bus_mut(bus)
                    .children
                    .retain(|c| *c != ChildRef::Battery(battery));
                self.quiesce_battery(battery);
            }
            (ParentRef::Converter(converter), ChildRef::Bus(bus)) => {
                if self.converter(converter).child != Some(bus) {
                    return Err(ConnectError::NotConnected);
                }
                self.converter_mut(converter).child = None;
                self.bus_mut(bus)
                    .parents
                    .retain(|p| *p != ParentRef::Converter(converter));
                self.quiesce_converter(converter);
            }
            (ParentRef::Bus(bus), ChildRef::Consumer(consumer)) => {
                if self.consumer(consumer).parent != Some(bus) {
                    return Err(ConnectError::NotConnected);
                }
                self.consumer_mut(consumer).parent = None;
                self.bus_mut(bus)
                    .children
                    .retain(|c| *c != ChildRef::Consumer(consumer));
                self.quiesce_consumer(consumer);
            }
            (ParentRef::Bus(bus), ChildRef::Converter(converter)) => {
                if self.converter(converter).parent != Some(bus) {
                    return Err(ConnectError::NotConnected);
                }
                self.converter_mut(converter).parent = None;
                self.bus_mut(bus)
                    .children
                    .retain(|c| *c != ChildRef::Converter(converter));
                self.quiesce_converter(converter);
            }
            (ParentRef::Bus(parent_bus), ChildRef::Bus(child_bus)) => {
                if !self.bus(parent_bus).children.contains(&ChildRef::Bus(child_bus)) {
                    return Err(ConnectError::NotConnected);
                }
                self.bus_mut(parent_bus)
                    .children
                    .retain(|c| *c != ChildRef::Bus(child_bus));
                self.bus_mut(child_bus)
                    .parents
                    .retain(|p| *p != ParentRef::Bus(parent_bus));
                let circuit = self.circuit_index_of_bus(parent_bus);
                self.repartition_circuit(circuit);
            }
            _ => return Err(ConnectError::IncompatibleKinds),
        }
        self.refresh_all_members();
        Ok(())
    }

    // Typed conveniences over the generic protocol.

    pub fn connect_source_to_bus(&mut self, source: SourceId, bus: BusId) -> Result<(), ConnectError> {
        self.connect(source, bus)
    }

    pub fn connect_battery_to_bus(
        &mut self,
        battery: BatteryId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.connect(battery, bus)
    }

    pub fn connect_consumer_to_bus(
        &mut self,
        consumer: ConsumerId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.connect(bus, consumer)
    }

    pub fn connect_bus_to_bus(&mut self, parent: BusId, child: BusId) -> Result<(), ConnectError> {
        self.connect(parent, child)
    }

    /// Attaches the converter's input face to `bus`.
    pub fn connect_bus_to_converter(
        &mut self,
        bus: BusId,
        converter: ConverterId,
    ) -> Result<(), ConnectError> {
        self.connect(bus, converter)
    }

    /// Attaches the converter's output face to `bus`.
    pub fn connect_converter_to_bus(
        &mut self,
        converter: ConverterId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.connect(converter, bus)
    }

    pub fn disconnect_source_from_bus(
        &mut self,
        source: SourceId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.disconnect(source, bus)
    }

    pub fn disconnect_battery_from_bus(
        &mut self,
        battery: BatteryId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.disconnect(battery, bus)
    }

    pub fn disconnect_consumer_from_bus(
        &mut self,
        consumer: ConsumerId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.disconnect(bus, consumer)
    }

    pub fn disconnect_bus_from_bus(&mut self, parent: BusId, child: BusId) -> Result<(), ConnectError> {
        self.disconnect(parent, child)
    }

    pub fn disconnect_bus_from_converter(
        &mut self,
        bus: BusId,
        converter: ConverterId,
    ) -> Result<(), ConnectError> {
        self.disconnect(bus, converter)
    }

    pub fn disconnect_converter_from_bus(
        &mut self,
        converter: ConverterId,
        bus: BusId,
    ) -> Result<(), ConnectError> {
        self.disconnect(converter, bus)
    }

    fn check_connect(&self, parent: ParentRef, child: ChildRef) -> Result<(), ConnectError> {
        if !crate::element::locations_compatible(
            self.parent_location(parent),
            self.child_location(child),
        ) {
            return Err(ConnectError::LocationMismatch);
        }
        match (parent, child) {
            (ParentRef::Source(source), ChildRef::Bus(bus)) => {
                let source = self.source(source);
                let bus = self.bus(bus);
                if !source.operating_range.contains(bus.voltage) {
                    return Err(ConnectError::VoltageMismatch);
                }
                if source.child.is_some() {
                    return Err(ConnectError::AlreadyConnected);
                }
                Ok(())
            }
            (ParentRef::Battery(battery), ChildRef::Bus(bus))
            | (ParentRef::Bus(bus), ChildRef::Battery(battery)) => {
                let battery = self.battery(battery);
                let bus = self.bus(bus);
                if !battery.operating_range.contains(bus.voltage) {
                    return Err(ConnectError::VoltageMismatch);
                }
                if battery.bus.is_some() {
                    return Err(ConnectError::AlreadyConnected);
                }
                Ok(())
            }
            (ParentRef::Bus(bus), ChildRef::Consumer(consumer)) => {
                let consumer = self.consumer(consumer);
                let bus = self.bus(bus);
                if !consumer.operating_range.contains(bus.voltage) {
                    return Err(ConnectError::VoltageMismatch);
                }
                if consumer.parent.is_some() {
                    return Err(ConnectError::AlreadyConnected);
                }
                Ok(())
            }
            (ParentRef::Bus(bus), ChildRef::Converter(converter)) => {
                let converter_ref = self.converter(converter);
                let bus_ref = self.bus(bus);
                if !converter_ref.operating_range.contains(bus_ref.voltage) {
                    return Err(ConnectError::VoltageMismatch);
                }
                if converter_ref.parent.is_some() {
                    return Err(ConnectError::AlreadyConnected);
                }
                if let Some(output_bus) = converter_ref.child {
                    self.check_feed_acyclic(bus, output_bus)?;
                }
                Ok(())
            }
            (ParentRef::Converter(converter), ChildRef::Bus(bus)) => {
                let converter_ref = self.converter(converter);
                let bus_ref = self.bus(bus);
                if !converter_ref.operating_range.contains(bus_ref.voltage) {
                    return Err(ConnectError::VoltageMismatch);
                }
                if converter_ref.child.is_some() {
                    return Err(ConnectError::AlreadyConnected);
                }
                if let Some(input_bus) = converter_ref.parent {
                    self.check_feed_acyclic(input_bus, bus)?;
                }
                Ok(())
            }
            (ParentRef::Bus(parent_bus), ChildRef::Bus(child_bus)) => {
                if parent_bus == child_bus {
                    return Err(ConnectError::SelfConnection);
                }
                if self.bus(parent_bus).voltage != self.bus(child_bus).voltage {
                    return Err(ConnectError::VoltageMismatch);
                }
                // The undirected bus graph stays a forest: a second path
                // between two buses of one circuit would close a cycle.
                if self.circuit_index_of_bus(parent_bus) == self.circuit_index_of_bus(child_bus) {
                    return Err(ConnectError::WouldCycle);
                }
                Ok(())
            }
            _ => Err(ConnectError::IncompatibleKinds),
        }
    }

    /// Buses and converters are global; everything else is bound to its
    /// location.
    fn parent_location(&self, parent: ParentRef) -> Option<u32> {
        match parent {
            ParentRef::Source(source) => Some(self.source(source).location_id),
            ParentRef::Battery(battery) => Some(self.battery(battery).location_id),
            ParentRef::Converter(_) | ParentRef::Bus(_) => None,
        }
    }

    fn child_location(&self, child: ChildRef) -> Option<u32> {
        match child {
            ChildRef::Consumer(consumer) => Some(self.consumer(consumer).location_id),
            ChildRef::Battery(battery) => Some(self.battery(battery).location_id),
            ChildRef::Converter(_) | ChildRef::Bus(_) => None,
        }
    }

    /// Rejects a converter edge whose downstream circuit already feeds its
    /// upstream circuit (directly or through other converters).
    fn check_feed_acyclic(&self, input_bus: BusId, output_bus: BusId) -> Result<(), ConnectError> {
        let from = self.circuit_index_of_bus(input_bus);
        let to = self.circuit_index_of_bus(output_bus);
        if from == to || self.circuit_feeds(to, from) {
            return Err(ConnectError::WouldCycle);
        }
        Ok(())
    }

    /// True when circuit `from` reaches circuit `to` along converter feed
    /// edges.
    fn circuit_feeds(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut visited = vec![false; self.circuits.len()];
        visited[from] = true;
        while let Some(circuit) = stack.pop() {
            if circuit == to {
                return true;
            }
            for converter in self.converters.iter().flatten() {
                if let (Some(input_bus), Some(output_bus)) = (converter.parent, converter.child) {
                    if self.circuit_index_of_bus(input_bus) == circuit {
                        let next = self.circuit_index_of_bus(output_bus);
                        if !visited[next] {
                            visited[next] = true;
                            stack.push(next);
                        }
                    }
                }
            }
        }
        false
    }

    // --- partition maintenance ---

    fn merge_circuits(&mut self, parent_bus: BusId, child_bus: BusId) {
        let survivor = self.circuit_index_of_bus(parent_bus);
        let absorbed = self.circuit_index_of_bus(child_bus);
        debug_assert_ne!(survivor, absorbed);
        let buses = std::mem::take(&mut self.circuits[absorbed].buses);
        self.circuits[survivor].buses.extend(buses);
        self.circuits.remove(absorbed);
    }

    /// Re-runs connected components over the circuit's buses, replacing it
    /// with one circuit per emerging component.
    fn repartition_circuit(&mut self, circuit: usize) {
        let members = self.circuits[circuit].buses.clone();
        let mut unvisited: Vec<BusId> = members.clone();
        let mut components: Vec<Vec<BusId>> = Vec::new();
        while let Some(&start) = unvisited.first() {
            let mut component = vec![start];
            let mut stack = vec![start];
            unvisited.retain(|&b| b != start);
            while let Some(bus) = stack.pop() {
                let neighbors: Vec<BusId> = self.bus(bus).neighbor_buses().collect();
                for neighbor in neighbors {
                    if unvisited.contains(&neighbor) {
                        unvisited.retain(|&b| b != neighbor);
                        component.push(neighbor);
                        stack.push(neighbor);
                    }
                }
            }
            components.push(component);
        }
        let voltage = self.circuits[circuit].voltage;
        let mut components = components
            .into_iter()
            .sorted_by_key(|component| component.iter().min().copied())
            .collect::<Vec<_>>();
        self.circuits[circuit].buses = components.remove(0);
        for component in components {
            let root = component[0];
            let mut fresh = Circuit::new(voltage, root);
            fresh.buses = component;
            self.circuits.push(fresh);
        }
    }

    pub(crate) fn refresh_all_members(&mut self) {
        for circuit in 0..self.circuits.len() {
            self.refresh_members(circuit);
        }
    }

    /// Rebuilds the circuit's source/consumer lists and its per-feed
    /// subcircuit views from the buses' edge lists.
    pub(crate) fn refresh_members(&mut self, circuit: usize) {
        let buses = self.circuits[circuit].buses.clone();
        let mut sources = Vec::new();
        let mut consumers = Vec::new();
        for &bus in &buses {
            for parent in &self.bus(bus).parents {
                if !matches!(parent, ParentRef::Bus(_)) {
                    sources.push(*parent);
                }
            }
            for child in &self.bus(bus).children {
                if !matches!(child, ChildRef::Bus(_)) {
                    consumers.push(*child);
                }
            }
        }
        self.circuits[circuit].sources = sources;
        self.circuits[circuit].consumers = consumers;
        self.rebuild_subcircuits(circuit);
    }

    fn rebuild_subcircuits(&mut self, circuit: usize) {
        let buses = self.circuits[circuit].buses.clone();
        let mut feeds: Vec<(ParentRef, BusId)> = Vec::new();
        for &bus in &buses {
            for parent in &self.bus(bus).parents {
                if !matches!(parent, ParentRef::Bus(_)) {
                    feeds.push((*parent, bus));
                }
            }
        }
        let feed_hosts: Vec<BusId> = feeds.iter().map(|(_, bus)| *bus).unique().collect();

        let mut subcircuits = Vec::new();
        for (feed, root) in feeds {
            let mut reached = vec![root];
            let mut stack = vec![root];
            while let Some(bus) = stack.pop() {
                // The nearer feed claims shared edges: do not descend
                // below a bus hosting another feed.
                if bus != root && feed_hosts.contains(&bus) {
                    continue;
                }
                let downstream: Vec<BusId> = self
                    .bus(bus)
                    .children
                    .iter()
                    .filter_map(|child| match child {
                        ChildRef::Bus(bus) => Some(*bus),
                        _ => None,
                    })
                    .collect();
                for next in downstream {
                    if !reached.contains(&next) {
                        reached.push(next);
                        stack.push(next);
                    }
                }
            }
            subcircuits.push(crate::circuit::SubCircuit {
                source: feed,
                root_bus: root,
                buses: reached,
            });
        }

        for &bus in &buses {
            let feeding = subcircuits
                .iter()
                .positions(|subcircuit| subcircuit.buses.contains(&bus))
                .collect();
            self.bus_mut(bus).feeding_subcircuits = feeding;
        }
        self.circuits[circuit].subcircuits = subcircuits;
    }

    // --- switch and load controls ---

    /// Records the utilization the consumer should run at from the next
    /// tick on, clamped into `[Consumer::STANDBY_LOAD, 1]`.
    pub fn set_consumer_load(&mut self, consumer: ConsumerId, load: Ratio) {
        self.consumer_mut(consumer).set_requested_load(load);
    }

    /// Flips the child face of a switchable element. Switch events fire
    /// immediately from here, not at the next tick.
    ///
    /// # Panics
    /// When `child` refers to a bus; buses cannot be switched.
    pub fn set_child_switched_in(&mut self, child: impl Into<ChildRef>, switched_in: bool) {
        let child = child.into();
        match child {
            ChildRef::Consumer(consumer) => {
                if self.consumer(consumer).switched_in == switched_in {
                    return;
                }
                self.consumer_mut(consumer).switched_in = switched_in;
                if switched_in {
                    self.handlers.fire(Event::ChildSwitchIn(child));
                } else {
                    self.handlers.fire(Event::ChildSwitchOut(child));
                    self.quiesce_consumer(consumer);
                }
            }
            ChildRef::Battery(battery) => {
                let transition = if switched_in {
                    self.battery_mut(battery).transition(BatteryState::Charging)
                } else if self.battery(battery).state == BatteryState::Charging {
                    self.battery_mut(battery).transition(BatteryState::Idle)
                } else {
                    return;
                };
                self.fire_battery_transition(battery, transition);
            }
            ChildRef::Converter(converter) => {
                if self.converter(converter).child_switched_in == switched_in {
                    return;
                }
                self.converter_mut(converter).child_switched_in = switched_in;
                if switched_in {
                    self.handlers.fire(Event::ChildSwitchIn(child));
                } else {
                    self.handlers.fire(Event::ChildSwitchOut(child));
                }
            }
            ChildRef::Bus(_) => panic!("a bus cannot be switched"),
        }
    }

    /// Flips the parent face of a switchable element.
    ///
    /// # Panics
    /// When `parent` refers to a bus; buses cannot be switched.
    pub fn set_parent_switched_in(&mut self, parent: impl Into<ParentRef>, switched_in: bool) {
        let parent = parent.into();
        match parent {
            ParentRef::Source(source) => {
                if self.source(source).switched_in == switched_in {
                    return;
                }
                self.source_mut(source).switched_in = switched_in;
                if switched_in {
                    self.handlers.fire(Event::ParentSwitchIn(parent));
                } else {
                    self.handlers.fire(Event::ParentSwitchOut(parent));
                    self.quiesce_source(source);
                }
            }
            ParentRef::Battery(battery) => {
                let transition = if switched_in {
                    self.battery_mut(battery).transition(BatteryState::Sourcing)
                } else if self.battery(battery).state == BatteryState::Sourcing {
                    self.battery_mut(battery).transition(BatteryState::Idle)
                } else {
                    return;
                };
                self.fire_battery_transition(battery, transition);
            }
            ParentRef::Converter(converter) => {
                if self.converter(converter).parent_switched_in == switched_in {
                    return;
                }
                self.converter_mut(converter).parent_switched_in = switched_in;
                if switched_in {
                    self.handlers.fire(Event::ParentSwitchIn(parent));
                } else {
                    self.handlers.fire(Event::ParentSwitchOut(parent));
                    self.quiesce_converter(converter);
                }
            }
            ParentRef::Bus(_) => panic!("a bus cannot be switched"),
        }
    }

    pub fn set_autoswitch_enabled(&mut self, battery: BatteryId, enabled: bool) {
        self.battery_mut(battery).autoswitch_enabled = enabled;
    }

    /// Forces the battery into CHARGING regardless of autoswitch.
    pub fn set_to_charging(&mut self, battery: BatteryId) {
        let transition = self.battery_mut(battery).transition(BatteryState::Charging);
        self.fire_battery_transition(battery, transition);
    }

    /// Adjusts the current the bus is rated for, e.g. to model wear.
    pub fn set_bus_max_current(&mut self, bus: BusId, max_current: ElectricCurrent) {
        self.bus_mut(bus).max_current = max_current;
    }

    pub(crate) fn fire_battery_transition(
        &mut self,
        battery: BatteryId,
        transition: crate::battery::BatteryTransition,
    ) {
        if transition.parent_out {
            self.handlers
                .fire(Event::ParentSwitchOut(ParentRef::Battery(battery)));
        }
        if transition.child_out {
            self.handlers
                .fire(Event::ChildSwitchOut(ChildRef::Battery(battery)));
        }
        if transition.parent_in {
            self.handlers
                .fire(Event::ParentSwitchIn(ParentRef::Battery(battery)));
        }
        if transition.child_in {
            self.handlers
                .fire(Event::ChildSwitchIn(ChildRef::Battery(battery)));
        }
    }

    // --- removal ---

    /// Detaches the consumer from its bus (if any) and destroys it.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) {
        if let Some(bus) = self.consumer(consumer).parent {
            let _ = self.disconnect(bus, consumer);
        }
        self.consumers[consumer.0] = None;
    }

    pub fn remove_source(&mut self, source: SourceId) {
        if let Some(bus) = self.source(source).child {
            let _ = self.disconnect(source, bus);
        }
        self.sources[source.0] = None;
    }

    pub fn remove_battery(&mut self, battery: BatteryId) {
        if let Some(bus) = self.battery(battery).bus {
            let _ = self.disconnect(battery, bus);
        }
        self.batteries[battery.0] = None;
    }

    pub fn remove_converter(&mut self, converter: ConverterId) {
        if let Some(bus) = self.converter(converter).parent {
            let _ = self.disconnect(bus, converter);
        }
        if let Some(bus) = self.converter(converter).child {
            let _ = self.disconnect(converter, bus);
        }
        self.converters[converter.0] = None;
    }

    /// Detaches everything from the bus, repartitions what remains and
    /// destroys the bus together with its (then empty) circuit slot.
    pub fn remove_bus(&mut self, bus: BusId) {
        let children = self.bus(bus).children.clone();
        for child in children {
            let _ = self.disconnect(bus, child);
        }
        let parents = self.bus(bus).parents.clone();
        for parent in parents {
            match parent {
                ParentRef::Bus(parent_bus) => {
                    let _ = self.disconnect(parent_bus, bus);
                }
                _ => {
                    let _ = self.disconnect(parent, bus);
                }
            }
        }
        let circuit = self.circuit_index_of_bus(bus);
        debug_assert_eq!(self.circuits[circuit].buses, vec![bus]);
        self.circuits.remove(circuit);
        self.buses[bus.0] = None;
    }

    // --- live-state zeroing on detach/switch-out ---

    fn quiesce_consumer(&mut self, consumer: ConsumerId) {
        let consumer_ref = self.consumer_mut(consumer);
        consumer_ref.input_current = ElectricCurrent::new::<ampere>(0.);
        consumer_ref.current_power = Power::new::<uom::si::power::watt>(0.);
        consumer_ref.effective_load = Ratio::new::<ratio>(0.);
        consumer_ref.last_effective_load = Ratio::new::<ratio>(0.);
        if consumer_ref.running {
            consumer_ref.running = false;
            self.handlers
                .fire(Event::RunningChange(consumer));
        }
    }

    fn quiesce_source(&mut self, source: SourceId) {
        let source_ref = self.source_mut(source);
        source_ref.output_current = ElectricCurrent::new::<ampere>(0.);
        source_ref.pending_delivery = 0.;
    }

    fn quiesce_battery(&mut self, battery: BatteryId) {
        let battery_ref = self.battery_mut(battery);
        battery_ref.output_current = ElectricCurrent::new::<ampere>(0.);
        battery_ref.input_current = ElectricCurrent::new::<ampere>(0.);
        battery_ref.charging_power = Power::new::<uom::si::power::watt>(0.);
        battery_ref.running = false;
        battery_ref.pending_delivery = 0.;
    }

    fn quiesce_converter(&mut self, converter: ConverterId) {
        let converter_ref = self.converter_mut(converter);
        converter_ref.input_current = ElectricCurrent::new::<ampere>(0.);
        converter_ref.output_current = ElectricCurrent::new::<ampere>(0.);
        converter_ref.input_power = Power::new::<uom::si::power::watt>(0.);
        converter_ref.output_power = Power::new::<uom::si::power::watt>(0.);
        converter_ref.granted_input_watts = 0.;
    }
}

impl Default for CircuitManager {
    fn default() -> Self {
        Self::new()
    }
}
