//! The per-tick evaluation: demand, battery autoswitching, shedding,
//! source apportionment, current distribution and event collection.
//!
//! Power is the invariant of the arithmetic; demands, capacities and shed
//! amounts are carried in watts and only turned into currents at the bus
//! voltage when elements are finalized. Because every bus of a circuit
//! shares one voltage the two views are interchangeable, and watt
//! accounting keeps battery charge integration free of avoidable
//! round-trips through division.

use std::collections::HashMap;
use std::time::Duration;

use itertools::Itertools;
use uom::si::{
    electric_current::ampere, electric_potential::volt, electrical_resistance::ohm,
    energy::joule, f64::*, power::watt, ratio::ratio, time::second,
};

use crate::battery::BatteryState;
use crate::element::{BatteryId, BusId, ChildRef, ConverterId, ParentRef};
use crate::event::Event;
use crate::manager::CircuitManager;

const EPSILON_WATTS: f64 = 1e-9;

impl CircuitManager {
    /// Advances the whole network by one tick of `delta`.
    ///
    /// Circuits are independent units; the order in which the host's
    /// circuits were created does not matter. Internally, circuits that
    /// feed others through converters are settled first so that a
    /// converter's granted input is known before its output circuit is
    /// balanced.
    pub fn evaluate(&mut self, delta: Duration) {
        self.refresh_all_members();
        let order = self.evaluation_order();
        self.reset_tick_state();
        let mut pending: Vec<Event> = Vec::new();
        for &circuit in &order {
            self.step_batteries(circuit, &mut pending);
        }
        // Battery transitions change demand; converter requests are
        // renegotiated from scratch afterwards.
        self.clear_converter_requests();
        for &circuit in &order {
            self.grant_converters(circuit);
        }
        for &circuit in &order {
            self.balance_circuit(circuit, &mut pending);
        }
        for &circuit in &order {
            self.apportion_circuit(circuit, &mut pending);
        }
        for circuit in 0..self.circuits.len() {
            self.finalize_circuit(circuit, delta, &mut pending);
        }
        // Numeric state is final; observers see consistent values.
        for event in pending {
            self.handlers.fire(event);
        }
    }

    /// Circuits ordered so that every circuit comes before the circuits
    /// it feeds through converters. Connection checks keep the feed graph
    /// acyclic.
    fn evaluation_order(&self) -> Vec<usize> {
        let count = self.circuits.len();
        let edges: Vec<(usize, usize)> = self
            .converters
            .iter()
            .flatten()
            .filter_map(|converter| match (converter.parent, converter.child) {
                (Some(input_bus), Some(output_bus)) => Some((
                    self.circuit_index_of_bus(input_bus),
                    self.circuit_index_of_bus(output_bus),
                )),
                _ => None,
            })
            .filter(|(from, to)| from != to)
            .unique()
            .collect();

        let mut indegree = vec![0usize; count];
        for &(_, to) in &edges {
            indegree[to] += 1;
        }
        let mut ready: Vec<usize> = (0..count).filter(|&c| indegree[c] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(circuit) = ready.pop() {
            order.push(circuit);
            for &(from, to) in &edges {
                if from == circuit {
                    indegree[to] -= 1;
                    if indegree[to] == 0 {
                        ready.push(to);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), count);
        order
    }

    fn reset_tick_state(&mut self) {
        for consumer in self.consumers.iter_mut().flatten() {
            consumer.effective_load = if consumer.switched_in {
                consumer.requested_load
            } else {
                Ratio::new::<ratio>(0.)
            };
        }
        for source in self.sources.iter_mut().flatten() {
            source.pending_delivery = 0.;
        }
        for battery in self.batteries.iter_mut().flatten() {
            battery.charging_load = Ratio::new::<ratio>(1.);
            battery.pending_delivery = 0.;
        }
        for converter in self.converters.iter_mut().flatten() {
            converter.requested_output_watts = None;
            converter.granted_input_watts = 0.;
            if !converter.is_bridging() {
                converter.input_current = ElectricCurrent::new::<ampere>(0.);
                converter.output_current = ElectricCurrent::new::<ampere>(0.);
                converter.input_power = Power::new::<watt>(0.);
                converter.output_power = Power::new::<watt>(0.);
            }
        }
    }

    fn clear_converter_requests(&mut self) {
        for converter in self.converters.iter_mut().flatten() {
            converter.requested_output_watts = None;
        }
    }

    /// Runs the autoswitch state machine of every battery in the circuit
    /// against the current balance of demand and other feeds.
    fn step_batteries(&mut self, circuit: usize, pending: &mut Vec<Event>) {
        let feeds = self.circuits[circuit].sources.clone();
        for feed in feeds {
            let battery = match feed {
                ParentRef::Battery(battery) => battery,
                _ => continue,
            };
            if !self.battery(battery).autoswitch_enabled {
                continue;
            }
            let demand = self.circuit_demand_watts(circuit, false, false);
            let capacity_other = self.other_feed_capacity_watts(circuit, battery);
            let state = self.battery(battery).state;
            let battery_ref = self.battery(battery);
            let fraction_ok = battery_ref.charge >= battery_ref.low_charge_level();
            let full = battery_ref.charge >= battery_ref.max_charge;

            let target = match state {
                BatteryState::Idle => {
                    if fraction_ok && demand > capacity_other + EPSILON_WATTS {
                        Some(BatteryState::Sourcing)
                    } else if !full && capacity_other > demand + EPSILON_WATTS {
                        Some(BatteryState::Charging)
                    } else {
                        None
                    }
                }
                BatteryState::Sourcing => {
                    if demand <= capacity_other + EPSILON_WATTS {
                        Some(BatteryState::Idle)
                    } else {
                        None
                    }
                }
                BatteryState::Charging => {
                    if full || capacity_other <= demand + EPSILON_WATTS {
                        Some(BatteryState::Idle)
                    } else {
                        None
                    }
                }
            };
            if let Some(target) = target {
                let transition = self.battery_mut(battery).transition(target);
                queue_battery_flanks(battery, &transition, pending);
            }
        }
    }

    /// Demand of the circuit in watts: switched-in consumers at their
    /// effective loads, charging batteries (optional) and the input of
    /// every converter drawing from the circuit.
    fn circuit_demand_watts(
        &mut self,
        circuit: usize,
        include_batteries: bool,
        use_grants: bool,
    ) -> f64 {
        let draws = self.circuits[circuit].consumers.clone();
        let mut watts = 0.;
        for draw in draws {
            match draw {
                ChildRef::Consumer(consumer) => {
                    watts += self.consumer(consumer).effective_watts();
                }
                ChildRef::Battery(battery) => {
                    if include_batteries {
                        watts += self.battery(battery).charging_watts();
                    }
                }
                ChildRef::Converter(converter) => {
                    watts += if use_grants {
                        self.converter(converter).granted_input_watts
                    } else {
                        self.converter_requested_input_watts(converter)
                    };
                }
                ChildRef::Bus(_) => {}
            }
        }
        watts
    }

    /// The input power a converter asks of its upstream bus: whatever of
    /// the downstream circuit's demand its local feeds cannot cover,
    /// capped at the converter's output rating, divided by efficiency.
    fn converter_requested_input_watts(&mut self, converter: ConverterId) -> f64 {
        if let Some(output_watts) = self.converter(converter).requested_output_watts {
            return output_watts / self.converter(converter).efficiency();
        }
        let output_watts = if self.converter(converter).is_bridging() {
            let output_bus = self.converter(converter).child.unwrap();
            let downstream = self.circuit_index_of_bus(output_bus);
            let downstream_demand = self.circuit_demand_watts(downstream, true, false);
            let local_capacity = self.local_feed_capacity_watts(downstream);
            (downstream_demand - local_capacity)
                .max(0.)
                .min(self.converter(converter).max_power.get::<watt>())
        } else {
            0.
        };
        self.converter_mut(converter).requested_output_watts = Some(output_watts);
        output_watts / self.converter(converter).efficiency()
    }

    /// Capacity of the circuit's own sources and sourcing batteries, in
    /// watts; converters feeding the circuit are not counted.
    fn local_feed_capacity_watts(&self, circuit: usize) -> f64 {
        self.circuits[circuit]
            .sources
            .iter()
            .map(|feed| match feed {
                ParentRef::Source(source) => {
                    let source = self.source(*source);
                    if source.switched_in {
                        source.capacity_watts()
                    } else {
                        0.
                    }
                }
                ParentRef::Battery(battery) => {
                    let battery = self.battery(*battery);
                    if battery.state == BatteryState::Sourcing
                        && battery.charge > Energy::new::<joule>(0.)
                    {
                        battery.capacity_watts()
                    } else {
                        0.
                    }
                }
                _ => 0.,
            })
            .sum()
    }

    fn other_feed_capacity_watts(&self, circuit: usize, excluded: BatteryId) -> f64 {
        let excluded_watts = {
            let battery = self.battery(excluded);
            if battery.state == BatteryState::Sourcing && battery.charge > Energy::new::<joule>(0.)
            {
                battery.capacity_watts()
            } else {
                0.
            }
        };
        self.local_feed_capacity_watts(circuit) - excluded_watts
    }

    /// Every feed of the circuit with the power it can deliver this tick.
    /// Converter capacity is bounded by what its upstream circuit granted.
    fn feed_capacities(&self, circuit: usize) -> Vec<(ParentRef, f64)> {
        self.circuits[circuit]
            .sources
            .iter()
            .filter_map(|feed| match feed {
                ParentRef::Source(source) => {
                    let source_ref = self.source(*source);
                    if source_ref.switched_in {
                        Some((*feed, source_ref.capacity_watts()))
                    } else {
                        None
                    }
                }
                ParentRef::Battery(battery) => {
                    let battery_ref = self.battery(*battery);
                    if battery_ref.state == BatteryState::Sourcing
                        && battery_ref.charge > Energy::new::<joule>(0.)
                    {
                        Some((*feed, battery_ref.capacity_watts()))
                    } else {
                        None
                    }
                }
                ParentRef::Converter(converter) => {
                    let converter_ref = self.converter(*converter);
                    if converter_ref.is_bridging() {
                        let granted_output = converter_ref.granted_input_watts
                            * converter_ref.efficiency();
                        Some((*feed, granted_output.min(converter_ref.max_power.get::<watt>())))
                    } else {
                        None
                    }
                }
                ParentRef::Bus(_) => None,
            })
            .collect()
    }

    /// Fixes the grant of every converter drawing from this circuit to
    /// its requested input. Grants must exist for the whole feed chain
    /// before any circuit sheds, so the shed walk can trim a bridge it
    /// reaches through a downstream bus.
    fn grant_converters(&mut self, circuit: usize) {
        let draws = self.circuits[circuit].consumers.clone();
        for draw in draws {
            if let ChildRef::Converter(converter) = draw {
                let requested = self.converter_requested_input_watts(converter);
                self.converter_mut(converter).granted_input_watts = requested;
            }
        }
    }

    /// Sheds load when the circuit's demand exceeds what its feeds can
    /// deliver.
    fn balance_circuit(&mut self, circuit: usize, pending: &mut Vec<Event>) {
        let demand = self.circuit_demand_watts(circuit, true, true);
        let capacity: f64 = self
            .feed_capacities(circuit)
            .iter()
            .map(|(_, watts)| watts)
            .sum();
        // A circuit without any feed is inert: nothing is shed, nothing
        // flows.
        if capacity <= 0. || demand <= capacity + EPSILON_WATTS {
            return;
        }

        let mut missing = demand - capacity;
        let roots = self.root_buses(circuit);
        for root in roots {
            if missing <= EPSILON_WATTS {
                break;
            }
            missing = self.reduce_current_flow(root, missing, pending).max(0.);
        }
        // Load hanging upstream of every feed is not reachable from the
        // root walks; sweep the remaining buses directly.
        if missing > EPSILON_WATTS {
            let buses = self.circuits[circuit].buses.clone();
            for bus in buses {
                if missing <= EPSILON_WATTS {
                    break;
                }
                missing = self.reduce_current_flow(bus, missing, pending).max(0.);
            }
        }
    }

    /// Buses of the circuit that have a feed attached, in registration
    /// order.
    fn root_buses(&self, circuit: usize) -> Vec<BusId> {
        self.circuits[circuit]
            .buses
            .iter()
            .filter(|&&bus| {
                self.bus(bus)
                    .parents
                    .iter()
                    .any(|parent| !matches!(parent, ParentRef::Bus(_)))
            })
            .copied()
            .collect()
    }

    /// The shed walk: reduces the power drawn below this bus by up to
    /// `missing` watts and returns what could not be shed. Children are
    /// visited in reverse connection order, so the most recently attached
    /// load is dropped first; downstream buses and converter bridges are
    /// recursed into. The result can turn negative when a recursion sheds
    /// more than asked; callers clamp.
    pub(crate) fn reduce_current_flow(
        &mut self,
        bus: BusId,
        missing: f64,
        pending: &mut Vec<Event>,
    ) -> f64 {
        let mut missing = missing;
        let children = self.bus(bus).children.clone();
        for child in children.into_iter().rev() {
            if missing <= EPSILON_WATTS {
                break;
            }
            match child {
                ChildRef::Consumer(consumer) => {
                    let drawn = self.consumer(consumer).effective_watts();
                    if drawn <= 0. {
                        continue;
                    }
                    if drawn <= missing + EPSILON_WATTS {
                        // Shedding the whole draw switches the consumer
                        // out; scaling to zero and switching out are the
                        // same thing.
                        let consumer_ref = self.consumer_mut(consumer);
                        consumer_ref.switched_in = false;
                        consumer_ref.effective_load = Ratio::new::<ratio>(0.);
                        pending.push(Event::ChildSwitchOut(ChildRef::Consumer(consumer)));
                        missing -= drawn;
                    } else {
                        let nominal = self.consumer(consumer).nominal_power.get::<watt>();
                        let remaining = drawn - missing;
                        self.consumer_mut(consumer).effective_load =
                            Ratio::new::<ratio>(remaining / nominal);
                        missing = 0.;
                    }
                }
                ChildRef::Battery(battery) => {
                    let drawn = self.battery(battery).charging_watts();
                    if drawn <= 0. {
                        continue;
                    }
                    // A starved charger keeps its state; only its draw is
                    // trimmed.
                    if drawn <= missing + EPSILON_WATTS {
                        self.battery_mut(battery).charging_load = Ratio::new::<ratio>(0.);
                        missing -= drawn;
                    } else {
                        let max = self.battery(battery).max_charging_power.get::<watt>();
                        let remaining = drawn - missing;
                        self.battery_mut(battery).charging_load =
                            Ratio::new::<ratio>(remaining / max);
                        missing = 0.;
                    }
                }
                ChildRef::Converter(converter) => {
                    if !self.converter(converter).is_bridging() {
                        continue;
                    }
                    let granted = self.converter(converter).granted_input_watts;
                    if granted <= 0. {
                        continue;
                    }
                    let efficiency = self.converter(converter).efficiency();
                    let output_bus = self.converter(converter).child.unwrap();
                    let asked_input = missing.min(granted);
                    let asked_output = asked_input * efficiency;
                    let leftover = self.reduce_current_flow(output_bus, asked_output, pending);
                    let achieved_output = asked_output - leftover;
                    let achieved_input = achieved_output / efficiency;
                    let converter_ref = self.converter_mut(converter);
                    converter_ref.granted_input_watts =
                        (converter_ref.granted_input_watts - achieved_input).max(0.);
                    missing -= achieved_input;
                }
                ChildRef::Bus(downstream) => {
                    missing = self.reduce_current_flow(downstream, missing, pending);
                }
            }
        }
        missing
    }

    /// Distributes the delivered current across the circuit's feeds in
    /// proportion to their capacity, records the circuit totals and fixes
    /// the actual transfer of every converter feeding the circuit.
    fn apportion_circuit(&mut self, circuit: usize, pending: &mut Vec<Event>) {
        let volts = self.circuits[circuit].voltage.get::<volt>();
        let demand = self.circuit_demand_watts(circuit, true, true);
        let capacities = self.feed_capacities(circuit);
        let capacity: f64 = capacities.iter().map(|(_, watts)| watts).sum();
        let delivered = demand.min(capacity).max(0.);

        self.circuits[circuit].circuit_current =
            ElectricCurrent::new::<ampere>(delivered / volts);
        self.circuits[circuit].equivalent_resistance = if demand > 0. {
            ElectricalResistance::new::<ohm>(volts * volts / demand)
        } else {
            ElectricalResistance::new::<ohm>(f64::INFINITY)
        };

        for (feed, feed_capacity) in capacities {
            let share = if capacity > 0. {
                delivered * feed_capacity / capacity
            } else {
                0.
            };
            match feed {
                ParentRef::Source(source) => {
                    self.source_mut(source).pending_delivery = share;
                }
                ParentRef::Battery(battery) => {
                    self.battery_mut(battery).pending_delivery = share;
                }
                ParentRef::Converter(converter) => {
                    let input_bus = self.converter(converter).parent.unwrap();
                    let input_volts = self.bus(input_bus).volts();
                    let efficiency = self.converter(converter).efficiency();
                    let previous = self.converter(converter).output_current.get::<ampere>();
                    let output_amps = share / volts;
                    let input_watts = share / efficiency;
                    let converter_ref = self.converter_mut(converter);
                    converter_ref.output_current = ElectricCurrent::new::<ampere>(output_amps);
                    converter_ref.output_power = Power::new::<watt>(share);
                    converter_ref.input_power = Power::new::<watt>(input_watts);
                    converter_ref.input_current =
                        ElectricCurrent::new::<ampere>(input_watts / input_volts);
                    if output_amps != previous {
                        pending.push(Event::SourceLoadChange(feed));
                    }
                }
                ParentRef::Bus(_) => {}
            }
        }
    }

    /// Terminal step of the tick for one circuit: element currents and
    /// running states, feed outputs, battery charge integration, the
    /// per-bus current distribution with its edge events, and equivalent
    /// resistances at the loads that ended up being honored.
    fn finalize_circuit(&mut self, circuit: usize, delta: Duration, pending: &mut Vec<Event>) {
        let voltage = self.circuits[circuit].voltage;
        let volts = voltage.get::<volt>();
        let fed = self
            .feed_capacities(circuit)
            .iter()
            .any(|(_, watts)| *watts > EPSILON_WATTS);

        let draws = self.circuits[circuit].consumers.clone();
        for draw in draws {
            match draw {
                ChildRef::Consumer(consumer) => {
                    let watts = if fed {
                        self.consumer(consumer).effective_watts()
                    } else {
                        0.
                    };
                    let consumer_ref = self.consumer_mut(consumer);
                    consumer_ref.input_current = ElectricCurrent::new::<ampere>(watts / volts);
                    consumer_ref.current_power = Power::new::<watt>(watts);
                    let running = consumer_ref.switched_in && watts > 0.;
                    if running != consumer_ref.running {
                        consumer_ref.running = running;
                        pending.push(Event::RunningChange(consumer));
                    }
                    if consumer_ref.effective_load != consumer_ref.last_effective_load {
                        pending.push(Event::ConsumerLoadChange(consumer));
                    }
                    consumer_ref.last_effective_load = consumer_ref.effective_load;
                }
                ChildRef::Battery(battery) => {
                    let watts = if fed {
                        self.battery(battery).charging_watts()
                    } else {
                        0.
                    };
                    let battery_ref = self.battery_mut(battery);
                    battery_ref.input_current = ElectricCurrent::new::<ampere>(watts / volts);
                    battery_ref.charging_power = Power::new::<watt>(watts);
                    battery_ref.running =
                        battery_ref.state == BatteryState::Charging && watts > 0.;
                }
                // Converter input faces were fixed when their output
                // circuit was apportioned.
                ChildRef::Converter(_) | ChildRef::Bus(_) => {}
            }
        }

        let feeds = self.circuits[circuit].sources.clone();
        for feed in &feeds {
            match feed {
                ParentRef::Source(source) => {
                    let source_ref = self.source_mut(*source);
                    let delivered = source_ref.pending_delivery / volts;
                    let previous = source_ref.output_current.get::<ampere>();
                    if source_ref.switched_in && delivered != previous {
                        pending.push(Event::SourceLoadChange(*feed));
                    }
                    source_ref.output_current = ElectricCurrent::new::<ampere>(delivered);
                    source_ref.output_voltage = voltage;
                }
                ParentRef::Battery(battery) => {
                    let battery_ref = self.battery_mut(*battery);
                    let delivered = battery_ref.pending_delivery / volts;
                    let previous = battery_ref.output_current.get::<ampere>();
                    if battery_ref.state == BatteryState::Sourcing && delivered != previous {
                        pending.push(Event::SourceLoadChange(*feed));
                    }
                    battery_ref.output_current = ElectricCurrent::new::<ampere>(delivered);
                    battery_ref.output_voltage = voltage;
                }
                ParentRef::Converter(_) | ParentRef::Bus(_) => {}
            }
        }

        for feed in &feeds {
            if let ParentRef::Battery(battery) = feed {
                self.integrate_battery(*battery, delta, pending);
            }
        }

        let flows = self.compute_bus_flows(circuit);
        for (bus, amps) in flows {
            let bus_ref = self.bus_mut(bus);
            if amps != bus_ref.throughcurrent.get::<ampere>() {
                bus_ref.throughcurrent = ElectricCurrent::new::<ampere>(amps);
                pending.push(Event::ThroughputChange(bus));
            }
            let over = amps > bus_ref.max_current.get::<ampere>();
            if over != bus_ref.over_max {
                bus_ref.over_max = over;
                pending.push(if over {
                    Event::MaxCurrentHigh(bus)
                } else {
                    Event::MaxCurrentOk(bus)
                });
            }
        }

        let buses = self.circuits[circuit].buses.clone();
        for bus in buses {
            let watts = self.bus_load_watts(bus);
            self.bus_mut(bus).equivalent_resistance = if watts > 0. {
                ElectricalResistance::new::<ohm>(volts * volts / watts)
            } else {
                ElectricalResistance::new::<ohm>(f64::INFINITY)
            };
        }
    }

    /// Time-integrates the battery's charge over the tick and handles the
    /// empty/full transitions and the low-charge flank.
    fn integrate_battery(&mut self, battery: BatteryId, delta: Duration, pending: &mut Vec<Event>) {
        let time = Time::new::<second>(delta.as_secs_f64());
        let zero = Energy::new::<joule>(0.);
        let state = self.battery(battery).state;
        match state {
            BatteryState::Sourcing => {
                let battery_ref = self.battery_mut(battery);
                let output = Power::new::<watt>(battery_ref.pending_delivery);
                let drained = output * time;
                if drained > zero {
                    let before = battery_ref.charge;
                    battery_ref.charge = if drained < battery_ref.charge {
                        battery_ref.charge - drained
                    } else {
                        zero
                    };
                    if before > zero && battery_ref.charge <= zero {
                        pending.push(Event::ChargeEmpty(battery));
                        let target = if battery_ref.autoswitch_enabled {
                            BatteryState::Charging
                        } else {
                            BatteryState::Idle
                        };
                        let transition = battery_ref.transition(target);
                        queue_battery_flanks(battery, &transition, pending);
                    }
                }
            }
            BatteryState::Charging => {
                let battery_ref = self.battery_mut(battery);
                let gained = battery_ref.charging_power * battery_ref.charging_efficiency * time;
                if gained > zero {
                    battery_ref.charge += gained;
                    if battery_ref.charge >= battery_ref.max_charge {
                        battery_ref.charge = battery_ref.max_charge;
                        let transition = battery_ref.transition(BatteryState::Idle);
                        queue_battery_flanks(battery, &transition, pending);
                    }
                }
            }
            BatteryState::Idle => {}
        }

        let battery_ref = self.battery_mut(battery);
        let level = battery_ref.low_charge_level();
        if battery_ref.charge < level {
            if battery_ref.charge_low_armed {
                battery_ref.charge_low_armed = false;
                pending.push(Event::ChargeLow(battery));
            }
        } else {
            battery_ref.charge_low_armed = true;
        }
    }

    /// The unique current distribution over the circuit's bus tree.
    ///
    /// Feeds inject at their buses, draws extract; the flow over every
    /// bus-to-bus edge is the net demand of the component hanging off it.
    /// A bus's throughput is what its feeds inject plus what streams in
    /// from its neighbors. In a single-feed circuit this collapses to the
    /// sum of all draws downstream of each bus.
    fn compute_bus_flows(&self, circuit: usize) -> Vec<(BusId, f64)> {
        let buses = &self.circuits[circuit].buses;
        let mut supply: HashMap<BusId, f64> = HashMap::new();
        let mut net: HashMap<BusId, f64> = HashMap::new();
        for &bus in buses {
            let bus_ref = self.bus(bus);
            let mut drawn = 0.;
            for child in &bus_ref.children {
                drawn += match child {
                    ChildRef::Consumer(consumer) => {
                        self.consumer(*consumer).input_current.get::<ampere>()
                    }
                    ChildRef::Battery(battery) => {
                        self.battery(*battery).input_current.get::<ampere>()
                    }
                    ChildRef::Converter(converter) => {
                        self.converter(*converter).input_current.get::<ampere>()
                    }
                    ChildRef::Bus(_) => 0.,
                };
            }
            let mut injected = 0.;
            for parent in &bus_ref.parents {
                injected += match parent {
                    ParentRef::Source(source) => {
                        self.source(*source).output_current.get::<ampere>()
                    }
                    ParentRef::Battery(battery) => {
                        self.battery(*battery).output_current.get::<ampere>()
                    }
                    ParentRef::Converter(converter) => {
                        self.converter(*converter).output_current.get::<ampere>()
                    }
                    ParentRef::Bus(_) => 0.,
                };
            }
            supply.insert(bus, injected);
            net.insert(bus, drawn - injected);
        }

        // Root the tree anywhere and accumulate per-subtree nets.
        let root = buses[0];
        let mut parent_of: HashMap<BusId, BusId> = HashMap::new();
        let mut dfs_order = vec![root];
        let mut stack = vec![root];
        while let Some(bus) = stack.pop() {
            let neighbors: Vec<BusId> = self
                .bus(bus)
                .neighbor_buses()
                .filter(|neighbor| {
                    Some(neighbor) != parent_of.get(&bus) && *neighbor != root
                })
                .collect();
            for neighbor in neighbors {
                if !parent_of.contains_key(&neighbor) {
                    parent_of.insert(neighbor, bus);
                    dfs_order.push(neighbor);
                    stack.push(neighbor);
                }
            }
        }
        let mut subtree_net = net;
        for &bus in dfs_order.iter().rev() {
            if let Some(&parent) = parent_of.get(&bus) {
                let addend = subtree_net[&bus];
                *subtree_net.get_mut(&parent).unwrap() += addend;
            }
        }

        let mut flows = Vec::with_capacity(buses.len());
        for &bus in buses {
            let mut through = supply[&bus];
            if parent_of.contains_key(&bus) {
                through += subtree_net[&bus].max(0.);
            }
            for (&child, &parent) in &parent_of {
                if parent == bus {
                    through += (-subtree_net[&child]).max(0.);
                }
            }
            flows.push((bus, through));
        }
        flows
    }

    /// Power drawn below a bus at the honored loads, recursively.
    fn bus_load_watts(&self, bus: BusId) -> f64 {
        let bus_ref = self.bus(bus);
        let mut watts = 0.;
        for child in &bus_ref.children {
            watts += match child {
                ChildRef::Consumer(consumer) => self.consumer(*consumer).effective_watts(),
                ChildRef::Battery(battery) => self.battery(*battery).charging_watts(),
                ChildRef::Converter(converter) => {
                    self.converter(*converter).input_power.get::<watt>()
                }
                ChildRef::Bus(downstream) => self.bus_load_watts(*downstream),
            };
        }
        watts
    }
}

fn queue_battery_flanks(
    battery: BatteryId,
    transition: &crate::battery::BatteryTransition,
    pending: &mut Vec<Event>,
) {
    if transition.parent_out {
        pending.push(Event::ParentSwitchOut(ParentRef::Battery(battery)));
    }
    if transition.child_out {
        pending.push(Event::ChildSwitchOut(ChildRef::Battery(battery)));
    }
    if transition.parent_in {
        pending.push(Event::ParentSwitchIn(ParentRef::Battery(battery)));
    }
    if transition.child_in {
        pending.push(Event::ChildSwitchIn(ChildRef::Battery(battery)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BusId, CircuitManager, ConsumerId, SourceId, VoltageRange};
    use ntest::assert_about_eq;
    use uom::si::electrical_resistance::ohm;

    fn bus_at(grid: &mut CircuitManager, volts: f64) -> BusId {
        grid.add_bus(
            ElectricPotential::new::<volt>(volts),
            ElectricCurrent::new::<ampere>(1000.),
        )
    }

    fn consumer_in(grid: &mut CircuitManager, min: f64, max: f64, watts: f64) -> ConsumerId {
        grid.add_consumer(
            VoltageRange::from_volts(min, max),
            Power::new::<watt>(watts),
            0,
        )
    }

    fn source_in(
        grid: &mut CircuitManager,
        min: f64,
        max: f64,
        watts: f64,
        ohms: f64,
    ) -> SourceId {
        grid.add_source(
            VoltageRange::from_volts(min, max),
            Power::new::<watt>(watts),
            ElectricalResistance::new::<ohm>(ohms),
            0,
        )
    }

    fn full_load(grid: &mut CircuitManager, consumer: ConsumerId) {
        grid.set_consumer_load(consumer, Ratio::new::<ratio>(1.));
    }

    /// Source(15..30, 200 W), 26 V bus, Consumer(15..30, 100 W).
    fn simple_circuit() -> (CircuitManager, SourceId, BusId, ConsumerId) {
        let mut grid = CircuitManager::new();
        let bus = bus_at(&mut grid, 26.);
        let consumer = consumer_in(&mut grid, 15., 30., 100.);
        let source = source_in(&mut grid, 15., 30., 200., 1.);
        grid.connect_source_to_bus(source, bus).unwrap();
        grid.connect_consumer_to_bus(consumer, bus).unwrap();
        (grid, source, bus, consumer)
    }

    #[test]
    fn simple_circuit_at_full_load() {
        let (mut grid, source, bus, consumer) = simple_circuit();
        full_load(&mut grid, consumer);

        grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            grid.consumer(consumer).input_current().get::<ampere>(),
            3.8461538461538463,
            1e-9
        );
        let circuit = grid.circuit_containing(bus).unwrap();
        assert_about_eq!(circuit.equivalent_resistance().get::<ohm>(), 6.76, 1e-9);
        assert_about_eq!(circuit.current().get::<ampere>(), 3.8461538461538463, 1e-9);

        let source = grid.source(source);
        assert_about_eq!(source.output_voltage().get::<volt>(), 26., 1e-9);
        assert_about_eq!(
            source.max_output_current().get::<ampere>(),
            7.6923076923076925,
            1e-9
        );
        assert_about_eq!(
            source.output_current().get::<ampere>(),
            circuit.current().get::<ampere>(),
            1e-9
        );
        assert_about_eq!(
            grid.bus(bus).through_current().get::<ampere>(),
            source.output_current().get::<ampere>(),
            1e-9
        );
    }

    #[test]
    fn simple_circuit_at_half_load() {
        let (mut grid, source, bus, consumer) = simple_circuit();
        grid.set_consumer_load(consumer, Ratio::new::<ratio>(0.5));

        grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            grid.consumer(consumer).input_current().get::<ampere>(),
            1.9230769230769231,
            1e-9
        );
        let circuit = grid.circuit_containing(bus).unwrap();
        assert_about_eq!(circuit.equivalent_resistance().get::<ohm>(), 13.52, 1e-9);
        assert_about_eq!(circuit.current().get::<ampere>(), 1.9230769230769231, 1e-9);
        assert_about_eq!(
            grid.bus(bus).through_current().get::<ampere>(),
            grid.source(source).output_current().get::<ampere>(),
            1e-9
        );
    }

    #[test]
    fn bus_ohm_invariant_holds_after_the_tick() {
        let (mut grid, _, bus, consumer) = simple_circuit();
        full_load(&mut grid, consumer);

        grid.evaluate(Duration::from_millis(1));

        let bus = grid.bus(bus);
        assert_about_eq!(
            bus.through_current().get::<ampere>(),
            bus.voltage().get::<volt>() / bus.equivalent_resistance().get::<ohm>(),
            1e-9
        );
    }

    #[test]
    fn overload_sheds_the_most_recently_connected_consumers() {
        let mut grid = CircuitManager::new();
        let bus = bus_at(&mut grid, 26.);
        let source = source_in(&mut grid, 15., 30., 200., 1.);
        grid.connect_source_to_bus(source, bus).unwrap();
        let mut consumers = Vec::new();
        for _ in 0..5 {
            let consumer = consumer_in(&mut grid, 15., 30., 60.);
            grid.connect_consumer_to_bus(consumer, bus).unwrap();
            full_load(&mut grid, consumer);
            consumers.push(consumer);
        }

        grid.evaluate(Duration::from_millis(1));

        for &consumer in &consumers[..3] {
            assert_about_eq!(grid.consumer(consumer).load().get::<ratio>(), 1., 1e-9);
            assert!(grid.consumer(consumer).is_running());
        }
        assert_about_eq!(
            grid.consumer(consumers[3]).load().get::<ratio>(),
            1. / 3.,
            1e-9
        );
        assert_about_eq!(
            grid.consumer(consumers[3]).current_power().get::<watt>(),
            20.,
            1e-9
        );
        assert!(!grid.consumer(consumers[4]).is_running());
        assert!(!grid.consumer(consumers[4]).is_switched_in());

        let circuit = grid.circuit_containing(bus).unwrap();
        assert_about_eq!(
            circuit.current().get::<ampere>() * circuit.voltage().get::<volt>(),
            200.,
            1e-9
        );
        assert_about_eq!(
            grid.source(source).output_power().get::<watt>(),
            200.,
            1e-9
        );
    }

    #[test]
    fn two_sources_split_by_their_capacity() {
        let mut grid = CircuitManager::new();
        let bus = bus_at(&mut grid, 26.);
        let strong = source_in(&mut grid, 15., 30., 200., 1.);
        let weak = source_in(&mut grid, 15., 30., 100., 1.);
        let consumer = consumer_in(&mut grid, 15., 30., 150.);
        grid.connect_source_to_bus(strong, bus).unwrap();
        grid.connect_source_to_bus(weak, bus).unwrap();
        grid.connect_consumer_to_bus(consumer, bus).unwrap();
        full_load(&mut grid, consumer);

        grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            grid.source(strong).output_power().get::<watt>(),
            100.,
            1e-9
        );
        assert_about_eq!(grid.source(weak).output_power().get::<watt>(), 50., 1e-9);
    }

    #[test]
    fn splitting_a_circuit_leaves_the_sourceless_half_inert() {
        let mut grid = CircuitManager::new();
        let fed_bus = bus_at(&mut grid, 26.);
        let far_bus = bus_at(&mut grid, 26.);
        let near = consumer_in(&mut grid, 15., 30., 100.);
        let far = consumer_in(&mut grid, 15., 30., 100.);
        let source = source_in(&mut grid, 15., 30., 200., 1.);
        grid.connect_source_to_bus(source, fed_bus).unwrap();
        grid.connect_bus_to_bus(fed_bus, far_bus).unwrap();
        grid.connect_consumer_to_bus(near, fed_bus).unwrap();
        grid.connect_consumer_to_bus(far, far_bus).unwrap();
        full_load(&mut grid, near);
        full_load(&mut grid, far);
        grid.evaluate(Duration::from_millis(1));

        grid.disconnect_bus_from_bus(fed_bus, far_bus).unwrap();
        grid.evaluate(Duration::from_millis(1));

        assert_eq!(grid.size(), 2);
        let cut_off = grid.circuit_containing(far_bus).unwrap();
        assert_about_eq!(cut_off.current().get::<ampere>(), 0., 1e-9);
        assert!(!grid.consumer(far).is_running());
        // Inert circuits do not shed: the demanded load stays on record.
        assert_about_eq!(grid.consumer(far).load().get::<ratio>(), 1., 1e-9);

        let powered = grid.circuit_containing(fed_bus).unwrap();
        assert_about_eq!(powered.current().get::<ampere>(), 100. / 26., 1e-9);
        assert_about_eq!(
            grid.source(source).output_power().get::<watt>(),
            100.,
            1e-9
        );

        // Reconnecting restores the original behavior.
        grid.connect_bus_to_bus(fed_bus, far_bus).unwrap();
        grid.evaluate(Duration::from_millis(1));
        assert!(grid.consumer(far).is_running());
        assert_about_eq!(
            grid.source(source).output_power().get::<watt>(),
            200.,
            1e-9
        );
    }

    #[test]
    fn a_circuit_without_its_source_goes_dark_but_stays_whole() {
        let (mut grid, source, bus, consumer) = simple_circuit();
        full_load(&mut grid, consumer);
        grid.evaluate(Duration::from_millis(1));

        grid.disconnect_source_from_bus(source, bus).unwrap();
        grid.evaluate(Duration::from_millis(1));

        assert_eq!(grid.size(), 1);
        let circuit = grid.circuit_containing(bus).unwrap();
        assert_about_eq!(circuit.current().get::<ampere>(), 0., 1e-9);
        assert_about_eq!(grid.source(source).output_power().get::<watt>(), 0., 1e-9);
        assert!(!grid.consumer(consumer).is_running());
    }

    /// The nine-bus, four-source network exercising multi-source
    /// apportionment and the current distribution over a deep bus tree:
    ///
    /// ```text
    /// S1              S2  S3
    /// |               |   |
    /// B1              BBBB2
    /// 1 2 |           | 5 |
    ///     B3    BBBB4     B5
    ///     3 4 | | 7 8     9 |
    ///         B6            B9
    ///         | 6 |         12 13
    ///     B7     B8
    ///     | 10   11
    ///     S4
    /// ```
    struct DeepGrid {
        grid: CircuitManager,
        buses: Vec<BusId>,
        consumers: Vec<ConsumerId>,
        sources: Vec<SourceId>,
    }

    fn deep_grid() -> DeepGrid {
        let mut grid = CircuitManager::new();
        let buses: Vec<BusId> = (0..9).map(|_| bus_at(&mut grid, 10.)).collect();
        let (b1, b2, b3, b4, b5, b6, b7, b8, b9) = (
            buses[0], buses[1], buses[2], buses[3], buses[4], buses[5], buses[6], buses[7],
            buses[8],
        );

        let powers = [10., 20., 10., 30., 20., 50., 30., 50., 60., 30., 20., 10., 40.];
        let consumers: Vec<ConsumerId> = powers
            .iter()
            .map(|&watts| consumer_in(&mut grid, 8., 12., watts))
            .collect();

        let s1 = source_in(&mut grid, 8., 12., 200., 1.);
        let s2 = source_in(&mut grid, 8., 12., 50., 4.);
        let s3 = source_in(&mut grid, 8., 12., 50., 4.);
        let s4 = source_in(&mut grid, 8., 12., 50., 4.);

        grid.connect_source_to_bus(s1, b1).unwrap();
        grid.connect_consumer_to_bus(consumers[0], b1).unwrap();
        grid.connect_consumer_to_bus(consumers[1], b1).unwrap();
        grid.connect_consumer_to_bus(consumers[2], b3).unwrap();
        grid.connect_consumer_to_bus(consumers[3], b3).unwrap();
        grid.connect_consumer_to_bus(consumers[4], b2).unwrap();
        grid.connect_consumer_to_bus(consumers[5], b6).unwrap();
        grid.connect_consumer_to_bus(consumers[6], b4).unwrap();
        grid.connect_consumer_to_bus(consumers[7], b4).unwrap();
        grid.connect_consumer_to_bus(consumers[8], b5).unwrap();
        grid.connect_consumer_to_bus(consumers[9], b7).unwrap();
        grid.connect_consumer_to_bus(consumers[10], b8).unwrap();
        grid.connect_consumer_to_bus(consumers[11], b9).unwrap();
        grid.connect_consumer_to_bus(consumers[12], b9).unwrap();

        grid.connect_bus_to_bus(b1, b3).unwrap();
        grid.connect_bus_to_bus(b2, b5).unwrap();
        grid.connect_bus_to_bus(b2, b4).unwrap();
        grid.connect_bus_to_bus(b3, b6).unwrap();
        grid.connect_bus_to_bus(b4, b6).unwrap();
        grid.connect_bus_to_bus(b5, b9).unwrap();
        grid.connect_bus_to_bus(b6, b7).unwrap();
        grid.connect_bus_to_bus(b6, b8).unwrap();

        grid.connect_source_to_bus(s2, b2).unwrap();
        grid.connect_source_to_bus(s3, b2).unwrap();
        grid.connect_source_to_bus(s4, b7).unwrap();

        DeepGrid {
            grid,
            buses,
            consumers,
            sources: vec![s1, s2, s3, s4],
        }
    }

    fn deep_grid_at_load(load: f64) -> DeepGrid {
        let mut deep = deep_grid();
        for &consumer in deep.consumers.clone().iter() {
            deep.grid
                .set_consumer_load(consumer, Ratio::new::<ratio>(load));
        }
        deep
    }

    #[test]
    fn deep_network_forms_one_circuit() {
        let deep = deep_grid();
        assert_eq!(deep.grid.size(), 1);
    }

    #[test]
    fn deep_network_at_half_load() {
        let mut deep = deep_grid_at_load(0.5);
        deep.grid.evaluate(Duration::from_millis(1));

        let circuit = deep.grid.circuit_containing(deep.buses[0]).unwrap();
        assert_about_eq!(circuit.current().get::<ampere>(), 19., 1e-9);
        assert_about_eq!(
            circuit.equivalent_resistance().get::<ohm>(),
            0.52631578947368418,
            1e-9
        );

        let outputs = [
            10.857142857142858,
            2.7142857142857144,
            2.7142857142857144,
            2.7142857142857144,
        ];
        for (source, expected) in deep.sources.iter().zip(outputs.iter()) {
            assert_about_eq!(
                deep.grid.source(*source).output_current().get::<ampere>(),
                *expected,
                1e-9
            );
        }

        let throughputs = [
            10.857142857142858,
            6.5,
            9.357142857142858,
            5.071428571428571,
            5.5,
            8.571428571428571,
            2.7142857142857144,
            1.,
            2.5,
        ];
        for (bus, expected) in deep.buses.iter().zip(throughputs.iter()) {
            assert_about_eq!(
                deep.grid.bus(*bus).through_current().get::<ampere>(),
                *expected,
                1e-9
            );
        }
    }

    #[test]
    fn deep_network_at_ninety_percent_load() {
        let mut deep = deep_grid_at_load(0.9);
        deep.grid.evaluate(Duration::from_millis(1));

        let circuit = deep.grid.circuit_containing(deep.buses[0]).unwrap();
        assert_about_eq!(circuit.current().get::<ampere>(), 34.2, 1e-9);
        assert_about_eq!(
            circuit.equivalent_resistance().get::<ohm>(),
            0.29239766081871343,
            1e-9
        );

        let outputs = [
            19.542857142857144,
            4.885714285714286,
            4.885714285714286,
            4.885714285714286,
        ];
        for (source, expected) in deep.sources.iter().zip(outputs.iter()) {
            assert_about_eq!(
                deep.grid.source(*source).output_current().get::<ampere>(),
                *expected,
                1e-9
            );
        }

        let throughputs = [
            19.542857142857144,
            11.7,
            16.842857142857145,
            9.128571428571428,
            9.9,
            15.428571428571429,
            4.885714285714286,
            1.8,
            4.5,
        ];
        for (bus, expected) in deep.buses.iter().zip(throughputs.iter()) {
            assert_about_eq!(
                deep.grid.bus(*bus).through_current().get::<ampere>(),
                *expected,
                1e-9
            );
        }
    }

    #[test]
    fn deep_network_satisfies_kirchhoff_at_every_bus() {
        let mut deep = deep_grid_at_load(0.5);
        deep.grid.evaluate(Duration::from_millis(1));

        // Injected current equals extracted current over the circuit.
        let injected: f64 = deep
            .sources
            .iter()
            .map(|&source| deep.grid.source(source).output_current().get::<ampere>())
            .sum();
        let extracted: f64 = deep
            .consumers
            .iter()
            .map(|&consumer| deep.grid.consumer(consumer).input_current().get::<ampere>())
            .sum();
        assert_about_eq!(injected, extracted, 1e-9);
    }

    #[test]
    fn evaluation_is_idempotent_while_nothing_changes() {
        let mut deep = deep_grid_at_load(0.5);
        deep.grid.evaluate(Duration::from_millis(1));
        let before: Vec<f64> = deep
            .buses
            .iter()
            .map(|&bus| deep.grid.bus(bus).through_current().get::<ampere>())
            .collect();

        deep.grid.evaluate(Duration::from_millis(1));
        deep.grid.evaluate(Duration::from_secs(5));

        for (&bus, &expected) in deep.buses.iter().zip(before.iter()) {
            assert_about_eq!(
                deep.grid.bus(bus).through_current().get::<ampere>(),
                expected,
                1e-9
            );
        }
    }

    #[test]
    fn standby_draw_keeps_idle_consumers_barely_alive() {
        let (mut grid, source, _, consumer) = simple_circuit();
        // Requested load 0 clamps to the standby floor.
        grid.set_consumer_load(consumer, Ratio::new::<ratio>(0.));

        grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            grid.consumer(consumer).current_power().get::<watt>(),
            0.1,
            1e-9
        );
        assert_about_eq!(
            grid.source(source).output_power().get::<watt>(),
            0.1,
            1e-9
        );
        assert!(grid.consumer(consumer).is_running());
    }
}
