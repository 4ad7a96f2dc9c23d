use uom::si::f64::*;

use crate::element::{BusId, ChildRef, ParentRef};

/// The tree of buses a single feed can reach downstream of its root bus.
/// Traversal does not descend below a bus that hosts another feed; the
/// nearer feed claims the shared edge.
pub struct SubCircuit {
    pub(crate) source: ParentRef,
    pub(crate) root_bus: BusId,
    pub(crate) buses: Vec<BusId>,
}

impl SubCircuit {
    pub fn source(&self) -> ParentRef {
        self.source
    }

    pub fn root_bus(&self) -> BusId {
        self.root_bus
    }

    pub fn buses(&self) -> &[BusId] {
        &self.buses
    }
}

/// A connected component of the bus graph together with the sources and
/// consumers attached to it: the unit of evaluation. All buses of a
/// circuit share one voltage.
///
/// A circuit without feeds still exists for bookkeeping; it is inert and
/// carries no current.
pub struct Circuit {
    pub(crate) voltage: ElectricPotential,
    pub(crate) buses: Vec<BusId>,
    pub(crate) sources: Vec<ParentRef>,
    pub(crate) consumers: Vec<ChildRef>,
    pub(crate) subcircuits: Vec<SubCircuit>,
    pub(crate) equivalent_resistance: ElectricalResistance,
    pub(crate) circuit_current: ElectricCurrent,
}

impl Circuit {
    pub(crate) fn new(voltage: ElectricPotential, bus: BusId) -> Self {
        Self {
            voltage,
            buses: vec![bus],
            sources: Vec::new(),
            consumers: Vec::new(),
            subcircuits: Vec::new(),
            equivalent_resistance: ElectricalResistance::new::<
                uom::si::electrical_resistance::ohm,
            >(f64::INFINITY),
            circuit_current: ElectricCurrent::new::<uom::si::electric_current::ampere>(0.),
        }
    }

    /// The common voltage of the circuit's buses.
    pub fn voltage(&self) -> ElectricPotential {
        self.voltage
    }

    /// Total current delivered into the circuit during the last tick.
    pub fn current(&self) -> ElectricCurrent {
        self.circuit_current
    }

    /// The load tree reduced to a single resistance at the circuit
    /// voltage, from the loads honored during the last tick.
    pub fn equivalent_resistance(&self) -> ElectricalResistance {
        self.equivalent_resistance
    }

    pub fn buses(&self) -> &[BusId] {
        &self.buses
    }

    /// Feeds attached to this circuit's buses: sources, batteries and
    /// converter output faces.
    pub fn sources(&self) -> &[ParentRef] {
        &self.sources
    }

    /// Draws attached to this circuit's buses: consumers, batteries and
    /// converter input faces.
    pub fn consumers(&self) -> &[ChildRef] {
        &self.consumers
    }

    pub fn subcircuits(&self) -> &[SubCircuit] {
        &self.subcircuits
    }

    pub fn contains_bus(&self, bus: BusId) -> bool {
        self.buses.contains(&bus)
    }
}
