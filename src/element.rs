use uom::si::{electric_potential::volt, f64::*};

/// Identifies a [`Consumer`](crate::Consumer) within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) usize);

/// Identifies a [`Source`](crate::source::Source) within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) usize);

/// Identifies a [`Battery`](crate::Battery) within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatteryId(pub(crate) usize);

/// Identifies a [`Converter`](crate::Converter) within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConverterId(pub(crate) usize);

/// Identifies a [`Bus`](crate::Bus) within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub(crate) usize);

/// An element seen through its child (drawing) face.
///
/// Buses appear here because a bus may be the child of another bus;
/// batteries appear because a charging battery draws from its bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildRef {
    Consumer(ConsumerId),
    Battery(BatteryId),
    Converter(ConverterId),
    Bus(BusId),
}

/// An element seen through its parent (feeding) face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParentRef {
    Source(SourceId),
    Battery(BatteryId),
    Converter(ConverterId),
    Bus(BusId),
}

impl From<ConsumerId> for ChildRef {
    fn from(id: ConsumerId) -> Self {
        ChildRef::Consumer(id)
    }
}
impl From<SourceId> for ParentRef {
    fn from(id: SourceId) -> Self {
        ParentRef::Source(id)
    }
}
impl From<BatteryId> for ChildRef {
    fn from(id: BatteryId) -> Self {
        ChildRef::Battery(id)
    }
}
impl From<BatteryId> for ParentRef {
    fn from(id: BatteryId) -> Self {
        ParentRef::Battery(id)
    }
}
impl From<ConverterId> for ChildRef {
    fn from(id: ConverterId) -> Self {
        ChildRef::Converter(id)
    }
}
impl From<ConverterId> for ParentRef {
    fn from(id: ConverterId) -> Self {
        ParentRef::Converter(id)
    }
}
impl From<BusId> for ChildRef {
    fn from(id: BusId) -> Self {
        ChildRef::Bus(id)
    }
}
impl From<BusId> for ParentRef {
    fn from(id: BusId) -> Self {
        ParentRef::Bus(id)
    }
}

/// The voltage band an element is able to operate in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoltageRange {
    min: ElectricPotential,
    max: ElectricPotential,
}
impl VoltageRange {
    pub fn new(min: ElectricPotential, max: ElectricPotential) -> Self {
        debug_assert!(min <= max);
        Self { min, max }
    }

    pub fn from_volts(min: f64, max: f64) -> Self {
        Self::new(
            ElectricPotential::new::<volt>(min),
            ElectricPotential::new::<volt>(max),
        )
    }

    pub fn min(&self) -> ElectricPotential {
        self.min
    }

    pub fn max(&self) -> ElectricPotential {
        self.max
    }

    pub fn contains(&self, potential: ElectricPotential) -> bool {
        self.min <= potential && potential <= self.max
    }
}

/// Two elements may only form a relationship when they operate in the
/// same location, unless one of them is global (`None`). Buses and
/// converters are always global.
pub(crate) fn locations_compatible(a: Option<u32>, b: Option<u32>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
