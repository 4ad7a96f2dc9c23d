//! Steady-state simulation of DC power-distribution networks.
//!
//! A network is a forest of voltage-defining buses with sources feeding
//! them and consumers drawing from them. Converters bridge buses of
//! different voltages, chargeable sources (batteries) switch between
//! feeding and drawing, and a [`CircuitManager`] owns the whole graph,
//! partitions it into independent circuits and advances the simulation
//! one tick at a time with [`CircuitManager::evaluate`].

mod battery;
mod bus;
mod circuit;
mod consumer;
mod converter;
mod element;
mod error;
mod evaluation;
mod event;
mod manager;
mod source;

pub use battery::{Battery, BatterySpec, BatteryState};
pub use bus::Bus;
pub use circuit::{Circuit, SubCircuit};
pub use consumer::Consumer;
pub use converter::Converter;
pub use element::{
    BatteryId, BusId, ChildRef, ConsumerId, ConverterId, ParentRef, SourceId, VoltageRange,
};
pub use error::ConnectError;
pub use event::{
    BatteryHandler, BusHandler, ChildSwitchHandler, ConsumerHandler, ParentSwitchHandler,
    SourceLoadHandler,
};
pub use manager::CircuitManager;
pub use source::Source;
