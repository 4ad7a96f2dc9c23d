use thiserror::Error;

/// Why a connection attempt was refused. A refused connect or disconnect
/// never mutates the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("these element kinds cannot be connected directly")]
    IncompatibleKinds,
    #[error("operating voltage range does not admit the bus voltage")]
    VoltageMismatch,
    #[error("elements are bound to different locations")]
    LocationMismatch,
    #[error("element already has a bus connected on this face")]
    AlreadyConnected,
    #[error("an element cannot be connected to itself")]
    SelfConnection,
    #[error("connection would close a cycle in the network")]
    WouldCycle,
    #[error("the elements are not connected")]
    NotConnected,
}
