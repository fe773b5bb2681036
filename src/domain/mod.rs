// src/domain/mod.rs

//! Value types shared by every layer: destinations, endpoints, messages,
//! broker settings and transport events. Nothing here talks to a broker.

mod destination;
mod endpoint;
mod event;
mod message;
mod transport_info;

pub use destination::{Destination, EndpointUsage, PublicationAddress};
pub use endpoint::{Endpoint, SerializationFormat};
pub use event::{TransportEvent, TransportEventNotification};
pub use message::BinaryMessage;
pub use transport_info::{TransportInfo, DEFAULT_MESSAGING};
