//! A protocol engine for the DICOM Upper Layer Protocol.
//!
//! This crate implements the stateful association protocol
//! used to exchange DIMSE messages between DICOM application entities
//! over TCP:
//!
//! - The [`pdu`] module provides data structures for the
//!   _protocol data units_ exchanged on the wire,
//!   as well as a reader and a writer for them.
//! - The [`command`] module scans DIMSE command sets
//!   for the fields which drive message dispatch.
//! - The [`negotiation`] module matches proposed presentation contexts
//!   against the contexts supported by an acceptor.
//! - The [`association`] module is the heart of the engine:
//!   the association state machine,
//!   the idle timer,
//!   and the DIMSE fragmentation and reassembly pipeline.
//! - The [`transport`] module abstracts the byte stream
//!   which carries an association.
//! - The [`listener`] module accepts inbound connections
//!   on shared local endpoints,
//!   multiplexing several registered application entity titles.
//!
//! Application-level behavior is supplied through an
//! [`AssociationHandler`](association::AssociationHandler),
//! which the engine invokes as PDUs arrive
//! and as DIMSE messages are assembled.

pub mod association;
pub mod command;
pub mod listener;
pub mod negotiation;
pub mod pdu;
pub mod transport;

/// The implementation class UID reported by this engine
/// during association negotiation.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828483747247846551239336806732082834";

/// The implementation version name reported by this engine
/// during association negotiation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-ULP 0.1.0";

// re-exports

pub use association::{Association, AssociationHandler, RequestorOptions, ThreadingMode};
pub use listener::ListenerRegistry;
pub use negotiation::AcceptorOptions;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
