//! Association handling.
//!
//! An [`Association`] drives one DICOM upper layer association
//! over a [`Transport`]: it owns the protocol state machine,
//! the idle timer, the DIMSE fragmentation and reassembly pipeline,
//! and the loops which pump PDUs in and out of the stream.
//!
//! Requestors start from [`RequestorOptions`]:
//!
//! ```no_run
//! # use dicom_ulp::association::{RequestorOptions, AssociationHandler};
//! # struct MyHandler;
//! # impl AssociationHandler for MyHandler {}
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let association = RequestorOptions::new()
//!     .calling_ae_title("STORE-SCU")
//!     .called_ae_title("MAIN-STORAGE")
//!     .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2"])
//!     .establish("127.0.0.1:11111", Box::new(MyHandler))?;
//! # Ok(())
//! # }
//! ```
//!
//! Acceptors are normally built through the
//! [`ListenerRegistry`](crate::listener::ListenerRegistry),
//! which constructs one `Association` per accepted connection.
//!
//! Application behavior is plugged in through [`AssociationHandler`];
//! the engine invokes its callbacks as PDUs arrive and messages
//! are assembled, never more than one call at a time per association.
pub mod dimse;
pub mod queue;

use bytes::{BufMut, BytesMut};
use snafu::{Backtrace, ResultExt, Snafu};
use std::borrow::Cow;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::command::CommandSet;
use crate::negotiation::{
    extract_user_variables, AcceptorOptions, NegotiatedOptions, NegotiationOutcome,
    APPLICATION_CONTEXT_NAME,
};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ,
    AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::transport::{SocketOptions, TcpTransport, Transport};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use dimse::{
    fragment_message, DatasetHandling, DimseMessage, Reassembly, ReassemblyEvent,
};
use queue::{recv_cancellable, CancelToken};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not connect to peer: {}", source))]
    Connect {
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize PDU to be sent: {}", source))]
    Serialize {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    #[snafu(display("Could not write PDU to the transport: {}", source))]
    WireSend {
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Operation `{}` is illegal in state {:?}", operation, state))]
    IllegalCall {
        operation: &'static str,
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("Association is shutting down, could not enqueue PDU"))]
    QueueClosed { backtrace: Backtrace },

    #[snafu(display("Association establishment failed: association rejected"))]
    Rejected { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The protocol machine states of an association,
/// numbered as in the standard, part 8, table 9-10.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssociationState {
    /// Sta1: idle, no association and no transport
    Idle,
    /// Sta2: connection accepted, awaiting the associate request
    TransportOpen,
    /// Sta3: associate request received, awaiting the local response
    AwaitingLocalResponse,
    /// Sta4: awaiting the transport connection to open (requestor)
    AwaitingTransportConnect,
    /// Sta5: associate request sent, awaiting A-ASSOCIATE-AC or -RJ
    AwaitingAssociateResponse,
    /// Sta6: association established, data transfer may proceed
    Established,
    /// Sta7: release requested, awaiting A-RELEASE-RP
    AwaitingReleaseResponse,
    /// Sta8: release request received, awaiting the local confirmation
    AwaitingReleaseLocalUser,
    /// Sta9: release collision, requestor side awaiting local response
    ReleaseCollisionRequestor,
    /// Sta10: release collision, acceptor side awaiting A-RELEASE-RP
    ReleaseCollisionAcceptor,
    /// Sta11: release collision, requestor side awaiting A-RELEASE-RP
    ReleaseCollisionRequestorResponded,
    /// Sta12: release collision, acceptor side awaiting local response
    ReleaseCollisionAcceptorResponded,
    /// Sta13: association over, awaiting transport close
    AwaitingTransportClose,
}

/// How many threads an association runs its loops on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ThreadingMode {
    /// One loop: PDUs are sent and dispatched inline
    /// on the read loop's call stack.
    #[default]
    Single,
    /// Three loops: reading, writing, and handler dispatch
    /// each run on their own thread,
    /// decoupled through cancellation-aware queues.
    Multi,
}

/// Application callbacks invoked by the association engine.
///
/// Every method has a default implementation,
/// so a handler only overrides the events it cares about.
/// At most one callback is outstanding per association at a time.
/// A panic inside a callback is caught, logged,
/// and converted into an abort of the association.
#[allow(unused_variables)]
pub trait AssociationHandler: Send {
    /// An associate request has arrived and passed negotiation checks
    /// are about to run. Return `false` to turn the association down
    /// outright, before presentation context negotiation.
    fn on_associate_request(
        &mut self,
        association: &Association,
        request: &AssociationRQ,
    ) -> bool {
        true
    }

    /// The association is established,
    /// on this side with the given negotiated parameters.
    fn on_associate_accepted(
        &mut self,
        association: &Association,
        negotiated: &NegotiatedOptions,
    ) {
    }

    /// The peer rejected the association.
    fn on_associate_rejected(&mut self, association: &Association, rejection: &AssociationRJ) {}

    /// A complete DIMSE command set announcing a data set has arrived.
    /// The returned [`DatasetHandling`] decides whether the data set
    /// is buffered in memory or streamed into a sink.
    fn on_dimse_command(
        &mut self,
        association: &Association,
        command: &CommandSet,
    ) -> DatasetHandling {
        DatasetHandling::Buffer
    }

    /// A complete DIMSE request message has arrived.
    fn on_dimse_request(&mut self, association: &Association, message: DimseMessage) {}

    /// A complete DIMSE response message has arrived.
    fn on_dimse_response(&mut self, association: &Association, message: DimseMessage) {}

    /// A complete DIMSE message with an unrecognized command field
    /// has arrived.
    fn on_dimse(&mut self, association: &Association, message: DimseMessage) {}

    /// The peer asked to release the association.
    /// Return `true` (the default) to confirm the release right away;
    /// return `false` to finish pending work first and call
    /// [`Association::send_release_response`] later.
    fn on_release_requested(&mut self, association: &Association) -> bool {
        true
    }

    /// The peer confirmed a release requested by this side.
    fn on_release_confirmed(&mut self, association: &Association) {}

    /// The peer aborted the association.
    fn on_abort(&mut self, association: &Association, source: &AbortRQSource) {}

    /// The transport failed underneath the association.
    fn on_network_error(&mut self, association: &Association, error: &std::io::Error) {}

    /// The idle timer expired while the association was established.
    fn on_dimse_timeout(&mut self, association: &Association) {}
}

/// A handler that reacts to nothing,
/// standing in until the real handler is resolved.
struct NullHandler;

impl AssociationHandler for NullHandler {}

/// Options common to both sides of an association,
/// governing the engine loops rather than negotiation.
#[derive(Clone)]
pub struct EngineOptions {
    /// how the loops are threaded
    pub threading: ThreadingMode,
    /// the idle timer period; when absent,
    /// the transport read timeout or 60 seconds
    pub artim_timeout: Option<Duration>,
    /// whether command and data set fragments may share a PDU
    pub combine_command_data: bool,
    /// stop buffering inbound data sets at this element tag
    pub stop_tag: Option<(u16, u16)>,
    /// called with the byte count of every PDU written out
    pub pdu_sent_hook: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            threading: ThreadingMode::default(),
            artim_timeout: None,
            combine_command_data: false,
            stop_tag: None,
            pdu_sent_hook: None,
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("threading", &self.threading)
            .field("artim_timeout", &self.artim_timeout)
            .field("combine_command_data", &self.combine_command_data)
            .field("stop_tag", &self.stop_tag)
            .field("pdu_sent_hook", &self.pdu_sent_hook.as_ref().map(|_| ".."))
            .finish()
    }
}

/// The fallback idle timer period when nothing else is configured.
const DEFAULT_ARTIM_TIMEOUT: Duration = Duration::from_secs(60);

/// Association requestor options.
///
/// The setters consume and return the options value,
/// so that parameters can be chained.
#[derive(Debug)]
pub struct RequestorOptions<'a> {
    calling_ae_title: Cow<'a, str>,
    called_ae_title: Cow<'a, str>,
    application_context_name: Cow<'a, str>,
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    max_pdu_length: u32,
    strict: bool,
    socket_options: SocketOptions,
    engine_options: EngineOptions,
}

impl<'a> Default for RequestorOptions<'a> {
    fn default() -> Self {
        RequestorOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
            engine_options: EngineOptions::default(),
        }
    }
}

impl<'a> RequestorOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of the requestor.
    pub fn calling_ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = ae_title.into();
        self
    }

    /// Define the application entity title to call.
    pub fn called_ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = ae_title.into();
        self
    }

    /// Propose one presentation context:
    /// an abstract syntax with its transfer syntax candidates
    /// in order of preference.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax: T,
        transfer_syntaxes: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Override the maximum PDU length to announce.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether to reject inbound PDUs larger than the announced maximum.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override the socket options of the TCP connection.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    /// Override the read timeout of the TCP connection.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Run the association on three loops instead of one.
    pub fn threading(mut self, mode: ThreadingMode) -> Self {
        self.engine_options.threading = mode;
        self
    }

    /// Override the idle timer period.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.engine_options.artim_timeout = Some(timeout);
        self
    }

    /// Allow command and data set fragments to share a PDU.
    pub fn combine_command_data(mut self, combine: bool) -> Self {
        self.engine_options.combine_command_data = combine;
        self
    }

    /// Stop buffering inbound data sets at the given element tag.
    pub fn stop_before_tag(mut self, tag: (u16, u16)) -> Self {
        self.engine_options.stop_tag = Some(tag);
        self
    }

    /// Install a hook called with the byte count of every PDU sent.
    pub fn on_pdu_sent<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.engine_options.pdu_sent_hook = Some(Arc::new(hook));
        self
    }

    /// Connect to the given peer, start the engine loops,
    /// and send the associate request.
    ///
    /// The call returns as soon as the request is on the wire;
    /// establishment is reported through
    /// [`AssociationHandler::on_associate_accepted`],
    /// or may be awaited with [`Association::wait_established`].
    pub fn establish<A: std::net::ToSocketAddrs>(
        self,
        address: A,
        handler: Box<dyn AssociationHandler>,
    ) -> Result<Arc<Association>> {
        let transport = TcpTransport::connect(address, &self.socket_options)
            .context(ConnectSnafu)?;
        self.establish_with(Box::new(transport), handler)
    }

    /// Like [`establish`](Self::establish),
    /// over an already connected transport.
    pub fn establish_with(
        self,
        transport: Box<dyn Transport>,
        handler: Box<dyn AssociationHandler>,
    ) -> Result<Arc<Association>> {
        let request = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .enumerate()
                .map(|(i, (abstract_syntax, transfer_syntaxes))| {
                    PresentationContextProposed {
                        // odd identifiers, as mandated by the standard
                        id: (i as u8) * 2 + 1,
                        abstract_syntax: abstract_syntax.to_string(),
                        transfer_syntaxes: transfer_syntaxes
                            .iter()
                            .map(|ts| ts.to_string())
                            .collect(),
                    }
                })
                .collect(),
            user_variables: vec![
                UserVariableItem::MaxLength(self.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        };

        let artim = resolve_artim(&self.engine_options, &self.socket_options);
        let association = Association::new(
            transport,
            AssociationState::AwaitingTransportConnect,
            Role::Requestor(request),
            self.max_pdu_length,
            self.strict,
            self.engine_options,
            artim,
        );
        Association::spawn_loops(&association, handler)?;
        association.send_associate_request()?;
        Ok(association)
    }
}

fn resolve_artim(engine: &EngineOptions, socket: &SocketOptions) -> Duration {
    engine
        .artim_timeout
        .or(socket.read_timeout)
        .unwrap_or(DEFAULT_ARTIM_TIMEOUT)
}

/// Which side of the association this engine plays,
/// with the side-specific negotiation inputs.
enum Role {
    /// the request to be sent, kept for matching against the answer
    Requestor(AssociationRQ),
    /// acceptor with fixed options
    Acceptor(Arc<AcceptorOptions<'static>>),
    /// acceptor whose options and handler are resolved
    /// from the called AE title of the incoming request
    Multiplexed(AcceptorResolver),
}

/// Resolves a called AE title into acceptor options and a handler.
pub type AcceptorResolver = Box<
    dyn Fn(&str) -> Option<(Arc<AcceptorOptions<'static>>, Box<dyn AssociationHandler>)>
        + Send
        + Sync,
>;

/// Snapshot of the traffic counters of an association.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

struct ArtimState {
    deadline: Instant,
    period: Duration,
}

/// A unit of work for the process loop:
/// a handler invocation bound to its trigger.
type DispatchTask = Box<dyn FnOnce(&mut Box<dyn AssociationHandler>) + Send>;

/// The write side of the transport,
/// with a scratch buffer reused across PDU serializations.
struct WriterHalf {
    transport: Box<dyn Transport>,
    buffer: BytesMut,
}

/// One DICOM upper layer association over a transport.
///
/// All operations take `&self`;
/// the association is shared between its loops
/// and the owning application through an [`Arc`].
pub struct Association {
    state: Mutex<AssociationState>,
    /// writes are serialized here, apart from the state lock,
    /// since sends may run concurrently with inbound dispatch
    writer: Mutex<WriterHalf>,
    role: Mutex<Role>,
    negotiated: Mutex<Option<NegotiatedOptions>>,
    artim: Mutex<ArtimState>,
    reassembly: Mutex<Reassembly>,
    cancel: CancelToken,
    engine_options: EngineOptions,
    max_pdu_length: u32,
    strict: bool,
    pdu_queue: Mutex<Option<Sender<Pdu>>>,
    dispatch_queue: Mutex<Option<Sender<DispatchTask>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    peer_description: String,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state())
            .field("peer", &self.peer_description)
            .finish()
    }
}

impl Association {
    fn new(
        transport: Box<dyn Transport>,
        state: AssociationState,
        role: Role,
        max_pdu_length: u32,
        strict: bool,
        engine_options: EngineOptions,
        artim_period: Duration,
    ) -> Arc<Self> {
        let stop_tag = engine_options.stop_tag;
        let peer_description = transport.peer_description();
        Arc::new(Association {
            state: Mutex::new(state),
            writer: Mutex::new(WriterHalf {
                transport,
                buffer: BytesMut::with_capacity(max_pdu_length as usize),
            }),
            role: Mutex::new(role),
            negotiated: Mutex::new(None),
            artim: Mutex::new(ArtimState {
                deadline: Instant::now() + artim_period,
                period: artim_period,
            }),
            reassembly: Mutex::new(Reassembly::new(stop_tag)),
            cancel: CancelToken::new(),
            engine_options,
            max_pdu_length,
            strict,
            pdu_queue: Mutex::new(None),
            dispatch_queue: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            peer_description,
        })
    }

    /// Start an acceptor-side association over an accepted connection
    /// with fixed options and handler.
    pub fn accept(
        transport: Box<dyn Transport>,
        options: Arc<AcceptorOptions<'static>>,
        engine_options: EngineOptions,
        handler: Box<dyn AssociationHandler>,
    ) -> Result<Arc<Association>> {
        let artim = engine_options
            .artim_timeout
            .unwrap_or(DEFAULT_ARTIM_TIMEOUT);
        let max_pdu_length = options.max_pdu_length;
        let strict = options.strict;
        let association = Association::new(
            transport,
            AssociationState::TransportOpen,
            Role::Acceptor(options),
            max_pdu_length,
            strict,
            engine_options,
            artim,
        );
        Association::spawn_loops(&association, handler)?;
        Ok(association)
    }

    /// Start an acceptor-side association whose options and handler
    /// are chosen by the called AE title of the incoming request.
    pub(crate) fn accept_multiplexed(
        transport: Box<dyn Transport>,
        resolver: AcceptorResolver,
        engine_options: EngineOptions,
    ) -> Result<Arc<Association>> {
        let artim = engine_options
            .artim_timeout
            .unwrap_or(DEFAULT_ARTIM_TIMEOUT);
        let association = Association::new(
            transport,
            AssociationState::TransportOpen,
            Role::Multiplexed(resolver),
            DEFAULT_MAX_PDU,
            true,
            engine_options,
            artim,
        );
        Association::spawn_loops(&association, Box::new(NullHandler))?;
        Ok(association)
    }

    /// The current protocol machine state.
    pub fn state(&self) -> AssociationState {
        *lock(&self.state)
    }

    /// The negotiated association parameters,
    /// available once the association is established.
    pub fn negotiated(&self) -> Option<NegotiatedOptions> {
        lock(&self.negotiated).clone()
    }

    /// A description of the connected peer.
    pub fn peer_description(&self) -> &str {
        &self.peer_description
    }

    /// A snapshot of the traffic counters.
    pub fn counters(&self) -> Counters {
        Counters {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Block until the association is established,
    /// or the given timeout elapses,
    /// or the association reaches a terminal state.
    ///
    /// Returns whether the association is established.
    pub fn wait_established(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                AssociationState::Established => return true,
                AssociationState::Idle | AssociationState::AwaitingTransportClose => {
                    return false
                }
                _ if Instant::now() >= deadline || self.cancel.is_cancelled() => return false,
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    // ---- send operations ----

    /// Send the A-ASSOCIATE-RQ prepared from the requestor options.
    ///
    /// Legal in `Idle` and `AwaitingTransportConnect`.
    pub fn send_associate_request(&self) -> Result<()> {
        let request = {
            let role = lock(&self.role);
            match &*role {
                Role::Requestor(request) => request.clone(),
                _ => {
                    drop(role);
                    return Err(self.illegal("send_associate_request", self.state()));
                }
            }
        };
        self.transition(
            &[
                AssociationState::Idle,
                AssociationState::AwaitingTransportConnect,
            ],
            AssociationState::AwaitingAssociateResponse,
            "send_associate_request",
        )?;
        self.enqueue_pdu(Pdu::AssociationRQ(request))
    }

    /// Negotiate the given associate request against the acceptor
    /// options and send back the A-ASSOCIATE-AC or -RJ accordingly.
    ///
    /// Legal in `AwaitingLocalResponse`.
    pub fn send_associate_accept(&self, request: &AssociationRQ) -> Result<()> {
        let options = {
            let role = lock(&self.role);
            match &*role {
                Role::Acceptor(options) => Arc::clone(options),
                _ => {
                    drop(role);
                    return Err(self.illegal("send_associate_accept", self.state()));
                }
            }
        };
        match options.negotiate(request) {
            NegotiationOutcome::Accepted {
                response,
                negotiated,
            } => {
                self.transition(
                    &[AssociationState::AwaitingLocalResponse],
                    AssociationState::Established,
                    "send_associate_accept",
                )?;
                debug!(peer = %self.peer_description, "association accepted");
                *lock(&self.negotiated) = Some(negotiated);
                self.enqueue_pdu(response)
            }
            NegotiationOutcome::Rejected { response } => {
                self.transition(
                    &[AssociationState::AwaitingLocalResponse],
                    AssociationState::AwaitingTransportClose,
                    "send_associate_accept",
                )?;
                debug!(peer = %self.peer_description, "association rejected in negotiation");
                self.enqueue_pdu(response)
            }
        }
    }

    /// Reject the pending associate request with the given reason.
    ///
    /// Legal in `AwaitingLocalResponse`.
    pub fn send_associate_reject(
        &self,
        reason: crate::pdu::AssociationRJServiceUserReason,
    ) -> Result<()> {
        self.transition(
            &[AssociationState::AwaitingLocalResponse],
            AssociationState::AwaitingTransportClose,
            "send_associate_reject",
        )?;
        self.enqueue_pdu(Pdu::AssociationRJ(AssociationRJ {
            result: crate::pdu::AssociationRJResult::Permanent,
            source: crate::pdu::AssociationRJSource::ServiceUser(reason),
        }))
    }

    /// Send raw presentation data values in one P-DATA-TF PDU.
    ///
    /// Legal in `Established`,
    /// and in `AwaitingReleaseLocalUser` for an acceptor
    /// still flushing responses before confirming a release.
    pub fn send_pdata(&self, data: Vec<crate::pdu::PDataValue>) -> Result<()> {
        self.check_state(
            &[
                AssociationState::Established,
                AssociationState::AwaitingReleaseLocalUser,
            ],
            "send_pdata",
        )?;
        self.enqueue_pdu(Pdu::PData { data })
    }

    /// Fragment and send one DIMSE message:
    /// a command set and an optional data set,
    /// cut to the effective maximum PDU length.
    ///
    /// Legal in the same states as [`send_pdata`](Self::send_pdata).
    pub fn send_dimse(
        &self,
        presentation_context_id: u8,
        command: &[u8],
        data_set: Option<&[u8]>,
    ) -> Result<()> {
        self.check_state(
            &[
                AssociationState::Established,
                AssociationState::AwaitingReleaseLocalUser,
            ],
            "send_dimse",
        )?;
        let max_pdu_length = lock(&self.negotiated)
            .as_ref()
            .map(|negotiated| negotiated.effective_max_pdu_length())
            .unwrap_or(self.max_pdu_length)
            .min(MAXIMUM_PDU_SIZE);
        let pdus = fragment_message(
            presentation_context_id,
            command,
            data_set,
            max_pdu_length,
            self.engine_options.combine_command_data,
        );
        for pdu in pdus {
            self.enqueue_pdu(pdu)?;
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the peer to release the association.
    ///
    /// Legal in `Established`.
    pub fn send_release_request(&self) -> Result<()> {
        self.transition(
            &[AssociationState::Established],
            AssociationState::AwaitingReleaseResponse,
            "send_release_request",
        )?;
        self.enqueue_pdu(Pdu::ReleaseRQ)
    }

    /// Confirm the release requested by the peer.
    ///
    /// Legal in `AwaitingReleaseLocalUser`.
    pub fn send_release_response(&self) -> Result<()> {
        self.transition(
            &[AssociationState::AwaitingReleaseLocalUser],
            AssociationState::AwaitingTransportClose,
            "send_release_response",
        )?;
        self.enqueue_pdu(Pdu::ReleaseRP)
    }

    /// Abort the association on behalf of the application.
    ///
    /// Legal in every state except `Idle` and `AwaitingTransportClose`.
    pub fn send_abort(&self) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            AssociationState::Idle | AssociationState::AwaitingTransportClose
        ) {
            return Err(self.illegal("send_abort", state));
        }
        self.abort_with(AbortRQSource::ServiceUser);
        Ok(())
    }

    /// Wind the association down:
    /// cancel the loops, close the transport,
    /// and join every loop thread other than the calling one,
    /// waiting at most for the given timeout.
    pub fn shutdown(&self, timeout: Duration) {
        self.force_close();
        let deadline = Instant::now() + timeout;
        let handles = std::mem::take(&mut *lock(&self.threads));
        for handle in handles {
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            if Instant::now() >= deadline {
                // out of time, the thread is left to wind down on its own
                warn!(peer = %self.peer_description, "shutdown timed out joining loops");
                break;
            }
            if handle.join().is_err() {
                error!(peer = %self.peer_description, "association loop panicked");
            }
        }
    }

    // ---- internals ----

    fn check_state(&self, legal: &[AssociationState], operation: &'static str) -> Result<()> {
        let state = self.state();
        if legal.contains(&state) {
            Ok(())
        } else {
            Err(self.illegal(operation, state))
        }
    }

    fn transition(
        &self,
        legal: &[AssociationState],
        to: AssociationState,
        operation: &'static str,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if legal.contains(&*state) {
            debug!(from = ?*state, to = ?to, operation, "state transition");
            *state = to;
            Ok(())
        } else {
            let current = *state;
            drop(state);
            Err(self.illegal(operation, current))
        }
    }

    /// Like `transition`, for inbound PDUs: a PDU arriving in a state
    /// where it is not expected is a peer protocol error,
    /// answered with a provider abort rather than a service-user abort.
    fn transition_on_pdu(
        &self,
        legal: &[AssociationState],
        to: AssociationState,
        pdu_name: &'static str,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if legal.contains(&*state) {
            debug!(from = ?*state, to = ?to, operation = pdu_name, "state transition");
            *state = to;
            Ok(())
        } else {
            let current = *state;
            drop(state);
            warn!(pdu = pdu_name, state = ?current, "unexpected PDU, aborting association");
            if !matches!(
                current,
                AssociationState::Idle | AssociationState::AwaitingTransportClose
            ) {
                self.abort_with(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ));
            }
            IllegalCallSnafu {
                operation: pdu_name,
                state: current,
            }
            .fail()
        }
    }

    /// Record an illegal operation:
    /// nothing of the attempted PDU is written,
    /// and the association is aborted.
    fn illegal(&self, operation: &'static str, state: AssociationState) -> Error {
        warn!(operation, state = ?state, "illegal operation, aborting association");
        if !matches!(
            state,
            AssociationState::Idle | AssociationState::AwaitingTransportClose
        ) {
            self.abort_with(AbortRQSource::ServiceUser);
        }
        IllegalCallSnafu { operation, state }.build()
    }

    /// Send an abort PDU (best effort) and force the association closed.
    fn abort_with(&self, source: AbortRQSource) {
        {
            let mut state = lock(&self.state);
            if matches!(
                *state,
                AssociationState::Idle | AssociationState::AwaitingTransportClose
            ) {
                return;
            }
            *state = AssociationState::AwaitingTransportClose;
        }
        if let Err(e) = self.write_now(&Pdu::AbortRQ { source }) {
            debug!(peer = %self.peer_description, "abort PDU not delivered: {}", e);
        }
        self.force_close();
    }

    /// Cancel the loops and close the transport.
    fn force_close(&self) {
        self.cancel.cancel();
        // dropping the senders unblocks the queues
        lock(&self.pdu_queue).take();
        lock(&self.dispatch_queue).take();
        lock(&self.reassembly).cancel();
        if let Err(e) = lock(&self.writer).transport.close() {
            debug!(peer = %self.peer_description, "transport close: {}", e);
        }
        *lock(&self.state) = AssociationState::Idle;
    }

    /// Queue a PDU for sending,
    /// or write it inline in single-threaded mode.
    fn enqueue_pdu(&self, pdu: Pdu) -> Result<()> {
        match self.engine_options.threading {
            ThreadingMode::Single => self.write_now(&pdu),
            ThreadingMode::Multi => {
                let queue = lock(&self.pdu_queue);
                match queue.as_ref().map(|tx| tx.send(pdu)) {
                    Some(Ok(())) => Ok(()),
                    _ => QueueClosedSnafu.fail(),
                }
            }
        }
    }

    /// Serialize and write one PDU to the transport.
    fn write_now(&self, pdu: &Pdu) -> Result<()> {
        let pdu_length;
        {
            let mut writer = lock(&self.writer);
            let WriterHalf { transport, buffer } = &mut *writer;
            buffer.clear();
            write_pdu(&mut (&mut *buffer).writer(), pdu).context(SerializeSnafu)?;
            pdu_length = buffer.len() as u64;
            transport.write_all(buffer).context(WireSendSnafu)?;
            transport.flush().context(WireSendSnafu)?;
        }
        self.bytes_sent.fetch_add(pdu_length, Ordering::Relaxed);
        self.reset_artim();
        debug!(peer = %self.peer_description, pdu = %pdu.short_description(), "sent PDU");
        if let Some(hook) = &self.engine_options.pdu_sent_hook {
            hook(pdu_length);
        }
        Ok(())
    }

    fn reset_artim(&self) {
        let mut artim = lock(&self.artim);
        artim.deadline = Instant::now() + artim.period;
    }

    fn artim_expired(&self) -> bool {
        Instant::now() >= lock(&self.artim).deadline
    }

    fn spawn_loops(this: &Arc<Self>, handler: Box<dyn AssociationHandler>) -> Result<()> {
        let reader = lock(&this.writer).transport.try_clone().context(ConnectSnafu)?;
        let mut threads = Vec::new();
        match this.engine_options.threading {
            ThreadingMode::Single => {
                let assoc = Arc::clone(this);
                threads.push(std::thread::spawn(move || {
                    read_loop(assoc, reader, Dispatcher::Inline(handler));
                }));
            }
            ThreadingMode::Multi => {
                let (pdu_tx, pdu_rx) = channel::<Pdu>();
                let (task_tx, task_rx) = channel::<DispatchTask>();
                *lock(&this.pdu_queue) = Some(pdu_tx);
                *lock(&this.dispatch_queue) = Some(task_tx.clone());

                let assoc = Arc::clone(this);
                threads.push(std::thread::spawn(move || {
                    write_loop(assoc, pdu_rx);
                }));
                let assoc = Arc::clone(this);
                threads.push(std::thread::spawn(move || {
                    process_loop(assoc, task_rx, handler);
                }));
                let assoc = Arc::clone(this);
                threads.push(std::thread::spawn(move || {
                    read_loop(assoc, reader, Dispatcher::Queue(task_tx));
                }));
            }
        }
        *lock(&this.threads) = threads;
        Ok(())
    }
}

/// Acquire a mutex, recovering the guard if a loop panicked with it held.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Where inbound PDUs are dispatched to.
enum Dispatcher {
    /// single-threaded: the read loop owns the handler
    Inline(Box<dyn AssociationHandler>),
    /// multi-threaded: dispatch closures go to the process loop
    Queue(Sender<DispatchTask>),
}

impl Dispatcher {
    fn dispatch(&mut self, assoc: &Arc<Association>, pdu: Pdu) {
        match self {
            Dispatcher::Inline(handler) => handle_pdu(assoc, handler, pdu),
            Dispatcher::Queue(tx) => {
                let assoc = Arc::clone(assoc);
                if tx
                    .send(Box::new(move |handler| handle_pdu(&assoc, handler, pdu)))
                    .is_err()
                {
                    // process loop is gone, the association is over
                }
            }
        }
    }

    fn network_error(&mut self, assoc: &Arc<Association>, error: std::io::Error) {
        match self {
            Dispatcher::Inline(handler) => {
                guarded(assoc, |handler, assoc| {
                    handler.on_network_error(assoc, &error)
                }, handler);
            }
            Dispatcher::Queue(tx) => {
                let assoc2 = Arc::clone(assoc);
                let _ = tx.send(Box::new(move |handler| {
                    guarded(&assoc2, |handler, assoc| {
                        handler.on_network_error(assoc, &error)
                    }, handler);
                }));
            }
        }
    }

    fn timeout(&mut self, assoc: &Arc<Association>) {
        match self {
            Dispatcher::Inline(handler) => {
                guarded(assoc, |handler, assoc| handler.on_dimse_timeout(assoc), handler);
            }
            Dispatcher::Queue(tx) => {
                let assoc2 = Arc::clone(assoc);
                let _ = tx.send(Box::new(move |handler| {
                    guarded(&assoc2, |handler, assoc| handler.on_dimse_timeout(assoc), handler);
                }));
            }
        }
    }
}

/// Run a handler callback with panic containment:
/// a panicking handler aborts the association
/// instead of taking the loop down.
fn guarded<R>(
    assoc: &Arc<Association>,
    call: impl FnOnce(&mut Box<dyn AssociationHandler>, &Association) -> R,
    handler: &mut Box<dyn AssociationHandler>,
) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(|| call(handler, assoc))) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(peer = %assoc.peer_description, "handler panicked, aborting association");
            assoc.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ));
            None
        }
    }
}

/// Counts the bytes pulled through a reader.
struct CountingReader<'a> {
    inner: &'a mut Box<dyn Transport>,
    counter: &'a AtomicU64,
}

impl std::io::Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// How long the read loop waits on the socket per poll.
const READ_POLL: Duration = Duration::from_millis(50);

fn read_loop(assoc: Arc<Association>, mut transport: Box<dyn Transport>, mut dispatcher: Dispatcher) {
    while !assoc.cancel.is_cancelled() {
        match transport.has_data_available(READ_POLL) {
            Ok(true) => {
                let pdu = {
                    let mut reader = CountingReader {
                        inner: &mut transport,
                        counter: &assoc.bytes_received,
                    };
                    read_pdu(&mut reader, assoc.max_pdu_length, assoc.strict)
                };
                match pdu {
                    Ok(pdu) => {
                        assoc.reset_artim();
                        debug!(peer = %assoc.peer_description, pdu = %pdu.short_description(), "received PDU");
                        dispatcher.dispatch(&assoc, pdu);
                    }
                    Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => {
                        // peer closed the connection
                        let state = assoc.state();
                        if state != AssociationState::AwaitingTransportClose
                            && state != AssociationState::Idle
                        {
                            dispatcher.network_error(
                                &assoc,
                                std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "peer closed the connection",
                                ),
                            );
                        }
                        assoc.force_close();
                    }
                    Err(e) => {
                        // malformed traffic is fatal
                        error!(peer = %assoc.peer_description, "PDU decoding failed: {}", e);
                        assoc.abort_with(AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::InvalidPduParameter,
                        ));
                    }
                }
            }
            Ok(false) => {
                if assoc.artim_expired() {
                    handle_artim_expiry(&assoc, &mut dispatcher);
                }
            }
            Err(e) => {
                let state = assoc.state();
                if state != AssociationState::AwaitingTransportClose
                    && state != AssociationState::Idle
                {
                    error!(peer = %assoc.peer_description, "transport failure: {}", e);
                    dispatcher.network_error(&assoc, e);
                }
                assoc.force_close();
            }
        }
    }
}

fn handle_artim_expiry(assoc: &Arc<Association>, dispatcher: &mut Dispatcher) {
    let state = assoc.state();
    match state {
        AssociationState::Established => {
            debug!(peer = %assoc.peer_description, "idle timer expired while established");
            assoc.reset_artim();
            dispatcher.timeout(assoc);
        }
        AssociationState::TransportOpen | AssociationState::AwaitingAssociateResponse => {
            // the peer never followed through, give up
            error!(peer = %assoc.peer_description, state = ?state, "timed out awaiting peer");
            assoc.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ));
        }
        AssociationState::AwaitingTransportClose => {
            assoc.force_close();
        }
        _ => {
            assoc.reset_artim();
            dispatcher.timeout(assoc);
        }
    }
}

fn write_loop(assoc: Arc<Association>, queue: Receiver<Pdu>) {
    while let Some(pdu) = recv_cancellable(&queue, &assoc.cancel) {
        if let Err(e) = assoc.write_now(&pdu) {
            error!(peer = %assoc.peer_description, "PDU write failed: {}", e);
            if let Error::WireSend { source, .. } = e {
                let queue = lock(&assoc.dispatch_queue).clone();
                if let Some(tx) = queue {
                    let assoc2 = Arc::clone(&assoc);
                    let _ = tx.send(Box::new(move |handler| {
                        guarded(&assoc2, |handler, assoc| {
                            handler.on_network_error(assoc, &source)
                        }, handler);
                    }));
                }
            }
            assoc.force_close();
            break;
        }
    }
}

fn process_loop(
    assoc: Arc<Association>,
    queue: Receiver<DispatchTask>,
    mut handler: Box<dyn AssociationHandler>,
) {
    while let Some(task) = recv_cancellable(&queue, &assoc.cancel) {
        task(&mut handler);
    }
}

/// Dispatch one inbound PDU against the state machine.
fn handle_pdu(assoc: &Arc<Association>, handler: &mut Box<dyn AssociationHandler>, pdu: Pdu) {
    match pdu {
        Pdu::AssociationRQ(request) => handle_associate_rq(assoc, handler, request),
        Pdu::AssociationAC(ac) => {
            if assoc
                .transition_on_pdu(
                    &[AssociationState::AwaitingAssociateResponse],
                    AssociationState::Established,
                    "associate-ac",
                )
                .is_err()
            {
                return;
            }
            let negotiated = {
                let role = lock(&assoc.role);
                match &*role {
                    Role::Requestor(request) => requestor_negotiated(request, &ac),
                    _ => return,
                }
            };
            *lock(&assoc.negotiated) = Some(negotiated.clone());
            guarded(assoc, |handler, assoc| {
                handler.on_associate_accepted(assoc, &negotiated)
            }, handler);
        }
        Pdu::AssociationRJ(rejection) => {
            if assoc
                .transition_on_pdu(
                    &[AssociationState::AwaitingAssociateResponse],
                    AssociationState::AwaitingTransportClose,
                    "associate-rj",
                )
                .is_err()
            {
                return;
            }
            guarded(assoc, |handler, assoc| {
                handler.on_associate_rejected(assoc, &rejection)
            }, handler);
            assoc.force_close();
        }
        Pdu::PData { data } => handle_pdata(assoc, handler, data),
        Pdu::ReleaseRQ => {
            let state = assoc.state();
            match state {
                AssociationState::Established => {
                    if assoc
                        .transition_on_pdu(
                            &[AssociationState::Established],
                            AssociationState::AwaitingReleaseLocalUser,
                            "release-rq",
                        )
                        .is_err()
                    {
                        return;
                    }
                    let confirm = guarded(
                        assoc,
                        |handler, assoc| handler.on_release_requested(assoc),
                        handler,
                    );
                    if confirm == Some(true) {
                        if let Err(e) = assoc.send_release_response() {
                            debug!(peer = %assoc.peer_description, "release response: {}", e);
                        }
                    }
                }
                AssociationState::AwaitingReleaseResponse => {
                    // release collision; both sides asked,
                    // answer right away and wait for the close
                    let _ = assoc.transition_on_pdu(
                        &[AssociationState::AwaitingReleaseResponse],
                        AssociationState::AwaitingTransportClose,
                        "release-collision",
                    );
                    if let Err(e) = assoc.enqueue_pdu(Pdu::ReleaseRP) {
                        debug!(peer = %assoc.peer_description, "release response: {}", e);
                    }
                }
                _ => {
                    assoc.abort_with(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ));
                }
            }
        }
        Pdu::ReleaseRP => {
            if assoc
                .transition_on_pdu(
                    &[
                        AssociationState::AwaitingReleaseResponse,
                        AssociationState::AwaitingTransportClose,
                    ],
                    AssociationState::AwaitingTransportClose,
                    "release-rp",
                )
                .is_err()
            {
                return;
            }
            guarded(assoc, |handler, assoc| handler.on_release_confirmed(assoc), handler);
            // as the release requestor, this side closes the transport
            assoc.force_close();
        }
        Pdu::AbortRQ { source } => {
            debug!(peer = %assoc.peer_description, "association aborted by peer");
            guarded(assoc, |handler, assoc| handler.on_abort(assoc, &source), handler);
            assoc.force_close();
        }
        Pdu::Unknown { pdu_type, .. } => {
            warn!(peer = %assoc.peer_description, pdu_type, "unrecognized PDU type");
            assoc.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            ));
        }
    }
}

fn handle_associate_rq(
    assoc: &Arc<Association>,
    handler: &mut Box<dyn AssociationHandler>,
    request: AssociationRQ,
) {
    if assoc
        .transition_on_pdu(
            &[AssociationState::TransportOpen],
            AssociationState::AwaitingLocalResponse,
            "associate-rq",
        )
        .is_err()
    {
        return;
    }

    // resolve the serving AE title first when multiplexing
    let resolved = {
        let role = lock(&assoc.role);
        match &*role {
            Role::Multiplexed(resolver) => Some(resolver(&request.called_ae_title)),
            _ => None,
        }
    };
    match resolved {
        Some(Some((options, new_handler))) => {
            *handler = new_handler;
            *lock(&assoc.role) = Role::Acceptor(options);
        }
        Some(None) => {
            debug!(
                peer = %assoc.peer_description,
                called = %request.called_ae_title,
                "called AE title not registered here"
            );
            if let Err(e) = assoc.send_associate_reject(
                crate::pdu::AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ) {
                debug!(peer = %assoc.peer_description, "associate reject: {}", e);
            }
            return;
        }
        None => {}
    }

    let admitted = guarded(
        assoc,
        |handler, assoc| handler.on_associate_request(assoc, &request),
        handler,
    );
    match admitted {
        Some(true) => {
            let outcome = assoc.send_associate_accept(&request);
            if outcome.is_ok() && assoc.state() == AssociationState::Established {
                if let Some(negotiated) = assoc.negotiated() {
                    guarded(assoc, |handler, assoc| {
                        handler.on_associate_accepted(assoc, &negotiated)
                    }, handler);
                }
            }
        }
        Some(false) => {
            if let Err(e) = assoc.send_associate_reject(
                crate::pdu::AssociationRJServiceUserReason::NoReasonGiven,
            ) {
                debug!(peer = %assoc.peer_description, "associate reject: {}", e);
            }
        }
        None => {}
    }
}

fn handle_pdata(
    assoc: &Arc<Association>,
    handler: &mut Box<dyn AssociationHandler>,
    data: Vec<crate::pdu::PDataValue>,
) {
    let state = assoc.state();
    if !matches!(
        state,
        AssociationState::Established
            | AssociationState::AwaitingReleaseResponse
            | AssociationState::AwaitingReleaseLocalUser
    ) {
        assoc.abort_with(AbortRQSource::ServiceProvider(
            AbortRQServiceProviderReason::UnexpectedPdu,
        ));
        return;
    }

    for value in data {
        let event = lock(&assoc.reassembly).push(value);
        match event {
            Ok(ReassemblyEvent::Pending) => {}
            Ok(ReassemblyEvent::CommandComplete(command)) => {
                let handling = guarded(
                    assoc,
                    |handler, assoc| handler.on_dimse_command(assoc, &command),
                    handler,
                );
                match handling {
                    Some(handling) => lock(&assoc.reassembly).set_dataset_handling(handling),
                    None => return,
                }
            }
            Ok(ReassemblyEvent::MessageComplete(message)) => {
                assoc.messages_received.fetch_add(1, Ordering::Relaxed);
                dispatch_message(assoc, handler, message);
            }
            Err(e) => {
                error!(peer = %assoc.peer_description, "reassembly failed: {}", e);
                assoc.abort_with(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ));
                return;
            }
        }
    }
}

fn dispatch_message(
    assoc: &Arc<Association>,
    handler: &mut Box<dyn AssociationHandler>,
    message: DimseMessage,
) {
    use crate::command::MessageClass;
    match message.command.class {
        MessageClass::Request(_) => {
            guarded(assoc, |handler, assoc| handler.on_dimse_request(assoc, message), handler);
        }
        MessageClass::Response(_) => {
            guarded(assoc, |handler, assoc| {
                handler.on_dimse_response(assoc, message)
            }, handler);
        }
        MessageClass::Unclassified(field) => {
            warn!(peer = %assoc.peer_description, field, "unrecognized command field");
            guarded(assoc, |handler, assoc| handler.on_dimse(assoc, message), handler);
        }
    }
}

/// Derive the negotiated parameters on the requestor side
/// by matching the acceptance against the original request.
fn requestor_negotiated(request: &AssociationRQ, ac: &crate::pdu::AssociationAC) -> NegotiatedOptions {
    let (peer_max_pdu, async_window, peer_class_uid, peer_version_name) =
        extract_user_variables(&ac.user_variables);
    let (local_max_pdu, ..) = extract_user_variables(&request.user_variables);
    let presentation_contexts = ac
        .presentation_contexts
        .iter()
        .map(|result| {
            let abstract_syntax = request
                .presentation_contexts
                .iter()
                .find(|proposed| proposed.id == result.id)
                .map(|proposed| proposed.abstract_syntax.clone())
                .unwrap_or_default();
            PresentationContextNegotiated {
                id: result.id,
                reason: result.reason,
                transfer_syntax: result.transfer_syntax.clone(),
                abstract_syntax,
            }
        })
        .collect();
    NegotiatedOptions {
        peer_ae_title: request.called_ae_title.clone(),
        ae_title: request.calling_ae_title.clone(),
        presentation_contexts,
        peer_max_pdu_length: peer_max_pdu,
        max_pdu_length: local_max_pdu,
        async_operations_window: async_window,
        peer_implementation_class_uid: peer_class_uid,
        peer_implementation_version_name: peer_version_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    /// A transport that records written bytes and never yields any.
    #[derive(Default)]
    struct RecordingTransport {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl std::io::Read for RecordingTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "idle"))
        }
    }

    impl Write for RecordingTransport {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for RecordingTransport {
        fn has_data_available(&mut self, timeout: Duration) -> std::io::Result<bool> {
            std::thread::sleep(timeout);
            Ok(false)
        }
        fn close(&mut self) -> std::io::Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
        fn peer_description(&self) -> String {
            "recording".to_string()
        }
        fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
            Ok(Box::new(RecordingTransport {
                written: Arc::clone(&self.written),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn association_in_state(
        state: AssociationState,
    ) -> (Arc<Association>, Arc<Mutex<Vec<u8>>>) {
        let transport = RecordingTransport::default();
        let written = Arc::clone(&transport.written);
        let assoc = Association::new(
            Box::new(transport),
            state,
            Role::Acceptor(Arc::new(AcceptorOptions::new())),
            DEFAULT_MAX_PDU,
            true,
            EngineOptions::default(),
            Duration::from_secs(60),
        );
        (assoc, written)
    }

    #[test]
    fn each_send_operation_is_illegal_somewhere() {
        // pairs of (operation, state outside its legal set)
        let cases: Vec<(
            &'static str,
            AssociationState,
            fn(&Association) -> Result<()>,
        )> = vec![
            ("send_associate_request", AssociationState::Established, |a| {
                a.send_associate_request()
            }),
            ("send_associate_accept", AssociationState::Established, |a| {
                a.send_associate_accept(&AssociationRQ {
                    protocol_version: 1,
                    calling_ae_title: "A".into(),
                    called_ae_title: "B".into(),
                    application_context_name: APPLICATION_CONTEXT_NAME.into(),
                    presentation_contexts: vec![],
                    user_variables: vec![],
                })
            }),
            (
                "send_associate_reject",
                AssociationState::Established,
                |a| {
                    a.send_associate_reject(
                        crate::pdu::AssociationRJServiceUserReason::NoReasonGiven,
                    )
                },
            ),
            ("send_pdata", AssociationState::AwaitingAssociateResponse, |a| {
                a.send_pdata(vec![])
            }),
            ("send_dimse", AssociationState::TransportOpen, |a| {
                a.send_dimse(1, &[0u8; 4], None)
            }),
            (
                "send_release_request",
                AssociationState::AwaitingReleaseResponse,
                |a| a.send_release_request(),
            ),
            ("send_release_response", AssociationState::Established, |a| {
                a.send_release_response()
            }),
            ("send_abort", AssociationState::Idle, |a| a.send_abort()),
        ];

        for (operation, state, call) in cases {
            let (assoc, written) = association_in_state(state);
            let outcome = call(&assoc);
            assert_matches!(outcome, Err(Error::IllegalCall { .. }));
            let bytes = written.lock().unwrap();
            // nothing of the attempted PDU went out;
            // at most the abort sequence did
            match bytes.first() {
                None => {}
                Some(0x07) => {}
                Some(other) => panic!(
                    "operation {} in {:?} wrote PDU type {:02X}",
                    operation, state, other
                ),
            }
            drop(bytes);
            assoc.shutdown(Duration::from_millis(100));
        }
    }

    #[test]
    fn illegal_send_triggers_the_abort_sequence() {
        let (assoc, written) = association_in_state(AssociationState::Established);
        let _ = assoc.send_release_response();
        let bytes = written.lock().unwrap();
        assert_eq!(bytes.first(), Some(&0x07));
        drop(bytes);
        assert_eq!(assoc.state(), AssociationState::Idle);
    }

    #[test]
    fn unexpected_associate_ac_gets_a_provider_abort() {
        let (assoc, written) = association_in_state(AssociationState::Established);
        let mut handler: Box<dyn AssociationHandler> = Box::new(NullHandler);
        handle_pdu(
            &assoc,
            &mut handler,
            Pdu::AssociationAC(crate::pdu::AssociationAC {
                protocol_version: 1,
                calling_ae_title: "A".into(),
                called_ae_title: "B".into(),
                application_context_name: APPLICATION_CONTEXT_NAME.into(),
                presentation_contexts: vec![],
                user_variables: vec![],
            }),
        );
        let bytes = written.lock().unwrap();
        // A-ABORT with source 2 (service-provider), reason 2 (unexpected PDU)
        assert_eq!(bytes.first(), Some(&0x07));
        assert_eq!(bytes.get(8), Some(&0x02));
        assert_eq!(bytes.get(9), Some(&0x02));
    }

    #[test]
    fn send_abort_in_idle_is_illegal_and_writes_nothing() {
        let (assoc, written) = association_in_state(AssociationState::Idle);
        assert_matches!(assoc.send_abort(), Err(Error::IllegalCall { .. }));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn release_request_moves_to_awaiting_release_response() {
        let (assoc, written) = association_in_state(AssociationState::Established);
        assoc.send_release_request().unwrap();
        assert_eq!(assoc.state(), AssociationState::AwaitingReleaseResponse);
        assert_eq!(written.lock().unwrap().first(), Some(&0x05));
    }

    #[test]
    fn pdu_sent_hook_reports_written_bytes() {
        let transport = RecordingTransport::default();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let mut engine_options = EngineOptions::default();
        engine_options.pdu_sent_hook = Some(Arc::new(move |bytes| {
            seen.fetch_add(bytes as usize, Ordering::SeqCst);
        }));
        let assoc = Association::new(
            Box::new(transport),
            AssociationState::Established,
            Role::Acceptor(Arc::new(AcceptorOptions::new())),
            DEFAULT_MAX_PDU,
            true,
            engine_options,
            Duration::from_secs(60),
        );
        assoc.send_release_request().unwrap();
        // A-RELEASE-RQ is ten bytes on the wire
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(assoc.counters().bytes_sent, 10);
    }
}
