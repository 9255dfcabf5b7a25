//! Protocol-level tests over loopback TCP associations.
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;

use dicom_ulp::association::dimse::{DatasetHandling, DatasetPayload, DimseMessage};
use dicom_ulp::association::{
    Association, AssociationHandler, AssociationState, EngineOptions, RequestorOptions,
    ThreadingMode,
};
use dicom_ulp::command::{
    build_command_set, CommandField, CommandSet, NO_DATA_SET, TAG_COMMAND_DATA_SET_TYPE,
    TAG_COMMAND_FIELD, TAG_MESSAGE_ID, TAG_MESSAGE_ID_BEING_RESPONDED_TO, TAG_STATUS,
};
use dicom_ulp::negotiation::AcceptorOptions;
use dicom_ulp::pdu::{AssociationRJ, AssociationRJServiceUserReason, AssociationRJSource};
use dicom_ulp::transport::SocketOptions;
use dicom_ulp::ListenerRegistry;

const VERIFICATION: &str = "1.2.840.10008.1.1";
const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

fn echo_rq(message_id: u16) -> Vec<u8> {
    build_command_set(&[
        (TAG_COMMAND_FIELD, CommandField::CEchoRq as u16),
        (TAG_MESSAGE_ID, message_id),
        (TAG_COMMAND_DATA_SET_TYPE, NO_DATA_SET),
    ])
}

fn echo_rsp(request: &CommandSet) -> Vec<u8> {
    build_command_set(&[
        (TAG_COMMAND_FIELD, CommandField::CEchoRsp as u16),
        (
            TAG_MESSAGE_ID_BEING_RESPONDED_TO,
            request.message_id.unwrap_or(0),
        ),
        (TAG_COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        (TAG_STATUS, 0x0000),
    ])
}

fn store_rq(message_id: u16) -> Vec<u8> {
    build_command_set(&[
        (TAG_COMMAND_FIELD, CommandField::CStoreRq as u16),
        (TAG_MESSAGE_ID, message_id),
        (TAG_COMMAND_DATA_SET_TYPE, 0x0000),
    ])
}

/// Serves C-ECHO and C-STORE style messages,
/// forwarding received data sets to the test thread.
struct ServerHandler {
    received: Sender<(u16, DatasetPayload)>,
}

impl AssociationHandler for ServerHandler {
    fn on_dimse_command(
        &mut self,
        _association: &Association,
        _command: &CommandSet,
    ) -> DatasetHandling {
        DatasetHandling::Buffer
    }

    fn on_dimse_request(&mut self, association: &Association, message: DimseMessage) {
        let response = echo_rsp(&message.command);
        let _ = self.received.send((message.command.command_field, message.data_set));
        association
            .send_dimse(message.presentation_context_id, &response, None)
            .unwrap();
    }
}

#[derive(Debug)]
enum ClientEvent {
    Accepted,
    Rejected(AssociationRJ),
    Response(Option<u16>),
    ReleaseConfirmed,
    Timeout,
}

struct ClientHandler {
    events: Sender<ClientEvent>,
}

impl AssociationHandler for ClientHandler {
    fn on_associate_accepted(
        &mut self,
        _association: &Association,
        _negotiated: &dicom_ulp::negotiation::NegotiatedOptions,
    ) {
        let _ = self.events.send(ClientEvent::Accepted);
    }

    fn on_associate_rejected(&mut self, _association: &Association, rejection: &AssociationRJ) {
        let _ = self.events.send(ClientEvent::Rejected(rejection.clone()));
    }

    fn on_dimse_response(&mut self, _association: &Association, message: DimseMessage) {
        let _ = self.events.send(ClientEvent::Response(message.command.status));
    }

    fn on_release_confirmed(&mut self, _association: &Association) {
        let _ = self.events.send(ClientEvent::ReleaseConfirmed);
    }

    fn on_dimse_timeout(&mut self, _association: &Association) {
        let _ = self.events.send(ClientEvent::Timeout);
    }
}

fn start_server(
    options: AcceptorOptions<'static>,
    engine_options: EngineOptions,
) -> (Arc<ListenerRegistry>, SocketAddr, std::sync::mpsc::Receiver<(u16, DatasetPayload)>) {
    let registry = Arc::new(ListenerRegistry::new());
    let (tx, rx) = channel();
    let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = registry
        .register(
            endpoint,
            options,
            engine_options,
            SocketOptions::default(),
            Arc::new(move || {
                Box::new(ServerHandler {
                    received: tx.clone(),
                })
            }),
        )
        .unwrap();
    (registry, bound, rx)
}

#[test]
fn echo_round_trip_with_server_preference() {
    let (registry, addr, server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION)
            // the acceptor prefers explicit little endian
            .transfer_syntaxes([EXPLICIT_LE, IMPLICIT_LE]),
        EngineOptions::default(),
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        // the requestor proposes them the other way around
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_LE, EXPLICIT_LE])
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(association.wait_established(Duration::from_secs(2)));
    let negotiated = association.negotiated().unwrap();
    let context = negotiated.accepted_contexts().next().unwrap();
    // the acceptor's preference order decides
    assert_eq!(context.transfer_syntax, EXPLICIT_LE);

    association.send_dimse(context.id, &echo_rq(1), None).unwrap();

    let (field, payload) = server_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(field, CommandField::CEchoRq as u16);
    assert_eq!(payload, DatasetPayload::None);

    let mut accepted = false;
    let mut status = None;
    for _ in 0..2 {
        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            ClientEvent::Accepted => accepted = true,
            ClientEvent::Response(s) => status = Some(s),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(accepted);
    assert_eq!(status, Some(Some(0)));

    association.send_release_request().unwrap();
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::ReleaseConfirmed => {}
        other => panic!("unexpected event: {:?}", other),
    }

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn sole_unsupported_abstract_syntax_yields_rejection() {
    let (registry, addr, _server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
        EngineOptions::default(),
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("ECHO-SCP")
        .with_presentation_context(SECONDARY_CAPTURE, vec![IMPLICIT_LE])
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(!association.wait_established(Duration::from_secs(2)));
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::Rejected(AssociationRJ {
            source: AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
            ..
        }) => {}
        other => panic!("unexpected event: {:?}", other),
    }

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn unknown_called_ae_title_yields_rejection() {
    let (registry, addr, _server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
        EngineOptions::default(),
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("NOBODY-HOME")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_LE])
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(!association.wait_established(Duration::from_secs(2)));
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::Rejected(AssociationRJ {
            source:
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            ..
        }) => {}
        other => panic!("unexpected event: {:?}", other),
    }

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn large_data_set_crosses_the_wire_byte_exact() {
    let (registry, addr, server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("STORE-SCP")
            .with_abstract_syntax(SECONDARY_CAPTURE)
            .max_pdu_length(4096),
        EngineOptions::default(),
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_presentation_context(SECONDARY_CAPTURE, vec![IMPLICIT_LE])
        .max_pdu_length(4096)
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(association.wait_established(Duration::from_secs(2)));
    let negotiated = association.negotiated().unwrap();
    let context = negotiated.accepted_contexts().next().unwrap();
    assert_eq!(negotiated.effective_max_pdu_length(), 4096);

    // ten times the maximum PDU length forces fragmentation
    let payload: Vec<u8> = (0..40_960u32).map(|i| (i % 253) as u8).collect();
    association
        .send_dimse(context.id, &store_rq(7), Some(&payload))
        .unwrap();

    let (field, data_set) = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(field, CommandField::CStoreRq as u16);
    assert_eq!(
        data_set,
        DatasetPayload::Buffered {
            bytes: payload,
            truncated: false,
        }
    );

    // the storage response comes back
    let mut saw_response = false;
    for _ in 0..2 {
        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            ClientEvent::Accepted => {}
            ClientEvent::Response(_) => saw_response = true,
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(saw_response);
    assert!(association.counters().messages_sent >= 1);

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn multi_threaded_mode_behaves_like_single() {
    let mut engine_options = EngineOptions::default();
    engine_options.threading = ThreadingMode::Multi;
    let (registry, addr, server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
        engine_options,
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_LE])
        .threading(ThreadingMode::Multi)
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(association.wait_established(Duration::from_secs(2)));
    let context_id = association
        .negotiated()
        .unwrap()
        .accepted_contexts()
        .next()
        .unwrap()
        .id;

    for message_id in 1..=3 {
        association
            .send_dimse(context_id, &echo_rq(message_id), None)
            .unwrap();
    }
    for _ in 0..3 {
        server_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    let mut responses = 0;
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while responses < 3 && std::time::Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
            if let ClientEvent::Response(_) = event {
                responses += 1;
            }
        }
    }
    assert_eq!(responses, 3);

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn idle_timer_reports_timeouts_while_established() {
    let (registry, addr, _server_rx) = start_server(
        AcceptorOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
        EngineOptions::default(),
    );

    let (events_tx, events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_LE])
        .artim_timeout(Duration::from_millis(300))
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    assert!(association.wait_established(Duration::from_secs(2)));

    // no traffic: the timeout callback fires,
    // and the association survives it
    let mut saw_timeout = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !saw_timeout && std::time::Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(ClientEvent::Timeout) => saw_timeout = true,
            Ok(_) => {}
            Err(_) => {}
        }
    }
    assert!(saw_timeout);
    assert_eq!(association.state(), AssociationState::Established);

    association.shutdown(Duration::from_secs(1));
    registry.close_all();
}

#[test]
fn idle_timer_closes_an_unanswered_associate_request() {
    // a listener that accepts and then stays silent
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(3));
        drop(stream);
    });

    let (events_tx, _events) = channel();
    let association = RequestorOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("SILENT")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_LE])
        .artim_timeout(Duration::from_millis(300))
        .establish(addr, Box::new(ClientHandler { events: events_tx }))
        .unwrap();

    // no answer ever comes, the machine must reach the terminal state
    assert!(!association.wait_established(Duration::from_secs(2)));
    assert_eq!(association.state(), AssociationState::Idle);

    association.shutdown(Duration::from_secs(1));
    server.join().unwrap();
}
