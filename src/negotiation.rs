//! Presentation context negotiation for association acceptors.
//!
//! [`AcceptorOptions`] describes what an acceptor is willing to serve:
//! its application entity title, the abstract syntaxes it supports,
//! its ordered transfer syntax preferences,
//! and the admission policy for calling and called AE titles.
//! [`AcceptorOptions::negotiate`] evaluates an A-ASSOCIATE-RQ against
//! those options and produces either the full A-ASSOCIATE-AC to send back,
//! or the A-ASSOCIATE-RJ which turns the association down.
use std::borrow::Cow;

use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, Pdu, PresentationContextNegotiated,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
    DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// The default application context name,
/// the only one defined by the standard.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implicit VR Little Endian, the default transfer syntax.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Trait for checking whether an incoming association
/// should be accepted based on the AE titles at play.
pub trait AccessControl: std::fmt::Debug {
    /// Check that the association requestor is allowed in,
    /// returning the rejection reason otherwise.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any requestor,
/// disregarding the AE titles in the request.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts the association requestor
/// only if the called AE title matches the acceptor's own title.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// The outcome of evaluating an association request:
/// the PDU to send back, plus negotiated parameters on acceptance.
#[derive(Debug)]
pub enum NegotiationOutcome {
    Accepted {
        /// the A-ASSOCIATE-AC to send back
        response: Pdu,
        /// the agreed association parameters
        negotiated: NegotiatedOptions,
    },
    Rejected {
        /// the A-ASSOCIATE-RJ to send back
        response: Pdu,
    },
}

/// The parameters agreed upon when an association is accepted,
/// on either side of the negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedOptions {
    /// the peer's application entity title
    pub peer_ae_title: String,
    /// our own application entity title on this association
    pub ae_title: String,
    /// the full set of presentation context results, in request order
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the peer's maximum PDU length
    /// (`0` on the wire means unlimited and is normalized
    /// to the engine's absolute maximum)
    pub peer_max_pdu_length: u32,
    /// our own maximum PDU length
    pub max_pdu_length: u32,
    /// the peer's asynchronous operations window, when announced
    pub async_operations_window: Option<(u16, u16)>,
    /// the peer's implementation class UID, when announced
    pub peer_implementation_class_uid: Option<String>,
    /// the peer's implementation version name, when announced
    pub peer_implementation_version_name: Option<String>,
}

impl NegotiatedOptions {
    /// The presentation contexts which were accepted.
    pub fn accepted_contexts(
        &self,
    ) -> impl Iterator<Item = &PresentationContextNegotiated> + '_ {
        self.presentation_contexts
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
    }

    /// Look up an accepted presentation context by its identifier.
    pub fn context_by_id(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.accepted_contexts().find(|pc| pc.id == id)
    }

    /// The effective maximum PDU length for outbound P-Data,
    /// the smaller of the two announced maxima.
    pub fn effective_max_pdu_length(&self) -> u32 {
        Ord::min(self.peer_max_pdu_length, self.max_pdu_length)
    }
}

/// Pull the user variables of interest out of an associate PDU.
pub(crate) fn extract_user_variables(
    user_variables: &[UserVariableItem],
) -> (u32, Option<(u16, u16)>, Option<String>, Option<String>) {
    let mut max_pdu = DEFAULT_MAX_PDU;
    let mut async_window = None;
    let mut class_uid = None;
    let mut version_name = None;
    for item in user_variables {
        match item {
            UserVariableItem::MaxLength(0) => max_pdu = MAXIMUM_PDU_SIZE,
            UserVariableItem::MaxLength(value) => max_pdu = *value,
            UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                async_window = Some((*invoked, *performed));
            }
            UserVariableItem::ImplementationClassUID(uid) => class_uid = Some(uid.clone()),
            UserVariableItem::ImplementationVersionName(name) => {
                version_name = Some(name.clone());
            }
            _ => {}
        }
    }
    (max_pdu, async_window, class_uid, version_name)
}

/// Association acceptor options.
///
/// The setters consume and return the options value,
/// so that parameters can be chained:
///
/// ```
/// use dicom_ulp::negotiation::AcceptorOptions;
///
/// let options = AcceptorOptions::new()
///     .ae_title("MAIN-STORAGE")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .with_transfer_syntax("1.2.840.10008.1.2.1")
///     .max_pdu_length(65_536);
/// ```
#[derive(Debug)]
pub struct AcceptorOptions<'a> {
    /// the acceptor's application entity title
    pub(crate) ae_title: Cow<'a, str>,
    /// the application context name to expect
    application_context_name: Cow<'a, str>,
    /// the abstract syntaxes this acceptor serves
    abstract_syntaxes: Vec<Cow<'a, str>>,
    /// the supported transfer syntaxes, in order of preference
    transfer_syntaxes: Vec<Cow<'a, str>>,
    /// the maximum PDU length to announce
    pub(crate) max_pdu_length: u32,
    /// whether to receive PDUs under strict size rules
    pub(crate) strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// the protocol version to accept
    protocol_version: u16,
    /// the access control policy for incoming requests
    access_control: Box<dyn AccessControl + Send + Sync>,
}

impl<'a> Default for AcceptorOptions<'a> {
    fn default() -> Self {
        AcceptorOptions {
            ae_title: "ANY-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.into()],
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            protocol_version: 1,
            access_control: Box::new(AcceptAny),
        }
    }
}

impl<'a> AcceptorOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of the acceptor.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Add an abstract syntax to the list of services provided.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntaxes.push(abstract_syntax.into());
        self
    }

    /// Add a transfer syntax to the set of encodings supported,
    /// after the ones already added.
    ///
    /// The order of addition is the order of preference:
    /// the first supported transfer syntax also proposed by the
    /// requestor wins, regardless of the requestor's own ordering.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntax = transfer_syntax.into();
        if !self.transfer_syntaxes.contains(&transfer_syntax) {
            self.transfer_syntaxes.push(transfer_syntax);
        }
        self
    }

    /// Replace the supported transfer syntaxes wholesale,
    /// in order of preference.
    pub fn transfer_syntaxes<I, T>(mut self, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntaxes = transfer_syntaxes.into_iter().map(Into::into).collect();
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

    /// Accept and serve any proposed abstract syntax,
    /// rather than only the ones added explicitly.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Change the access control policy to accept any association
    /// regardless of the AE titles in the request.
    ///
    /// This is the default behavior.
    pub fn accept_any(self) -> Self {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// only if the called AE title matches this acceptor's title.
    pub fn accept_called_ae_title(self) -> Self {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy to a custom rule.
    pub fn ae_access_control(
        mut self,
        access_control: impl AccessControl + Send + Sync + 'static,
    ) -> Self {
        self.access_control = Box::new(access_control);
        self
    }

    /// Evaluate an association request against these options.
    pub fn negotiate(&self, rq: &AssociationRQ) -> NegotiationOutcome {
        if rq.protocol_version != self.protocol_version {
            return reject(AssociationRJServiceUserReason::NoReasonGiven);
        }

        if rq.application_context_name != self.application_context_name {
            return reject(AssociationRJServiceUserReason::ApplicationContextNameNotSupported);
        }

        if let Err(reason) = self.access_control.check_access(
            &self.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
        ) {
            return reject(reason);
        }

        let mut negotiated_contexts = Vec::with_capacity(rq.presentation_contexts.len());
        let mut accepted = 0;
        for proposed in &rq.presentation_contexts {
            let known_abstract_syntax = self
                .abstract_syntaxes
                .iter()
                .any(|asy| asy == &proposed.abstract_syntax);
            let (reason, transfer_syntax) = if known_abstract_syntax || self.promiscuous {
                match self.choose_transfer_syntax(&proposed.transfer_syntaxes) {
                    Some(ts) => (PresentationContextResultReason::Acceptance, ts.to_string()),
                    None => (
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                        proposed
                            .transfer_syntaxes
                            .first()
                            .cloned()
                            .unwrap_or_default(),
                    ),
                }
            } else {
                (
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    proposed
                        .transfer_syntaxes
                        .first()
                        .cloned()
                        .unwrap_or_default(),
                )
            };

            if reason == PresentationContextResultReason::Acceptance {
                accepted += 1;
            }
            negotiated_contexts.push(PresentationContextNegotiated {
                id: proposed.id,
                reason,
                transfer_syntax,
                abstract_syntax: proposed.abstract_syntax.clone(),
            });
        }

        // an association with no usable presentation context
        // is not worth keeping open
        if accepted == 0 {
            return reject(AssociationRJServiceUserReason::NoReasonGiven);
        }

        let (peer_max_pdu, async_window, peer_class_uid, peer_version_name) =
            extract_user_variables(&rq.user_variables);

        let response = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: negotiated_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason,
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            user_variables: vec![
                UserVariableItem::MaxLength(self.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        NegotiationOutcome::Accepted {
            response,
            negotiated: NegotiatedOptions {
                peer_ae_title: rq.calling_ae_title.clone(),
                ae_title: self.ae_title.to_string(),
                presentation_contexts: negotiated_contexts,
                peer_max_pdu_length: peer_max_pdu,
                max_pdu_length: self.max_pdu_length,
                async_operations_window: async_window,
                peer_implementation_class_uid: peer_class_uid,
                peer_implementation_version_name: peer_version_name,
            },
        }
    }

    /// Pick a transfer syntax for one presentation context:
    /// the first of our preferences also proposed by the requestor.
    fn choose_transfer_syntax(&self, proposed: &[String]) -> Option<&str> {
        self.transfer_syntaxes
            .iter()
            .map(|ts| ts.as_ref())
            .find(|ts| proposed.iter().any(|p| p == ts))
    }
}

fn reject(reason: AssociationRJServiceUserReason) -> NegotiationOutcome {
    NegotiationOutcome::Rejected {
        response: Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(reason),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;
    use matches::assert_matches;

    fn base_rq(contexts: Vec<PresentationContextProposed>) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "MAIN-STORAGE".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: contexts,
            user_variables: vec![
                UserVariableItem::MaxLength(32_768),
                UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
            ],
        }
    }

    #[test]
    fn acceptor_preference_order_wins() {
        // acceptor prefers X over Y, requestor proposes Y before X
        let options = AcceptorOptions::new()
            .ae_title("MAIN-STORAGE")
            .with_abstract_syntax("1.2.840.10008.1.1")
            .transfer_syntaxes(["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"]);
        let rq = base_rq(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
        }]);

        match options.negotiate(&rq) {
            NegotiationOutcome::Accepted { negotiated, .. } => {
                let pc = negotiated.context_by_id(1).unwrap();
                assert_eq!(pc.transfer_syntax, "1.2.840.10008.1.2.1");
                assert_eq!(negotiated.peer_max_pdu_length, 32_768);
                assert_eq!(negotiated.effective_max_pdu_length(), DEFAULT_MAX_PDU);
            }
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }
    }

    #[test]
    fn sole_unsupported_abstract_syntax_rejects_the_association() {
        let options = AcceptorOptions::new()
            .ae_title("MAIN-STORAGE")
            .with_abstract_syntax("1.2.840.10008.1.1");
        let rq = base_rq(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }]);

        assert_matches!(
            options.negotiate(&rq),
            NegotiationOutcome::Rejected {
                response: Pdu::AssociationRJ(AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::NoReasonGiven
                    ),
                }),
            }
        );
    }

    #[test]
    fn mixed_proposal_accepts_some_and_refuses_others() {
        let options = AcceptorOptions::new()
            .ae_title("MAIN-STORAGE")
            .with_abstract_syntax("1.2.840.10008.1.1");
        let rq = base_rq(vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 5,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.4.50".to_string()],
            },
        ]);

        match options.negotiate(&rq) {
            NegotiationOutcome::Accepted { negotiated, response } => {
                assert_eq!(negotiated.presentation_contexts.len(), 3);
                assert_eq!(
                    negotiated.presentation_contexts[0].reason,
                    PresentationContextResultReason::Acceptance
                );
                assert_eq!(
                    negotiated.presentation_contexts[1].reason,
                    PresentationContextResultReason::AbstractSyntaxNotSupported
                );
                assert_eq!(
                    negotiated.presentation_contexts[2].reason,
                    PresentationContextResultReason::TransferSyntaxesNotSupported
                );
                assert!(negotiated.context_by_id(3).is_none());
                assert_matches!(response, Pdu::AssociationAC(_));
            }
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }
    }

    #[test]
    fn called_ae_title_mismatch_is_rejected_when_enforced() {
        let options = AcceptorOptions::new()
            .ae_title("OTHER-STORAGE")
            .with_abstract_syntax("1.2.840.10008.1.1")
            .accept_called_ae_title();
        let rq = base_rq(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }]);

        assert_matches!(
            options.negotiate(&rq),
            NegotiationOutcome::Rejected {
                response: Pdu::AssociationRJ(AssociationRJ {
                    source: AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::CalledAETitleNotRecognized
                    ),
                    ..
                }),
            }
        );
    }

    #[test]
    fn promiscuous_mode_accepts_unknown_abstract_syntaxes() {
        let options = AcceptorOptions::new().ae_title("PROXY").promiscuous(true);
        let rq = base_rq(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }]);

        assert_matches!(
            options.negotiate(&rq),
            NegotiationOutcome::Accepted { .. }
        );
    }

    #[test]
    fn unknown_application_context_is_rejected() {
        let options = AcceptorOptions::new()
            .ae_title("MAIN-STORAGE")
            .with_abstract_syntax("1.2.840.10008.1.1");
        let mut rq = base_rq(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }]);
        rq.application_context_name = "1.2.3.999".to_string();

        assert_matches!(
            options.negotiate(&rq),
            NegotiationOutcome::Rejected {
                response: Pdu::AssociationRJ(AssociationRJ {
                    source: AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                    ),
                    ..
                }),
            }
        );
    }

    #[test]
    fn wire_max_pdu_of_zero_means_unlimited() {
        let (max_pdu, ..) = extract_user_variables(&[UserVariableItem::MaxLength(0)]);
        assert_eq!(max_pdu, MAXIMUM_PDU_SIZE);
    }
}
